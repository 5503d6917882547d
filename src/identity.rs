//! Maps a user supplied URL to an entity kind and its canonical numeric id.

use std::sync::LazyLock;

use regex::Regex;

use crate::entity::{EntityKey, EntityKind};
use crate::error::{Result, TrackerError};

static GRAMMARS: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    EntityKind::ALL.map(|kind| Regex::new(kind.spec().url_pattern).unwrap())
});

fn grammar(kind: EntityKind) -> &'static Regex {
    &GRAMMARS[kind as usize]
}

/// Decide which grammar `url` belongs to. Exactly one must match; anything
/// else (none, or both) is rejected rather than guessed.
pub fn classify(url: &str) -> Result<EntityKind> {
    let url = url.trim();
    let mut matched = EntityKind::ALL
        .into_iter()
        .filter(|kind| grammar(*kind).is_match(url));

    match (matched.next(), matched.next()) {
        (Some(kind), None) => Ok(kind),
        _ => Err(TrackerError::InvalidUrl(url.to_string())),
    }
}

/// Re-apply the grammar of `kind` and return the captured id.
pub fn extract_id(url: &str, kind: EntityKind) -> Result<u64> {
    let url = url.trim();
    grammar(kind)
        .captures(url)
        .and_then(|caps| caps.get(2))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .ok_or_else(|| TrackerError::InvalidUrl(url.to_string()))
}

/// `classify` followed by `extract_id`.
pub fn resolve(url: &str) -> Result<EntityKey> {
    let kind = classify(url)?;
    Ok(EntityKey::new(kind, extract_id(url, kind)?))
}
