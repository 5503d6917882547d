//! Turns a fetched page into an entity: display name plus numeric price.

use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use rust_decimal::Decimal;
use scraper::{Html, Selector};

use crate::entity::{Entity, EntityDetails, EntityKind};
use crate::error::{Result, TrackerError};
use crate::fetch::PageSource;
use crate::identity;

struct KindSelectors {
    names: Vec<Selector>,
    price: Selector,
}

static SELECTORS: LazyLock<[KindSelectors; 2]> = LazyLock::new(|| {
    EntityKind::ALL.map(|kind| {
        let spec = kind.spec();
        KindSelectors {
            names: spec
                .name_selectors
                .iter()
                .map(|s| Selector::parse(s).unwrap())
                .collect(),
            price: Selector::parse(spec.price_selector).unwrap(),
        }
    })
});

// "<int>.<digits>" or "<int>.--" where the dashes stand in for "no cents shown".
static PRICE_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)\.(?:[0-9]+|-+)$").unwrap());

pub struct Extractor {
    source: Arc<dyn PageSource>,
}

impl Extractor {
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self { source }
    }

    /// Fetch once, then read name and price from the same page text.
    pub async fn fetch_and_build(&self, url: &str, kind: EntityKind) -> Result<Entity> {
        let id = identity::extract_id(url, kind)?;
        let html = self.source.fetch(url).await?;
        let (name, price) = parse_page(&html, kind)?;

        tracing::debug!(%kind, id, name = name.as_str(), %price, "parsed entity");
        Ok(Entity::new(
            kind,
            EntityDetails {
                id,
                name,
                url: url.trim().to_string(),
                price,
            },
        ))
    }
}

pub fn parse_page(html: &str, kind: EntityKind) -> Result<(String, Decimal)> {
    let doc = Html::parse_document(html);
    Ok((parse_name(&doc, kind)?, parse_price(&doc, kind)?))
}

/// First non-empty text among the kind's name anchors.
pub fn parse_name(doc: &Html, kind: EntityKind) -> Result<String> {
    SELECTORS[kind as usize]
        .names
        .iter()
        .map(|sel| first_text(doc, sel))
        .find(|name| !name.is_empty())
        .ok_or(TrackerError::NameUnparsable)
}

pub fn parse_price(doc: &Html, kind: EntityKind) -> Result<Decimal> {
    let raw = first_text(doc, &SELECTORS[kind as usize].price);
    normalize_price(&raw)
}

fn first_text(doc: &Html, sel: &Selector) -> String {
    doc.select(sel)
        .next()
        .map(|e| e.text().collect::<Vec<_>>().join(" "))
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

/// `"€ 717,81"` → `717.81`, `"€ 1.234,--"` → `1234`.
///
/// Strips the currency prefix/suffix, drops German grouping dots, turns the
/// decimal comma into a dot and hands the result to [`normalize_dash`].
pub fn normalize_price(raw: &str) -> Result<Decimal> {
    let trimmed = raw
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .trim_end_matches(|c: char| !c.is_ascii_digit() && c != '-');

    let mut cleaned: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.contains(',') {
        cleaned = cleaned.replace('.', "").replace(',', ".");
    }

    normalize_dash(&cleaned).map_err(|_| TrackerError::PriceUnparsable(raw.to_string()))
}

/// Strict `<digits>.<digits>` or `<digits>.--`; nothing else is accepted.
pub fn normalize_dash(s: &str) -> Result<Decimal> {
    let caps = PRICE_SHAPE
        .captures(s)
        .ok_or_else(|| TrackerError::PriceUnparsable(s.to_string()))?;

    let parsed = if s.ends_with('-') {
        Decimal::from_str(&caps[1])
    } else {
        Decimal::from_str(s)
    };
    parsed.map_err(|_| TrackerError::PriceUnparsable(s.to_string()))
}
