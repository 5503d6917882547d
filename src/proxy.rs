//! Round-robin proxy pool shared by every fetch.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use rand::{rng, seq::SliceRandom};
use url::Url;

#[derive(Debug)]
pub struct ProxyRotator {
    endpoints: Vec<Url>,
    cursor: AtomicUsize,
}

impl ProxyRotator {
    /// Keeps the given order.
    pub fn new(endpoints: Vec<Url>) -> Self {
        if endpoints.len() <= 1 {
            tracing::warn!(
                count = endpoints.len(),
                "less than two proxies configured, rotation will reuse the same egress"
            );
        }
        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Shuffles once; the resulting order is then stable for the process lifetime.
    pub fn shuffled(mut endpoints: Vec<Url>) -> Self {
        endpoints.shuffle(&mut rng());
        Self::new(endpoints)
    }

    /// Next endpoint in ring order. A single shared cursor means concurrent
    /// callers see each proxy exactly once per full cycle.
    pub fn next(&self) -> Option<&Url> {
        if self.endpoints.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        let proxy = &self.endpoints[i];
        tracing::debug!(%proxy, "selected proxy");
        Some(proxy)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// One proxy per line; blank lines and `#` comments are skipped.
pub fn parse_proxy_list(content: &str) -> Result<Vec<Url>> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| Url::parse(line).with_context(|| format!("invalid proxy url {line:?}")))
        .collect()
}

pub fn load_proxy_list(path: &Path) -> Result<Vec<Url>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read proxy list {}", path.display()))?;
    parse_proxy_list(&content)
}
