//! Page fetching with bounded retries and optional proxy rotation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use tokio::time::sleep;
use url::Url;

use crate::config::FetchConfig;
use crate::error::{Result, TrackerError};
use crate::proxy::ProxyRotator;

/// Where page text comes from. The extractor and the reconciliation job only
/// see this seam.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

pub struct Fetcher {
    config: FetchConfig,
    direct: reqwest::Client,
    proxies: Option<Arc<ProxyRotator>>,
}

impl Fetcher {
    pub fn new(config: FetchConfig, proxies: Option<Arc<ProxyRotator>>) -> Result<Self> {
        let direct = build_client(&config, None)?;
        let proxies = proxies.filter(|p| !p.is_empty());
        Ok(Self {
            config,
            direct,
            proxies,
        })
    }

    fn next_proxy(&self) -> Option<Url> {
        self.proxies.as_ref().and_then(|p| p.next().cloned())
    }

    fn client_for(&self, proxy: Option<&Url>) -> Result<reqwest::Client> {
        match proxy {
            Some(p) => build_client(&self.config, Some(p)),
            None => Ok(self.direct.clone()),
        }
    }

    async fn backoff(&self) {
        let lo = self.config.backoff_ms;
        if lo == 0 {
            return;
        }
        let ms = rng().random_range(lo..=lo * 5 / 2);
        sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl PageSource for Fetcher {
    /// One GET per attempt. 200 returns the body, 403 fails immediately with
    /// `NotPublic`, 429 and network failures rotate the proxy and retry. Running
    /// out of attempts is `Blocked`.
    async fn fetch(&self, url: &str) -> Result<String> {
        let attempts = self.config.attempts.max(1);
        let mut proxy = self.next_proxy();

        for attempt in 1..=attempts {
            let client = self.client_for(proxy.as_ref())?;
            tracing::debug!(url, attempt, attempts, proxy = ?proxy.as_ref().map(Url::as_str), "fetching");

            match client.get(url).headers(base_headers()).send().await {
                Ok(rsp) => {
                    let status = rsp.status();
                    tracing::debug!(url, attempt, %status, "response");

                    match status {
                        StatusCode::OK => {
                            // Entities in the markup are decoded by the HTML parser.
                            return rsp
                                .text()
                                .await
                                .map_err(|e| TrackerError::Transient(e.to_string()));
                        }
                        StatusCode::FORBIDDEN => return Err(TrackerError::NotPublic),
                        StatusCode::TOO_MANY_REQUESTS => {
                            tracing::warn!(url, attempt, "rate limited by the price site");
                            if self.proxies.is_some() {
                                proxy = self.next_proxy();
                                tracing::info!(proxy = ?proxy.as_ref().map(Url::as_str), "switching proxy");
                            }
                        }
                        other => {
                            tracing::warn!(url, attempt, status = %other, "unexpected status");
                        }
                    }
                }
                Err(e) => {
                    // Timeouts land here too; they only burn an attempt.
                    tracing::warn!(url, attempt, error = %e, timeout = e.is_timeout(), "request failed");
                    if self.proxies.is_some() {
                        proxy = self.next_proxy();
                    }
                }
            }

            if attempt < attempts {
                self.backoff().await;
            }
        }

        tracing::error!(url, attempts, "no successful response, giving up");
        Err(TrackerError::Blocked)
    }
}

fn build_client(config: &FetchConfig, proxy: Option<&Url>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .redirect(reqwest::redirect::Policy::limited(8))
        .timeout(config.timeout());

    // Egress is chosen explicitly; never pick up proxies from the environment.
    builder = match proxy {
        Some(p) => {
            let proxy = reqwest::Proxy::all(p.as_str())
                .map_err(|e| TrackerError::Transient(format!("bad proxy {p}: {e}")))?;
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| TrackerError::Transient(format!("http client: {e}")))
}

fn base_headers() -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    h.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("de-DE,de;q=0.9,en-US;q=0.8,en;q=0.7"),
    );
    h
}
