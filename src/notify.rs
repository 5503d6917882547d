//! Delivery of price-change and removal notices to subscribers.
//!
//! The core hands over structured events; rendering chat markup is up to
//! whatever sits behind the [`Notifier`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Serialize;
use url::Url;

use crate::entity::Entity;
use crate::error::{Result, TrackerError};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// `entity` carries the new price. `Err(UserUnreachable)` means the
    /// subscriber is gone for good.
    async fn notify(&self, user_id: u64, entity: &Entity, old_price: Decimal) -> Result<()>;

    /// The entity is no longer visible and is about to be dropped.
    async fn notify_removed(&self, user_id: u64, entity: &Entity) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    MoreExpensive,
    Cheaper,
}

impl Direction {
    pub fn label(self) -> &'static str {
        match self {
            Direction::MoreExpensive => "teurer",
            Direction::Cheaper => "billiger",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PriceChange {
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub diff: Decimal,
    pub direction: Direction,
}

impl PriceChange {
    /// A zero diff counts as cheaper.
    pub fn new(old_price: Decimal, new_price: Decimal) -> Self {
        let diff = new_price - old_price;
        let direction = if diff > Decimal::ZERO {
            Direction::MoreExpensive
        } else {
            Direction::Cheaper
        };
        Self {
            old_price,
            new_price,
            diff,
            direction,
        }
    }

    pub fn message(&self, entity: &Entity) -> String {
        format!(
            "Der Preis von {} hat sich geändert: {}\n\n{} {}",
            entity.name(),
            format_price(self.new_price, false),
            format_price(self.diff, true),
            self.direction
        )
    }
}

/// `12.3` → `"12.30 €"`, or `"+12.30 €"` when `signed`.
pub fn format_price(value: Decimal, signed: bool) -> String {
    let value = value.round_dp(2);
    let sign = if signed && !value.is_sign_negative() { "+" } else { "" };
    format!("{sign}{value:.2} €")
}

pub fn removal_message(entity: &Entity) -> String {
    format!(
        "{} {} ist leider nicht mehr einsehbar. Der Preisagent wird entfernt.",
        entity.kind().spec().noun,
        entity.name()
    )
}

/// Logs every notice; used when no delivery endpoint is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: u64, entity: &Entity, old_price: Decimal) -> Result<()> {
        let change = PriceChange::new(old_price, entity.price());
        tracing::info!(
            user_id,
            entity = %entity.key(),
            old = %change.old_price,
            new = %change.new_price,
            direction = %change.direction,
            "price changed"
        );
        Ok(())
    }

    async fn notify_removed(&self, user_id: u64, entity: &Entity) -> Result<()> {
        tracing::info!(user_id, entity = %entity.key(), "entity no longer visible");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    PriceChanged {
        user_id: u64,
        entity: &'a Entity,
        change: PriceChange,
        text: String,
    },
    EntityRemoved {
        user_id: u64,
        entity: &'a Entity,
        text: String,
    },
}

/// POSTs each notice as JSON to a relay that owns the chat transport.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| TrackerError::Notify(format!("http client: {e}")))?;
        Ok(Self { client, url })
    }

    async fn post(&self, user_id: u64, event: &Event<'_>) -> Result<()> {
        let rsp = self
            .client
            .post(self.url.clone())
            .json(event)
            .send()
            .await
            .map_err(|e| TrackerError::Notify(e.to_string()))?;

        match rsp.status() {
            s if s.is_success() => Ok(()),
            // The relay reports blocked bots and deleted accounts this way.
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(TrackerError::UserUnreachable(user_id))
            }
            s => Err(TrackerError::Notify(format!("webhook answered {s}"))),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, user_id: u64, entity: &Entity, old_price: Decimal) -> Result<()> {
        let change = PriceChange::new(old_price, entity.price());
        let event = Event::PriceChanged {
            user_id,
            entity,
            change,
            text: change.message(entity),
        };
        self.post(user_id, &event).await
    }

    async fn notify_removed(&self, user_id: u64, entity: &Entity) -> Result<()> {
        let event = Event::EntityRemoved {
            user_id,
            entity,
            text: removal_message(entity),
        };
        self.post(user_id, &event).await
    }
}
