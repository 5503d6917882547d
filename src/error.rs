//! Error taxonomy for the price-tracking core.

use thiserror::Error;

use crate::entity::EntityKind;

pub type Result<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Input does not match the wishlist or the product URL grammar.
    #[error("url does not match any known entity grammar: {0}")]
    InvalidUrl(String),

    #[error("user is already subscribed to this entity")]
    AlreadySubscribed,

    #[error("entity not found")]
    EntityNotFound,

    #[error("user {0} not found")]
    UserNotFound(u64),

    #[error("subscription limit reached: at most {limit} {kind}s per user")]
    LimitReached { kind: EntityKind, limit: usize },

    /// The source answered 403; the page is not (or no longer) public.
    #[error("entity page is not public")]
    NotPublic,

    /// No 200 answer within the configured attempts.
    #[error("blocked by the price site after retries")]
    Blocked,

    #[error("transient fetch failure: {0}")]
    Transient(String),

    #[error("entity name could not be parsed")]
    NameUnparsable,

    #[error("entity price could not be parsed: {0:?}")]
    PriceUnparsable(String),

    /// Notification target is gone for good (blocked the bot, deleted account).
    #[error("user {0} is unreachable")]
    UserUnreachable(u64),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("a reconciliation run is already in progress")]
    RunInProgress,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl TrackerError {
    /// Failures the reconciliation job tolerates by skipping the entity until the next run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerError::Blocked
                | TrackerError::Transient(_)
                | TrackerError::NameUnparsable
                | TrackerError::PriceUnparsable(_)
        )
    }
}
