//! Persistence contract for users, tracked entities, subscriptions and price history.
//!
//! Every write is atomic per entity/user. Reads return owned snapshots; nothing
//! handed out aliases stored state.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::entity::{Entity, EntityKey, EntityKind, PricePoint, User};
use crate::error::Result;

#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Inserts the user unless one with the same id exists. Returns whether a row was added.
    async fn add_user_if_absent(&self, user: &User) -> Result<bool>;

    async fn get_user(&self, user_id: u64) -> Result<Option<User>>;

    /// Drops the user and all of their subscription edges. Entities and history stay.
    async fn delete_user(&self, user_id: u64) -> Result<()>;

    /// No-op when `(kind, id)` is already stored; stored name/price are never
    /// overwritten. A fresh insert also records the first price point.
    async fn add_entity_if_absent(&self, entity: &Entity) -> Result<bool>;

    async fn get_entity(&self, key: EntityKey) -> Result<Option<Entity>>;

    /// Entities with at least one subscriber, wishlists first, ascending id.
    async fn entities_with_subscribers(&self) -> Result<Vec<Entity>>;

    async fn entities_for_user(&self, user_id: u64, kind: EntityKind) -> Result<Vec<Entity>>;

    /// Overwrites the stored price and appends a price point, even when unchanged.
    async fn update_price(&self, key: EntityKey, price: Decimal) -> Result<()>;

    async fn update_name(&self, key: EntityKey, name: &str) -> Result<()>;

    /// Deletes the entity together with its subscription edges and history.
    async fn remove_entity(&self, key: EntityKey) -> Result<()>;

    /// Adds the `(user, entity)` edge. Fails with `AlreadySubscribed` if it
    /// exists and with `LimitReached` if `cap` is given and the user already
    /// holds that many subscriptions of the entity's kind. Check and insert
    /// happen in one write.
    async fn subscribe(&self, user_id: u64, key: EntityKey, cap: Option<usize>) -> Result<()>;

    /// Idempotent.
    async fn unsubscribe(&self, user_id: u64, key: EntityKey) -> Result<()>;

    async fn is_subscribed(&self, user_id: u64, key: EntityKey) -> Result<bool>;

    async fn subscribers(&self, key: EntityKey) -> Result<Vec<u64>>;

    async fn subscription_count(&self, user_id: u64, kind: EntityKind) -> Result<usize>;

    /// Points recorded at or after `since`, oldest first.
    async fn price_history(&self, key: EntityKey, since: OffsetDateTime) -> Result<Vec<PricePoint>>;

    async fn subscribed_wishlist_count(&self, user_id: u64) -> Result<usize> {
        self.subscription_count(user_id, EntityKind::Wishlist).await
    }

    async fn subscribed_product_count(&self, user_id: u64) -> Result<usize> {
        self.subscription_count(user_id, EntityKind::Product).await
    }
}
