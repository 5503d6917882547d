//! In-memory repository for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::EntityRepository;
use crate::entity::{Entity, EntityKey, EntityKind, PricePoint, User};
use crate::error::{Result, TrackerError};

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<u64, User>,
    entities: BTreeMap<EntityKey, Entity>,
    /// (entity, user) edges.
    subscriptions: BTreeSet<(EntityKey, u64)>,
    history: Vec<PricePoint>,
}

impl State {
    fn count(&self, user_id: u64, kind: EntityKind) -> usize {
        self.subscriptions
            .iter()
            .filter(|(key, uid)| *uid == user_id && key.kind == kind)
            .count()
    }

    fn record(&mut self, key: EntityKey, price: Decimal) {
        self.history.push(PricePoint {
            key,
            price,
            timestamp: OffsetDateTime::now_utc(),
        });
    }
}

/// A single lock over the whole state makes every write atomic.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: RwLock<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityRepository for InMemoryRepository {
    async fn add_user_if_absent(&self, user: &User) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.users.contains_key(&user.user_id) {
            return Ok(false);
        }
        state.users.insert(user.user_id, user.clone());
        Ok(true)
    }

    async fn get_user(&self, user_id: u64) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn delete_user(&self, user_id: u64) -> Result<()> {
        let mut state = self.state.write().await;
        state.users.remove(&user_id);
        state.subscriptions.retain(|(_, uid)| *uid != user_id);
        Ok(())
    }

    async fn add_entity_if_absent(&self, entity: &Entity) -> Result<bool> {
        let mut state = self.state.write().await;
        let key = entity.key();
        if state.entities.contains_key(&key) {
            return Ok(false);
        }
        state.entities.insert(key, entity.clone());
        state.record(key, entity.price());
        Ok(true)
    }

    async fn get_entity(&self, key: EntityKey) -> Result<Option<Entity>> {
        Ok(self.state.read().await.entities.get(&key).cloned())
    }

    async fn entities_with_subscribers(&self) -> Result<Vec<Entity>> {
        let state = self.state.read().await;
        let keys: BTreeSet<EntityKey> = state.subscriptions.iter().map(|(k, _)| *k).collect();
        Ok(keys
            .iter()
            .filter_map(|k| state.entities.get(k).cloned())
            .collect())
    }

    async fn entities_for_user(&self, user_id: u64, kind: EntityKind) -> Result<Vec<Entity>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|(key, uid)| *uid == user_id && key.kind == kind)
            .filter_map(|(key, _)| state.entities.get(key).cloned())
            .collect())
    }

    async fn update_price(&self, key: EntityKey, price: Decimal) -> Result<()> {
        let mut state = self.state.write().await;
        let entity = state.entities.remove(&key).ok_or(TrackerError::EntityNotFound)?;
        state.entities.insert(key, entity.with_price(price));
        state.record(key, price);
        Ok(())
    }

    async fn update_name(&self, key: EntityKey, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entity = state.entities.remove(&key).ok_or(TrackerError::EntityNotFound)?;
        state.entities.insert(key, entity.with_name(name));
        Ok(())
    }

    async fn remove_entity(&self, key: EntityKey) -> Result<()> {
        let mut state = self.state.write().await;
        state.entities.remove(&key);
        state.subscriptions.retain(|(k, _)| *k != key);
        state.history.retain(|p| p.key != key);
        Ok(())
    }

    async fn subscribe(&self, user_id: u64, key: EntityKey, cap: Option<usize>) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.entities.contains_key(&key) {
            return Err(TrackerError::EntityNotFound);
        }
        if !state.users.contains_key(&user_id) {
            return Err(TrackerError::UserNotFound(user_id));
        }
        if state.subscriptions.contains(&(key, user_id)) {
            return Err(TrackerError::AlreadySubscribed);
        }
        if let Some(limit) = cap {
            if state.count(user_id, key.kind) >= limit {
                return Err(TrackerError::LimitReached {
                    kind: key.kind,
                    limit,
                });
            }
        }
        state.subscriptions.insert((key, user_id));
        Ok(())
    }

    async fn unsubscribe(&self, user_id: u64, key: EntityKey) -> Result<()> {
        self.state.write().await.subscriptions.remove(&(key, user_id));
        Ok(())
    }

    async fn is_subscribed(&self, user_id: u64, key: EntityKey) -> Result<bool> {
        Ok(self.state.read().await.subscriptions.contains(&(key, user_id)))
    }

    async fn subscribers(&self, key: EntityKey) -> Result<Vec<u64>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, uid)| *uid)
            .collect())
    }

    async fn subscription_count(&self, user_id: u64, kind: EntityKind) -> Result<usize> {
        Ok(self.state.read().await.count(user_id, kind))
    }

    async fn price_history(&self, key: EntityKey, since: OffsetDateTime) -> Result<Vec<PricePoint>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .iter()
            .filter(|p| p.key == key && p.timestamp >= since)
            .cloned()
            .collect())
    }
}
