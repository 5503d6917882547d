//! `PriceAgent`: the operations a chat front end calls. One instance is built
//! at start-up and shared with the HTTP handlers.

use std::sync::Arc;

use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::config::LimitsConfig;
use crate::entity::{Entity, EntityKey, EntityKind, PricePoint, User};
use crate::error::{Result, TrackerError};
use crate::extract::Extractor;
use crate::history::{self, DailyHistory};
use crate::identity;
use crate::repository::EntityRepository;

pub struct PriceAgent {
    repo: Arc<dyn EntityRepository>,
    extractor: Arc<Extractor>,
    limits: LimitsConfig,
}

impl PriceAgent {
    pub fn new(repo: Arc<dyn EntityRepository>, extractor: Arc<Extractor>, limits: LimitsConfig) -> Self {
        Self {
            repo,
            extractor,
            limits,
        }
    }

    pub async fn add_user_if_new(&self, user: &User) -> Result<bool> {
        let added = self.repo.add_user_if_absent(user).await?;
        if added {
            tracing::info!(user_id = user.user_id, "new user");
        }
        Ok(added)
    }

    pub async fn get_user(&self, user_id: u64) -> Result<User> {
        self.repo
            .get_user(user_id)
            .await?
            .ok_or(TrackerError::UserNotFound(user_id))
    }

    pub async fn delete_user(&self, user_id: u64) -> Result<()> {
        self.repo.delete_user(user_id).await
    }

    /// Starts tracking `url` for `user`.
    ///
    /// Rejections that need no network (bad url, cap reached, duplicate) happen
    /// before anything is fetched or written. The page is always read so a
    /// stored entity that went private is refused and the caller sees the
    /// current price. The cap is checked again inside the subscribe write so a
    /// concurrent request cannot slip past it.
    pub async fn track(&self, user: &User, url: &str) -> Result<Entity> {
        let key = identity::resolve(url)?;
        let kind = key.kind;
        let limit = self.limits.for_kind(kind);

        if self.repo.subscription_count(user.user_id, kind).await? >= limit {
            return Err(TrackerError::LimitReached { kind, limit });
        }
        if self.repo.is_subscribed(user.user_id, key).await? {
            return Err(TrackerError::AlreadySubscribed);
        }

        let entity = self.extractor.fetch_and_build(url, kind).await?;
        self.add_user_if_new(user).await?;
        self.add_entity_if_new(&entity).await?;

        self.repo.subscribe(user.user_id, key, Some(limit)).await?;
        tracing::info!(user_id = user.user_id, entity = %key, price = %entity.price(), "subscribed");
        Ok(entity)
    }

    pub async fn add_entity_if_new(&self, entity: &Entity) -> Result<bool> {
        self.repo.add_entity_if_absent(entity).await
    }

    /// Subscribes with the per-kind cap applied.
    pub async fn subscribe_entity(&self, user_id: u64, key: EntityKey) -> Result<()> {
        self.repo
            .subscribe(user_id, key, Some(self.limits.for_kind(key.kind)))
            .await
    }

    pub async fn unsubscribe_entity(&self, user_id: u64, key: EntityKey) -> Result<()> {
        self.repo.unsubscribe(user_id, key).await
    }

    pub async fn entities_for_user(&self, user_id: u64, kind: EntityKind) -> Result<Vec<Entity>> {
        self.repo.entities_for_user(user_id, kind).await
    }

    pub async fn entity_subscribers(&self, key: EntityKey) -> Result<Vec<u64>> {
        self.repo.subscribers(key).await
    }

    pub async fn get_entity(&self, key: EntityKey) -> Result<Entity> {
        self.repo
            .get_entity(key)
            .await?
            .ok_or(TrackerError::EntityNotFound)
    }

    pub async fn update_entity_price(&self, key: EntityKey, price: Decimal) -> Result<()> {
        self.repo.update_price(key, price).await
    }

    pub async fn update_entity_name(&self, key: EntityKey, name: &str) -> Result<()> {
        self.repo.update_name(key, name).await
    }

    pub async fn remove_entity(&self, key: EntityKey) -> Result<()> {
        self.repo.remove_entity(key).await
    }

    /// Points from the last `weeks` weeks, oldest first.
    pub async fn price_history(&self, key: EntityKey, weeks: u32) -> Result<Vec<PricePoint>> {
        self.get_entity(key).await?;
        let since = history::window_start(OffsetDateTime::now_utc(), weeks);
        self.repo.price_history(key, since).await
    }

    pub async fn daily_history(&self, key: EntityKey, weeks: u32) -> Result<DailyHistory> {
        let points = self.price_history(key, weeks).await?;
        Ok(DailyHistory::from_points(&points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::PageSource;
    use crate::repository::InMemoryRepository;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WISHLIST_URL: &str = "https://geizhals.de/?cat=WL-676328";
    const PRODUCT_URL: &str = "https://geizhals.de/sony-ht-rt3-schwarz-a1400003.html";

    /// Serves a fixed page for any url, or fails every call with `NotPublic`.
    struct Pages {
        calls: AtomicUsize,
        public: bool,
    }

    #[async_trait]
    impl PageSource for Pages {
        async fn fetch(&self, url: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.public {
                return Err(TrackerError::NotPublic);
            }
            Ok(if url.contains("cat=WL-") {
                r#"<h1 class="gh_listtitle">NAS</h1>
                   <div class="wishlist_sum_area"><span class="gh_price"><span class="gh_price"><span class="gh_price">€ 617,90</span></span></span></div>"#
                    .to_string()
            } else {
                r#"<div id="gh_artbox"><span itemprop="name">Sony HT-RT3</span></div>
                   <div id="offer__price-0"><span class="gh_price">€ 199,--</span></div>"#
                    .to_string()
            })
        }
    }

    fn agent(public: bool, limits: LimitsConfig) -> (PriceAgent, Arc<Pages>, Arc<InMemoryRepository>) {
        let pages = Arc::new(Pages {
            calls: AtomicUsize::new(0),
            public,
        });
        let repo = Arc::new(InMemoryRepository::new());
        let extractor = Arc::new(Extractor::new(pages.clone()));
        (PriceAgent::new(repo.clone(), extractor, limits), pages, repo)
    }

    #[tokio::test]
    async fn tracking_stores_subscribes_and_records_a_first_price() {
        let (agent, pages, repo) = agent(true, LimitsConfig::default());
        let user = User::new(1, "Rico");

        let e = agent.track(&user, WISHLIST_URL).await.unwrap();
        assert_eq!(e.key(), EntityKey::new(EntityKind::Wishlist, 676328));
        assert_eq!(e.price(), dec!(617.90));
        assert_eq!(pages.calls.load(Ordering::SeqCst), 1);

        assert_eq!(agent.get_user(1).await.unwrap(), user);
        assert_eq!(agent.entity_subscribers(e.key()).await.unwrap(), vec![1]);
        assert_eq!(repo.subscribed_wishlist_count(1).await.unwrap(), 1);

        let history = agent.price_history(e.key(), 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].price, dec!(617.90));
    }

    #[tokio::test]
    async fn second_subscriber_reads_the_page_again() {
        let (agent, pages, _) = agent(true, LimitsConfig::default());
        agent.track(&User::new(1, "a"), PRODUCT_URL).await.unwrap();
        agent.track(&User::new(2, "b"), PRODUCT_URL).await.unwrap();

        assert_eq!(pages.calls.load(Ordering::SeqCst), 2);
        let key = EntityKey::new(EntityKind::Product, 1400003);
        let mut subs = agent.entity_subscribers(key).await.unwrap();
        subs.sort();
        assert_eq!(subs, vec![1, 2]);
    }

    #[tokio::test]
    async fn duplicate_tracking_is_rejected_without_fetching() {
        let (agent, pages, _) = agent(true, LimitsConfig::default());
        let user = User::new(1, "Rico");
        agent.track(&user, PRODUCT_URL).await.unwrap();

        assert!(matches!(
            agent.track(&user, PRODUCT_URL).await,
            Err(TrackerError::AlreadySubscribed)
        ));
        assert_eq!(pages.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_url_changes_nothing() {
        let (agent, pages, _) = agent(true, LimitsConfig::default());
        assert!(matches!(
            agent.track(&User::new(1, "Rico"), "https://example.com/a1.html").await,
            Err(TrackerError::InvalidUrl(_))
        ));
        assert_eq!(pages.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(agent.get_user(1).await, Err(TrackerError::UserNotFound(1))));
    }

    #[tokio::test]
    async fn hidden_page_cannot_be_added() {
        let (agent, _, repo) = agent(false, LimitsConfig::default());
        assert!(matches!(
            agent.track(&User::new(1, "Rico"), WISHLIST_URL).await,
            Err(TrackerError::NotPublic)
        ));
        let key = EntityKey::new(EntityKind::Wishlist, 676328);
        assert!(repo.get_entity(key).await.unwrap().is_none());
        assert!(matches!(agent.get_entity(key).await, Err(TrackerError::EntityNotFound)));
    }

    #[tokio::test]
    async fn stored_entity_gone_private_cannot_be_tracked() {
        let (agent, pages, repo) = agent(false, LimitsConfig::default());
        let stored = crate::repository::contract::wishlist(676328, dec!(617.90));
        repo.add_entity_if_absent(&stored).await.unwrap();

        assert!(matches!(
            agent.track(&User::new(1, "Rico"), WISHLIST_URL).await,
            Err(TrackerError::NotPublic)
        ));
        assert_eq!(pages.calls.load(Ordering::SeqCst), 1);
        assert!(agent.entity_subscribers(stored.key()).await.unwrap().is_empty());
        assert!(matches!(agent.get_user(1).await, Err(TrackerError::UserNotFound(1))));
    }

    #[tokio::test]
    async fn tracking_a_stored_entity_returns_the_current_price() {
        let (agent, _, repo) = agent(true, LimitsConfig::default());
        let stale = crate::repository::contract::wishlist(676328, dec!(700));
        repo.add_entity_if_absent(&stale).await.unwrap();

        let e = agent.track(&User::new(1, "Rico"), WISHLIST_URL).await.unwrap();
        assert_eq!(e.price(), dec!(617.90));
        assert_eq!(agent.entity_subscribers(e.key()).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn subscribe_entity_applies_the_configured_cap() {
        let limits = LimitsConfig {
            max_wishlists: 1,
            max_products: 5,
        };
        let (agent, _, repo) = agent(true, limits);
        agent.track(&User::new(1, "Rico"), WISHLIST_URL).await.unwrap();

        let other = crate::repository::contract::wishlist(2, dec!(1));
        agent.add_entity_if_new(&other).await.unwrap();
        assert!(matches!(
            agent.subscribe_entity(1, other.key()).await,
            Err(TrackerError::LimitReached { limit: 1, .. })
        ));
        assert_eq!(repo.subscribed_wishlist_count(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn daily_history_of_unknown_entity_is_not_found() {
        let (agent, _, _) = agent(true, LimitsConfig::default());
        let key = EntityKey::new(EntityKind::Product, 9);
        assert!(matches!(agent.daily_history(key, 4).await, Err(TrackerError::EntityNotFound)));
    }
}
