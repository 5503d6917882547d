//! Tracked entities, users and price points.
//!
//! Everything kind-specific (URL grammar, selectors, table names) lives in the
//! [`KindSpec`] table, so call sites branch on a kind only to look up its spec.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Wishlist,
    Product,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Wishlist, EntityKind::Product];

    pub fn spec(self) -> &'static KindSpec {
        &KIND_SPECS[self as usize]
    }

    pub fn label(self) -> &'static str {
        self.spec().label
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown entity kind {s:?}"))
    }
}

/// Per-kind capability row.
#[derive(Debug)]
pub struct KindSpec {
    pub kind: EntityKind,
    pub label: &'static str,
    /// Noun phrase used in user-facing notices.
    pub noun: &'static str,
    /// Start-anchored URL grammar; capture group 2 is the numeric id.
    pub url_pattern: &'static str,
    /// Name anchors in priority order (older layouts last).
    pub name_selectors: &'static [&'static str],
    pub price_selector: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub prices_table: &'static str,
    pub subscribers_table: &'static str,
}

// Indexed by `EntityKind as usize`.
static KIND_SPECS: [KindSpec; 2] = [
    KindSpec {
        kind: EntityKind::Wishlist,
        label: "wishlist",
        noun: "Die Wunschliste",
        url_pattern: r"^https://geizhals\.(de|at|eu)/\?cat=WL-([0-9]+)",
        name_selectors: &["h1.gh_listtitle"],
        price_selector: "div.wishlist_sum_area span.gh_price span.gh_price > span.gh_price",
        table: "wishlists",
        id_column: "wishlist_id",
        prices_table: "wishlist_prices",
        subscribers_table: "wishlist_subscribers",
    },
    KindSpec {
        kind: EntityKind::Product,
        label: "product",
        noun: "Das Produkt",
        url_pattern: r"^https://geizhals\.(de|at|eu)/[0-9a-zA-Z\-]*a([0-9]+)\.html",
        name_selectors: &["div#gh_artbox span[itemprop='name']", "#productpage__headline"],
        price_selector: "div#offer__price-0 span.gh_price",
        table: "products",
        id_column: "product_id",
        prices_table: "product_prices",
        subscribers_table: "product_subscribers",
    },
];

/// Identity of a tracked entity: ids are only unique within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: u64,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDetails {
    pub id: u64,
    pub name: String,
    pub url: String,
    /// Last known price; authoritative only until the next successful reconciliation.
    pub price: Decimal,
}

/// Snapshot of a tracked entity. Repository reads hand out copies; writes go
/// back through explicit repository calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entity {
    Wishlist(EntityDetails),
    Product(EntityDetails),
}

impl Entity {
    pub fn new(kind: EntityKind, details: EntityDetails) -> Self {
        match kind {
            EntityKind::Wishlist => Entity::Wishlist(details),
            EntityKind::Product => Entity::Product(details),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Wishlist(_) => EntityKind::Wishlist,
            Entity::Product(_) => EntityKind::Product,
        }
    }

    pub fn details(&self) -> &EntityDetails {
        match self {
            Entity::Wishlist(d) | Entity::Product(d) => d,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind(), self.id())
    }

    pub fn id(&self) -> u64 {
        self.details().id
    }

    pub fn name(&self) -> &str {
        &self.details().name
    }

    pub fn url(&self) -> &str {
        &self.details().url
    }

    pub fn price(&self) -> Decimal {
        self.details().price
    }

    pub fn with_price(self, price: Decimal) -> Self {
        let kind = self.kind();
        let mut details = self.into_details();
        details.price = price;
        Entity::new(kind, details)
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        let kind = self.kind();
        let mut details = self.into_details();
        details.name = name.into();
        Entity::new(kind, details)
    }

    fn into_details(self) -> EntityDetails {
        match self {
            Entity::Wishlist(d) | Entity::Product(d) => d,
        }
    }
}

pub const DEFAULT_LANG_CODE: &str = "de-DE";

fn default_lang_code() -> String {
    DEFAULT_LANG_CODE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub user_id: u64,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_lang_code")]
    pub lang_code: String,
}

impl User {
    pub fn new(user_id: u64, first_name: impl Into<String>) -> Self {
        Self {
            user_id,
            first_name: first_name.into(),
            last_name: None,
            username: None,
            lang_code: default_lang_code(),
        }
    }
}

/// One append-only history row, written on every price (re)write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub key: EntityKey,
    pub price: Decimal,
    #[serde(with = "time::serde::timestamp")]
    pub timestamp: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn product() -> Entity {
        Entity::new(
            EntityKind::Product,
            EntityDetails {
                id: 1400003,
                name: "Sony HT-RT3".into(),
                url: "https://geizhals.de/sony-ht-rt3-schwarz-a1400003.html".into(),
                price: dec!(199.00),
            },
        )
    }

    #[test]
    fn spec_table_is_indexed_by_kind() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.spec().kind, kind);
        }
    }

    #[test]
    fn kind_round_trips_through_its_label() {
        assert_eq!("wishlist".parse::<EntityKind>(), Ok(EntityKind::Wishlist));
        assert_eq!("Product".parse::<EntityKind>(), Ok(EntityKind::Product));
        assert!("category".parse::<EntityKind>().is_err());
    }

    #[test]
    fn with_price_keeps_kind_and_identity() {
        let e = product().with_price(dec!(179.90));
        assert_eq!(e.kind(), EntityKind::Product);
        assert_eq!(e.key(), EntityKey::new(EntityKind::Product, 1400003));
        assert_eq!(e.price(), dec!(179.90));
        assert_eq!(e.name(), "Sony HT-RT3");
    }

    #[test]
    fn entity_json_is_tagged_by_kind() {
        let json = serde_json::to_value(product()).unwrap();
        assert_eq!(json["kind"], "product");
        assert_eq!(json["id"], 1400003);
        assert_eq!(json["price"], "199.00");
    }

    #[test]
    fn user_defaults_to_german_locale() {
        let u: User = serde_json::from_str(r#"{"user_id": 7, "first_name": "Rico"}"#).unwrap();
        assert_eq!(u.lang_code, "de-DE");
        assert_eq!(u, User::new(7, "Rico"));
    }
}
