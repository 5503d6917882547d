//! Price agent for geizhals.de wishlists and products: registers tracked
//! pages, re-reads them on a schedule and notifies subscribers of price changes.

pub mod config;
pub mod entity;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod history;
pub mod http;
pub mod identity;
pub mod logging;
pub mod notify;
pub mod proxy;
pub mod reconcile;
pub mod repository;
pub mod service;

pub use entity::{Entity, EntityKey, EntityKind, PricePoint, User};
pub use error::{Result, TrackerError};
