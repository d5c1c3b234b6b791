//! Подписки: хранилище записей «тип интереса → топик» и менеджер,
//! выполняющий subscribe/unsubscribe.

pub mod manager;
pub mod store;

pub use manager::SubscriptionManager;
pub use store::{InMemorySubscriptionStore, Subscription, SubscriptionStore};
