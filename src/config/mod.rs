//! Application configuration

pub mod schema;
pub mod store;

pub use schema::{AppConfig, InviteConfig, StoreConfig};
pub use store::ConfigStore;
