pub mod api;
pub mod bot;
pub mod catalog;
pub mod config;
pub mod db;
pub mod feed;
pub mod lifecycle;
pub mod model;
pub mod relay;
pub mod status;
pub mod store;

use feed::ChangeFeed;
use lifecycle::LifecycleManager;

/// Shared state for the HTTP surface, the notification relay, and the bot
/// dispatcher.
pub struct AppState {
    pub manager: LifecycleManager,
    pub feed: ChangeFeed,
    /// Delivery attempt ceiling for the notification relay.
    pub delivery_max_attempts: u32,
}
