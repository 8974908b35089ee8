pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod normalize;
pub mod router;
pub mod state;
pub mod token_store;
pub mod usage;

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}
