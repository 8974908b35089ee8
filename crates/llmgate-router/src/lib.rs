pub mod dashboard;
pub mod proxy;

pub use proxy::gateway_router;
