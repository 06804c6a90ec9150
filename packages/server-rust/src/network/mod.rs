//! HTTP surface: configuration, middleware, handlers, and the service lifecycle.

pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod module;

pub use config::*;
pub use error::ApiError;
pub use handlers::AppState;
pub use lifecycle::{HealthState, InFlightGuard, ServiceLifecycle};
pub use module::{build_router, NetworkModule};
