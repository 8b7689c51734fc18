//! HTTP surface: configuration, router, middleware, error mapping and
//! lifecycle control.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use error::{status_for, ApiError};
pub use handlers::AppState;
pub use module::{build_router, NetworkModule};
pub use shutdown::*;
