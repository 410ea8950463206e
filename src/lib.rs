pub mod auth;
pub mod billing;
pub mod chat;
pub mod config;
pub mod error;
pub mod extractor;
pub mod identity;
pub mod rate_limit;
pub mod routes;
pub mod session;
pub mod usage;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use routes::api_routes;
