pub mod config;
pub mod error;
pub mod extract;
pub mod guard;
pub mod rate_limit;
pub mod routes;
pub mod stream;
pub mod workspace;

pub use config::AppConfig;
pub use error::ApiError;
pub use routes::{AppState, router};
