//! HTTP request handlers.

pub mod api_auth;
pub mod gateway;
mod health;
pub mod problem_details;
mod version;

pub use health::{livez, readyz};
pub use version::version;
