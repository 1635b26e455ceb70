//! termgate: an interactive terminal service with connection admission and
//! an HTTP control plane for gateway sessions.

pub mod admission;
pub mod api;
pub mod build_info;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod identity;
pub mod server;
pub mod shell;
pub mod shutdown;
pub mod store;
pub mod sync;
pub mod tui;
