//! HTTP front of the render service.

mod routes;
mod server;

pub use routes::{ErrorResponse, routes};
pub use server::{ServerConfig, serve};
