//! Load-balancing HTTP/1.1 reverse proxy library.

pub mod admin;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod routing;

#[cfg(test)]
mod test_support;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::{HttpServer, ReverseProxy};
pub use lifecycle::Shutdown;
