//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (one worker thread)
//!     → server.rs (hyper HTTP/1.1 connection, Axum router, request id)
//!     → [routing layer picks the backend group]
//!     → exchange.rs (request plus downstream connection context)
//!     → proxy.rs (select target, acquire connection, retry)
//!         → request.rs (outbound request, forwarding headers, 100-continue)
//!         → response.rs (stream body back, release connection)
//!         → websocket.rs (tunnel after 101 Switching Protocols)
//!     → Send to client
//! ```

pub mod attribute;
pub mod exchange;
pub mod proxy;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use exchange::{Exchange, ExchangeState};
pub use proxy::{ProxyOutcome, ProxySettings, ReverseProxy};
pub use request::X_REQUEST_ID;
pub use server::{AppState, HttpServer};
