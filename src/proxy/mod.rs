//! Proxy server implementation
//!
//! This module provides:
//! - The HTTP listener and proxy authentication
//! - Plain HTTP forwarding and CONNECT tunneling
//! - Pluggable engines deciding how outgoing connections are dialed

pub mod engine;
pub mod middleware;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;

pub use engine::{create_engine, Engine, EngineKind};
pub use server::ProxyServer;
pub use session::{ProxyResponse, Session};
pub use transport::{BoxedConnection, Dialer, TcpDialer};
