//! Ferry - forward HTTP/HTTPS proxy
//!
//! Serves plain HTTP requests and CONNECT tunnels, dialing outgoing
//! connections through one of several engines:
//!
//! - `direct`: straight TCP from this host
//! - `socks`: through an upstream SOCKS5 proxy
//! - `ssh`: through a single SSH session that reconnects itself when it drops

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{FerryError, Result};
