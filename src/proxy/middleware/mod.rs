//! Proxy middleware

mod auth;

pub use auth::ProxyAuth;
