//! Concrete transport implementations for `homelink-core`'s [`Transport`]
//! and [`RestClient`] traits.
//!
//! [`Transport`]: homelink_core::Transport
//! [`RestClient`]: homelink_core::RestClient

pub mod http;
pub mod websocket;

pub use http::HttpRestClient;
pub use websocket::WsTransport;
