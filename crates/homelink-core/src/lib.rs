//! Shared types, traits and error taxonomy for a resilient home-automation
//! WebSocket session.
//!
//! This crate has no opinion about *how* bytes move — see
//! `homelink-transport` for the `tokio-tungstenite`/`reqwest`-backed
//! implementations of the traits defined here — and no opinion about the
//! session lifecycle itself, which lives in `homelink-client`.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod model;
pub mod token;
pub mod transport;

pub use endpoint::Endpoint;
pub use error::{ApiError, ApiResult, ConfigError, ConfigResult, TransportError, TransportResult};
pub use model::{
    AuthFrame, AuthState, ErrorInfo, Identifier, Phase, RawFrame, Request, WebSocketResponse,
};
pub use token::AuthTokenProvider;
pub use transport::{Message, RestClient, Transport, TransportId};
