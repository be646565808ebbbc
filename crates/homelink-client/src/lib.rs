//! Connection state machine, request/subscription controller and response
//! demultiplexer for a resilient, authenticated WebSocket session with a
//! home-automation server.
//!
//! [`connection::Connection`] is the public entry point: it spawns a
//! background task that owns a [`response::ResponseController`] (phase) and
//! a [`controller::RequestController`] (correlation ids, pending singles,
//! subscriptions) and drives them against any [`homelink_core::Transport`]
//! implementation. See `homelink-transport` for a `tokio-tungstenite`-backed
//! one.

pub mod connection;
pub mod controller;
pub mod reconnect;
pub mod response;

pub use connection::{Connection, RestRequest};
pub use controller::{CancelToken, EventSink};
pub use reconnect::ReconnectManager;
pub use response::{DemuxOutcome, ResponseController};
