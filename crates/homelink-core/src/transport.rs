//! The transport contract: the connection orchestrator depends only on these
//! traits, never on a concrete WebSocket/HTTP library.

use async_trait::async_trait;
use futures::stream::BoxStream;
use url::Url;

use crate::error::TransportResult;

/// A single inbound transport frame.
#[derive(Debug, Clone)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    Pong,
    Close,
}

/// A stable identifier for one transport instance, used by the orchestrator
/// to discard callbacks from a transport that has since been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(pub u64);

/// An open, bidirectional byte-stream carrying the JSON wire protocol.
///
/// Implementations own no reconnect policy; the client crate's reconnect
/// manager decides when to call [`Transport::open`] again.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a new connection to `url`. Returns once the underlying dial has
    /// started; completion is observed through the first item (or error) on
    /// [`Transport::inbound`].
    async fn open(url: Url) -> TransportResult<Self>
    where
        Self: Sized;

    /// The stream of inbound frames. Ends on graceful close or transport
    /// error. Implementations decouple this from `self`'s lifetime (the read
    /// side runs on its own task, fed through a channel), so the returned
    /// stream outlives the borrow used to obtain it and callers may continue
    /// to call [`Transport::send_text`] concurrently.
    fn inbound(&mut self) -> BoxStream<'static, TransportResult<Message>>;

    /// Sends a text frame.
    async fn send_text(&self, text: String) -> TransportResult<()>;

    /// Closes the transport. Idempotent.
    fn cancel(&self, reason: &str);

    /// This instance's stable identifier.
    fn id(&self) -> TransportId;
}

/// An outbound REST call, independent of any particular HTTP client crate.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Issues an HTTP request and returns `(status, content_type, body)`. The
    /// content type is the response's `Content-Type` header value, if any,
    /// stripped of parameters (e.g. `application/json` from
    /// `application/json; charset=utf-8`).
    async fn call(
        &self,
        method: http_method::Method,
        url: Url,
        host_header: String,
        user_agent: Option<String>,
        bearer_token: Option<String>,
        body: Option<serde_json::Value>,
    ) -> TransportResult<(u16, Option<String>, String)>;
}

/// A minimal method enum so this crate does not depend on `http` or
/// `reqwest` directly.
pub mod http_method {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Method {
        Get,
        Post,
    }
}
