//! Connection orchestrator: ties the reconnect manager, request controller
//! and response controller to a concrete transport and drives the session
//! lifecycle on a dedicated background task.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use homelink_core::config::ClientOptions;
use homelink_core::error::{ApiError, ConfigResult};
use homelink_core::model::{ErrorInfo, Request};
use homelink_core::transport::http_method::Method;
use homelink_core::{AuthTokenProvider, Endpoint, Message, Phase, RestClient, Transport};

use crate::controller::{CancelToken, EventSink, OutboundFrame, RequestController};
use crate::reconnect::ReconnectManager;
use crate::response::{DemuxOutcome, ResponseController};

/// A REST request bound to the same endpoint and token as the WebSocket
/// session.
pub struct RestRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

enum Command {
    Connect,
    Reconfigure {
        endpoint: Endpoint,
        options: ClientOptions,
    },
    Disconnect {
        permanent: bool,
    },
    Send {
        request: Request,
        reply: oneshot::Sender<Result<Value, ApiError>>,
    },
    Subscribe {
        request: Request,
        sink: EventSink,
        reply: oneshot::Sender<(CancelToken, oneshot::Receiver<Result<(), ApiError>>)>,
    },
    CancelSubscription(CancelToken),
    Rest {
        request: RestRequest,
        reply: oneshot::Sender<Result<Value, ApiError>>,
    },
}

/// A handle to a running session. Cloning shares the same background task.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<Phase>,
}

impl Connection {
    /// Validates `options.url` and spawns the background task, returning a
    /// handle to it. The session starts disconnected; call
    /// [`Connection::connect`] to begin.
    pub fn spawn<T, R, P>(
        options: ClientOptions,
        token_provider: Arc<P>,
        rest_client: Arc<R>,
    ) -> ConfigResult<Connection>
    where
        T: Transport + 'static,
        R: RestClient + 'static,
        P: AuthTokenProvider + 'static,
    {
        let endpoint = Endpoint::new(&options.url, options.user_agent.clone())?;
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(Phase::initial());

        tokio::spawn(run::<T, R, P>(
            endpoint,
            options,
            token_provider,
            rest_client,
            cmd_rx,
            state_tx,
        ));

        Ok(Connection { cmd_tx, state_rx })
    }

    /// A live view of phase transitions, starting from the current phase.
    pub fn state(&self) -> watch::Receiver<Phase> {
        self.state_rx.clone()
    }

    pub fn current_phase(&self) -> Phase {
        self.state_rx.borrow().clone()
    }

    pub async fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect).await;
    }

    /// Take-over reconfigure: validates `options.url` and, if it normalizes
    /// to a different endpoint than the one currently in use, tears down the
    /// existing transport and reconnects against the new one. If the
    /// normalized endpoint is unchanged, this only updates reconnect/timeout
    /// settings and otherwise behaves like [`Connection::connect`].
    pub async fn reconfigure(&self, options: ClientOptions) -> ConfigResult<()> {
        let endpoint = Endpoint::new(&options.url, options.user_agent.clone())?;
        let _ = self
            .cmd_tx
            .send(Command::Reconfigure { endpoint, options })
            .await;
        Ok(())
    }

    pub async fn disconnect(&self, permanent: bool) {
        let _ = self.cmd_tx.send(Command::Disconnect { permanent }).await;
    }

    pub async fn send(&self, request: Request) -> Result<Value, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send { request, reply })
            .await
            .map_err(|_| ApiError::NotConnected)?;
        rx.await.map_err(|_| ApiError::Cancelled)?
    }

    pub async fn subscribe(
        &self,
        request: Request,
        sink: EventSink,
    ) -> Result<(CancelToken, oneshot::Receiver<Result<(), ApiError>>), ApiError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                request,
                sink,
                reply,
            })
            .await
            .map_err(|_| ApiError::NotConnected)?;
        rx.await.map_err(|_| ApiError::Cancelled)
    }

    pub async fn cancel_subscription(&self, token: CancelToken) {
        let _ = self.cmd_tx.send(Command::CancelSubscription(token)).await;
    }

    pub async fn rest(&self, request: RestRequest) -> Result<Value, ApiError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Rest { request, reply })
            .await
            .map_err(|_| ApiError::NotConnected)?;
        rx.await.map_err(|_| ApiError::Cancelled)?
    }
}

/// Mutable state threaded through the background task's select loop. Bundled
/// so the many small handlers below don't each take a dozen parameters.
struct Session<T: Transport> {
    endpoint: Endpoint,
    response: ResponseController,
    controller: RequestController,
    reconnect: ReconnectManager,
    transport: Option<T>,
    inbound: Option<BoxStream<'static, homelink_core::TransportResult<Message>>>,
    reconnect_at: Option<Instant>,
}

async fn run<T, R, P>(
    endpoint: Endpoint,
    options: ClientOptions,
    token_provider: Arc<P>,
    rest_client: Arc<R>,
    mut cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<Phase>,
) where
    T: Transport + 'static,
    R: RestClient + 'static,
    P: AuthTokenProvider + 'static,
{
    let mut session = Session::<T> {
        endpoint,
        response: ResponseController::new(),
        controller: RequestController::new(),
        reconnect: ReconnectManager::new(options.reconnect.clone()),
        transport: None,
        inbound: None,
        reconnect_at: None,
    };

    loop {
        let cmd = cmd_rx.recv();
        let inbound_next = async {
            match session.inbound.as_mut() {
                Some(stream) => stream.next().await,
                None => futures::future::pending().await,
            }
        };
        let reconnect_fire = async {
            match session.reconnect_at {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => futures::future::pending().await,
            }
        };

        tokio::select! {
            maybe_cmd = cmd => {
                match maybe_cmd {
                    Some(c) => {
                        handle_command(c, &token_provider, &rest_client, &mut session, &state_tx).await;
                    }
                    None => {
                        // All handles dropped: tear down and exit.
                        if let Some(t) = session.transport.take() {
                            t.cancel("connection dropped");
                        }
                        break;
                    }
                }
            }
            msg = inbound_next => {
                handle_inbound(msg, &token_provider, &mut session, &state_tx).await;
            }
            () = reconnect_fire => {
                session.reconnect_at = None;
                attempt_open(&mut session, &state_tx).await;
            }
        }
    }
}

async fn handle_command<T, R, P>(
    cmd: Command,
    token_provider: &Arc<P>,
    rest_client: &Arc<R>,
    session: &mut Session<T>,
    state_tx: &watch::Sender<Phase>,
) where
    T: Transport + 'static,
    R: RestClient + 'static,
    P: AuthTokenProvider + 'static,
{
    match cmd {
        Command::Connect => {
            session.reconnect.reactivate();
            if session.transport.is_none() {
                attempt_open(session, state_tx).await;
            }
        }
        Command::Reconfigure { endpoint, options } => {
            let replacing = session.transport.is_some() && session.endpoint.should_replace(&endpoint);
            session.endpoint = endpoint;
            session.reconnect = ReconnectManager::new(options.reconnect.clone());
            session.reconnect.reactivate();
            if replacing {
                debug!("endpoint changed, tearing down existing transport");
                if let Some(t) = session.transport.take() {
                    t.cancel("endpoint reconfigured");
                }
                session.inbound = None;
                session.controller.reset_active();
            }
            if session.transport.is_none() {
                attempt_open(session, state_tx).await;
            }
        }
        Command::Disconnect { permanent } => {
            session.reconnect.on_disconnect(permanent);
            session.reconnect_at = None;
            if let Some(t) = session.transport.take() {
                t.cancel("caller disconnect");
            }
            session.inbound = None;
            session.response.mark_disconnected(None, permanent);
            let _ = state_tx.send(session.response.phase().clone());
            if permanent {
                session.controller.cancel_all();
            } else {
                session.controller.reset_active();
            }
        }
        Command::Send { request, reply } => {
            let connected = session.response.phase().is_command();
            let (rx, frame) = session.controller.submit_single(request, connected);
            if let Some(frame) = &frame {
                send_frame(&session.transport, frame).await;
            }
            tokio::spawn(async move {
                let result = rx.await.unwrap_or(Err(ApiError::Cancelled));
                let _ = reply.send(result);
            });
        }
        Command::Subscribe {
            request,
            sink,
            reply,
        } => {
            let connected = session.response.phase().is_command();
            let (token, completion_rx, frame) =
                session.controller.submit_subscription(request, sink, connected);
            if let Some(frame) = &frame {
                send_frame(&session.transport, frame).await;
            }
            let _ = reply.send((token, completion_rx));
        }
        Command::CancelSubscription(token) => {
            if let Some(frame) = session.controller.cancel(&token) {
                send_frame(&session.transport, &frame).await;
            }
        }
        Command::Rest { request, reply } => {
            // Spawned off like `Command::Send`: an in-flight REST call must
            // not stall the select loop (no events, no results, no
            // disconnect/reconnect) for as long as the call takes.
            let url = session.endpoint.rest_url(&request.path, &request.query);
            let host_header = session.endpoint.host_header();
            let user_agent = session.endpoint.user_agent().map(str::to_string);
            let token_provider = token_provider.clone();
            let rest_client = rest_client.clone();
            tokio::spawn(async move {
                let token = match token_provider.fetch().await {
                    Ok(t) => Some(t),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let result =
                    perform_rest(&rest_client, host_header, user_agent, url, token, request).await;
                let _ = reply.send(result);
            });
        }
    }
}

async fn perform_rest<R: RestClient>(
    rest_client: &Arc<R>,
    host_header: String,
    user_agent: Option<String>,
    url: url::Url,
    token: Option<String>,
    request: RestRequest,
) -> Result<Value, ApiError> {
    let (status, content_type, body) = rest_client
        .call(request.method, url, host_header, user_agent, token, request.body)
        .await?;

    match ResponseController::classify_http(status, content_type, body) {
        homelink_core::WebSocketResponse::Result { outcome, .. } => {
            outcome.map_err(|ErrorInfo { code, message }| ApiError::External { code, message })
        }
        _ => unreachable!("classify_http always returns a Result variant"),
    }
}

async fn handle_inbound<T, P>(
    msg: Option<homelink_core::TransportResult<Message>>,
    token_provider: &Arc<P>,
    session: &mut Session<T>,
    state_tx: &watch::Sender<Phase>,
) where
    T: Transport + 'static,
    P: AuthTokenProvider + 'static,
{
    match msg {
        Some(Ok(Message::Text(text))) => {
            let outcome = session.response.on_text(&text);
            apply_outcome(outcome, token_provider, session, state_tx).await;
        }
        Some(Ok(Message::Binary(_))) => {
            warn!("dropping unexpected binary frame");
        }
        Some(Ok(Message::Ping)) | Some(Ok(Message::Pong)) => {}
        other => {
            let reason = match other {
                Some(Err(e)) => e.to_string(),
                _ => "connection closed".to_string(),
            };
            info!(reason, "transport ended, entering reconnect flow");
            if let Some(t) = session.transport.take() {
                t.cancel("stream ended");
            }
            session.inbound = None;
            session.response.mark_disconnected(Some(reason), false);
            let _ = state_tx.send(session.response.phase().clone());
            session.controller.reset_active();
            if session.reconnect.should_reconnect() {
                session.reconnect_at = Some(Instant::now() + session.reconnect.next_delay());
            }
        }
    }
}

async fn apply_outcome<T, P>(
    outcome: DemuxOutcome,
    token_provider: &Arc<P>,
    session: &mut Session<T>,
    state_tx: &watch::Sender<Phase>,
) where
    T: Transport + 'static,
    P: AuthTokenProvider + 'static,
{
    match outcome {
        DemuxOutcome::Event { id, data } => session.controller.deliver_event(id, data),
        DemuxOutcome::Result { id, outcome } => session.controller.resolve_result(id, outcome),
        DemuxOutcome::Ignored => {}
        DemuxOutcome::AuthRejected { message } => {
            debug!(message, "server rejected auth frame");
            let _ = state_tx.send(session.response.phase().clone());
            if let Some(t) = session.transport.take() {
                t.cancel("auth rejected");
            }
            session.inbound = None;
            session.controller.reset_active();
            // No automatic retry with the same (rejected) token: suppress
            // scheduling until the caller explicitly calls `connect()` again.
            session.reconnect.on_disconnect(true);
        }
        DemuxOutcome::PhaseChanged => {
            let _ = state_tx.send(session.response.phase().clone());
            match session.response.phase().clone() {
                Phase::Authenticating => match token_provider.fetch().await {
                    Ok(token) => {
                        let frame = homelink_core::AuthFrame::new(&token);
                        if let Ok(text) = serde_json::to_string(&frame)
                            && let Some(t) = session.transport.as_ref()
                            && let Err(e) = t.send_text(text).await
                        {
                            warn!(error = %e, "failed to send auth frame");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "token provider failed");
                        if let Some(t) = session.transport.take() {
                            t.cancel("token unavailable");
                        }
                        session.inbound = None;
                        session.response.mark_disconnected(Some(e.to_string()), false);
                        let _ = state_tx.send(session.response.phase().clone());
                        if session.reconnect.should_reconnect() {
                            session.reconnect_at =
                                Some(Instant::now() + session.reconnect.next_delay());
                        }
                    }
                },
                Phase::Command { .. } => {
                    session.reconnect.on_connected();
                    let frames = session.controller.prepare();
                    for frame in &frames {
                        send_frame(&session.transport, frame).await;
                    }
                }
                Phase::Disconnected { for_reset, .. } => {
                    session.controller.reset_active();
                    if !for_reset && session.reconnect.should_reconnect() {
                        session.reconnect_at =
                            Some(Instant::now() + session.reconnect.next_delay());
                    }
                }
            }
        }
    }
}

async fn send_frame<T: Transport>(transport: &Option<T>, frame: &OutboundFrame) {
    if let Some(t) = transport.as_ref()
        && let Err(e) = t.send_text(frame.value.to_string()).await
    {
        warn!(error = %e, id = frame.id, "failed to write frame");
    }
}

async fn attempt_open<T: Transport + 'static>(
    session: &mut Session<T>,
    state_tx: &watch::Sender<Phase>,
) {
    session.response.reset();
    let _ = state_tx.send(session.response.phase().clone());
    match T::open(session.endpoint.websocket_url()).await {
        Ok(mut t) => {
            session.inbound = Some(t.inbound());
            session.transport = Some(t);
        }
        Err(e) => {
            warn!(error = %e, "failed to open transport");
            session.response.mark_disconnected(Some(e.to_string()), false);
            let _ = state_tx.send(session.response.phase().clone());
            if session.reconnect.should_reconnect() {
                session.reconnect_at = Some(Instant::now() + session.reconnect.next_delay());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Mutex as StdMutex, OnceLock};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::timeout;

    use homelink_core::config::ReconnectPolicy;
    use homelink_core::token::StaticToken;
    use homelink_core::{TransportError, TransportId};

    use super::*;

    /// Per-url registration: the `sent_tx` side a not-yet-opened
    /// `FakeTransport` will clone to report frames the client writes.
    static REGISTRY: OnceLock<StdMutex<HashMap<String, mpsc::UnboundedSender<String>>>> =
        OnceLock::new();

    fn registry() -> &'static StdMutex<HashMap<String, mpsc::UnboundedSender<String>>> {
        REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
    }

    /// The test-side handle to one fake WebSocket connection attempt.
    struct FakeServer {
        inbound_tx: mpsc::UnboundedSender<homelink_core::TransportResult<Message>>,
        sent_rx: mpsc::UnboundedReceiver<String>,
    }

    impl FakeServer {
        /// Registers a server ready to accept the *next* `FakeTransport::open`
        /// call for `url`. Must be called before the orchestrator attempts to
        /// (re)connect.
        fn register(url: &str) -> Self {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            registry()
                .lock()
                .unwrap()
                .insert(url.to_string(), sent_tx);
            INBOUND_RX.lock().unwrap().insert(url.to_string(), inbound_rx);
            Self { inbound_tx, sent_rx }
        }

        fn send_text(&self, text: impl Into<String>) {
            let _ = self.inbound_tx.send(Ok(Message::Text(text.into())));
        }

        fn close(&self, reason: &str) {
            let _ = self.inbound_tx.send(Err(TransportError::ConnectionClosed {
                reason: reason.to_string(),
            }));
        }

        async fn recv_sent(&mut self) -> Value {
            let text = timeout(Duration::from_secs(1), self.sent_rx.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("sender dropped");
            serde_json::from_str(&text).expect("client frame was not valid JSON")
        }
    }

    static INBOUND_RX: OnceLock<
        StdMutex<HashMap<String, mpsc::UnboundedReceiver<homelink_core::TransportResult<Message>>>>,
    > = OnceLock::new();

    fn inbound_rx_registry()
    -> &'static StdMutex<HashMap<String, mpsc::UnboundedReceiver<homelink_core::TransportResult<Message>>>>
    {
        INBOUND_RX.get_or_init(|| StdMutex::new(HashMap::new()))
    }

    struct FakeTransport {
        id: TransportId,
        sent_tx: mpsc::UnboundedSender<String>,
        inbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<homelink_core::TransportResult<Message>>>>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(url: url::Url) -> homelink_core::TransportResult<Self> {
            let key = url.as_str().to_string();
            let sent_tx = registry()
                .lock()
                .unwrap()
                .get(&key)
                .unwrap_or_else(|| panic!("no FakeServer registered for {key}"))
                .clone();
            let inbound_rx = inbound_rx_registry()
                .lock()
                .unwrap()
                .remove(&key)
                .unwrap_or_else(|| panic!("FakeTransport opened twice for {key} without re-registering"));
            Ok(Self {
                id: TransportId(1),
                sent_tx,
                inbound_rx: StdMutex::new(Some(inbound_rx)),
            })
        }

        fn inbound(&mut self) -> BoxStream<'static, homelink_core::TransportResult<Message>> {
            let rx = self.inbound_rx.lock().unwrap().take().expect("inbound() called twice");
            Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|v| (v, rx))
            }))
        }

        async fn send_text(&self, text: String) -> homelink_core::TransportResult<()> {
            self.sent_tx
                .send(text)
                .map_err(|_| TransportError::SendFailed("fake server gone".into()))
        }

        fn cancel(&self, _reason: &str) {}

        fn id(&self) -> TransportId {
            self.id
        }
    }

    struct FakeRestClient;

    #[async_trait]
    impl RestClient for FakeRestClient {
        async fn call(
            &self,
            _method: Method,
            _url: url::Url,
            _host_header: String,
            _user_agent: Option<String>,
            _bearer_token: Option<String>,
            _body: Option<Value>,
        ) -> homelink_core::TransportResult<(u16, Option<String>, String)> {
            Ok((200, Some("application/json".to_string()), "{}".to_string()))
        }
    }

    /// A `RestClient` whose `call` doesn't resolve until `gate` is notified,
    /// used to prove a slow REST call doesn't stall the session's select loop.
    struct SlowRestClient {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl RestClient for SlowRestClient {
        async fn call(
            &self,
            _method: Method,
            _url: url::Url,
            _host_header: String,
            _user_agent: Option<String>,
            _bearer_token: Option<String>,
            _body: Option<Value>,
        ) -> homelink_core::TransportResult<(u16, Option<String>, String)> {
            self.gate.notified().await;
            Ok((200, Some("application/json".to_string()), "{}".to_string()))
        }
    }

    fn test_options(url: &str) -> ClientOptions {
        ClientOptions::new(url).with_reconnect(ReconnectPolicy {
            auto_reconnect: true,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter_fraction: 0.0,
        })
    }

    async fn wait_for_command(conn: &Connection) -> String {
        let mut state = conn.state();
        loop {
            if let Phase::Command { server_version } = &*state.borrow() {
                return server_version.clone();
            }
            timeout(Duration::from_secs(1), state.changed())
                .await
                .expect("timed out waiting for Command phase")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn happy_path_auth_then_get_states() {
        let url = "http://hass-happy.test:8123";
        let ws_url = Endpoint::new(url, None).unwrap().websocket_url().to_string();
        let mut server = FakeServer::register(&ws_url);

        let conn = Connection::spawn::<FakeTransport, FakeRestClient, StaticToken>(
            test_options(url),
            Arc::new(StaticToken::new("secret-token")),
            Arc::new(FakeRestClient),
        )
        .unwrap();
        conn.connect().await;

        server.send_text(r#"{"type":"auth_required","ha_version":"2024.1"}"#);
        let auth_frame = server.recv_sent().await;
        assert_eq!(auth_frame["type"], "auth");
        assert_eq!(auth_frame["access_token"], "secret-token");

        server.send_text(r#"{"type":"auth_ok","ha_version":"2024.1"}"#);
        let version = wait_for_command(&conn).await;
        assert_eq!(version, "2024.1");

        let conn2 = conn.clone();
        let send_fut = tokio::spawn(async move {
            conn2.send(Request::new("get_states", json!({}))).await
        });

        let wire = server.recv_sent().await;
        assert_eq!(wire["id"], 1);
        assert_eq!(wire["type"], "get_states");

        server.send_text(r#"{"id":1,"type":"result","success":true,"result":[]}"#);
        let result = send_fut.await.unwrap().unwrap();
        assert_eq!(result, json!([]));
    }

    #[tokio::test]
    async fn reconnect_resubscribes_under_a_new_id_with_no_duplicate_events() {
        let url = "http://hass-reconnect.test:8123";
        let ws_url = Endpoint::new(url, None).unwrap().websocket_url().to_string();
        let mut server = FakeServer::register(&ws_url);

        let conn = Connection::spawn::<FakeTransport, FakeRestClient, StaticToken>(
            test_options(url),
            Arc::new(StaticToken::new("secret-token")),
            Arc::new(FakeRestClient),
        )
        .unwrap();
        conn.connect().await;

        server.send_text(r#"{"type":"auth_required"}"#);
        let _auth = server.recv_sent().await;
        server.send_text(r#"{"type":"auth_ok","ha_version":"2024.1"}"#);
        wait_for_command(&conn).await;

        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        let sink: EventSink = Arc::new(move |v| received2.lock().unwrap().push(v));
        let (_token, _completion_rx) = conn
            .subscribe(
                Request::new("subscribe_events", json!({})).retryable(),
                sink,
            )
            .await
            .unwrap();

        let sub_frame = server.recv_sent().await;
        let old_id = sub_frame["id"].as_u64().unwrap();

        // Re-register before closing: the reconnect delay is a few
        // milliseconds, so the new fake server must already be in place.
        let mut server2 = FakeServer::register(&ws_url);
        server.close("simulated drop");

        server2.send_text(r#"{"type":"auth_required"}"#);
        let _auth2 = server2.recv_sent().await;
        server2.send_text(r#"{"type":"auth_ok","ha_version":"2024.1"}"#);
        wait_for_command(&conn).await;

        let resub_frame = server2.recv_sent().await;
        let new_id = resub_frame["id"].as_u64().unwrap();
        assert_ne!(new_id, old_id);

        server2.send_text(json!({"id": new_id, "type": "event", "event": {"x": 1}}).to_string());
        server2.send_text(json!({"id": old_id, "type": "event", "event": {"x": 2}}).to_string());

        // Give the event delivered for `new_id` time to land before asserting.
        timeout(Duration::from_millis(200), async {
            loop {
                if !received.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event was never delivered");

        let events = received.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["x"], 1);
    }

    #[tokio::test]
    async fn auth_failure_does_not_schedule_automatic_reconnect() {
        let url = "http://hass-authfail.test:8123";
        let ws_url = Endpoint::new(url, None).unwrap().websocket_url().to_string();
        let mut server = FakeServer::register(&ws_url);

        let conn = Connection::spawn::<FakeTransport, FakeRestClient, StaticToken>(
            test_options(url),
            Arc::new(StaticToken::new("bad-token")),
            Arc::new(FakeRestClient),
        )
        .unwrap();
        conn.connect().await;

        server.send_text(r#"{"type":"auth_required"}"#);
        let _auth = server.recv_sent().await;
        server.send_text(r#"{"type":"auth_invalid","message":"bad"}"#);

        let mut state = conn.state();
        loop {
            let phase = state.borrow().clone();
            if let Phase::Disconnected { error, for_reset } = &phase {
                assert_eq!(error.as_deref(), Some("bad"));
                assert!(!for_reset);
                break;
            }
            timeout(Duration::from_secs(1), state.changed())
                .await
                .expect("timed out waiting for Disconnected phase")
                .unwrap();
        }

        // No second FakeServer was registered for this url: if the
        // orchestrator attempted another open, FakeTransport::open would
        // panic in its background task. Give it a generous window (several
        // multiples of the configured backoff) and confirm phase never moves.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(conn.current_phase(), Phase::Disconnected { .. }));
    }

    #[tokio::test]
    async fn reconfigure_to_a_different_endpoint_tears_down_and_reconnects() {
        let url_a = "http://hass-reconfig-a.test:8123";
        let url_b = "http://hass-reconfig-b.test:8123";
        let ws_url_a = Endpoint::new(url_a, None).unwrap().websocket_url().to_string();
        let ws_url_b = Endpoint::new(url_b, None).unwrap().websocket_url().to_string();
        let mut server_a = FakeServer::register(&ws_url_a);

        let conn = Connection::spawn::<FakeTransport, FakeRestClient, StaticToken>(
            test_options(url_a),
            Arc::new(StaticToken::new("secret-token")),
            Arc::new(FakeRestClient),
        )
        .unwrap();
        conn.connect().await;

        server_a.send_text(r#"{"type":"auth_required"}"#);
        let _auth = server_a.recv_sent().await;
        server_a.send_text(r#"{"type":"auth_ok","ha_version":"2024.1"}"#);
        wait_for_command(&conn).await;

        let mut server_b = FakeServer::register(&ws_url_b);
        conn.reconfigure(test_options(url_b)).await.unwrap();

        server_b.send_text(r#"{"type":"auth_required"}"#);
        let _auth_b = server_b.recv_sent().await;
        server_b.send_text(r#"{"type":"auth_ok","ha_version":"2024.2"}"#);
        let version = wait_for_command(&conn).await;
        assert_eq!(version, "2024.2");

        // The old transport was torn down rather than kept alongside the new
        // one: server_a never receives anything further.
        assert!(timeout(Duration::from_millis(50), server_a.sent_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reconfigure_to_the_same_endpoint_does_not_replace_transport() {
        let url = "http://hass-reconfig-same.test:8123";
        let ws_url = Endpoint::new(url, None).unwrap().websocket_url().to_string();
        let mut server = FakeServer::register(&ws_url);

        let conn = Connection::spawn::<FakeTransport, FakeRestClient, StaticToken>(
            test_options(url),
            Arc::new(StaticToken::new("secret-token")),
            Arc::new(FakeRestClient),
        )
        .unwrap();
        conn.connect().await;

        server.send_text(r#"{"type":"auth_required"}"#);
        let _auth = server.recv_sent().await;
        server.send_text(r#"{"type":"auth_ok","ha_version":"2024.1"}"#);
        wait_for_command(&conn).await;

        // Same url (normalizes to the same endpoint): no second FakeServer is
        // registered, so a second `FakeTransport::open` call would panic.
        conn.reconfigure(test_options(url)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.current_phase(), Phase::Command { server_version: "2024.1".into() });
    }

    #[tokio::test]
    async fn rest_call_in_flight_does_not_block_session_activity() {
        let url = "http://hass-rest-nonblocking.test:8123";
        let ws_url = Endpoint::new(url, None).unwrap().websocket_url().to_string();
        let mut server = FakeServer::register(&ws_url);

        let gate = Arc::new(Notify::new());
        let conn = Connection::spawn::<FakeTransport, SlowRestClient, StaticToken>(
            test_options(url),
            Arc::new(StaticToken::new("secret-token")),
            Arc::new(SlowRestClient { gate: gate.clone() }),
        )
        .unwrap();
        conn.connect().await;

        server.send_text(r#"{"type":"auth_required"}"#);
        let _auth = server.recv_sent().await;
        server.send_text(r#"{"type":"auth_ok","ha_version":"2024.1"}"#);
        wait_for_command(&conn).await;

        let conn2 = conn.clone();
        let rest_fut = tokio::spawn(async move {
            conn2
                .rest(RestRequest {
                    method: Method::Get,
                    path: "api/states".into(),
                    query: Vec::new(),
                    body: None,
                })
                .await
        });

        // The REST call is now parked on `gate`. If it ran inline on the
        // session's select loop, the send below would never get a turn.
        let conn3 = conn.clone();
        let send_fut =
            tokio::spawn(async move { conn3.send(Request::new("get_states", json!({}))).await });
        let wire = server.recv_sent().await;
        assert_eq!(wire["type"], "get_states");
        server.send_text(r#"{"id":1,"type":"result","success":true,"result":[]}"#);
        let send_result = timeout(Duration::from_secs(1), send_fut)
            .await
            .expect("send stalled behind in-flight REST call")
            .unwrap()
            .unwrap();
        assert_eq!(send_result, json!([]));

        gate.notify_one();
        let rest_result = rest_fut.await.unwrap().unwrap();
        assert_eq!(rest_result, json!({}));
    }
}
