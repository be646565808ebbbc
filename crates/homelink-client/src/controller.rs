//! Request/subscription controller.
//!
//! Allocates correlation identifiers, tracks pending single-shot calls and
//! long-lived subscriptions, and replays both across a reconnect. Mirrors
//! the echo/`pending_calls` correlation pattern used for request/response
//! matching elsewhere in this codebase, generalized to also carry
//! subscriptions that outlive a single request.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;

use homelink_core::error::ApiError;
use homelink_core::model::{ErrorInfo, Identifier, Request};

/// A single-shot pending call awaiting exactly one `Result`.
pub struct PendingSingle {
    pub request: Request,
    resolver: Option<oneshot::Sender<Result<Value, ApiError>>>,
}

impl PendingSingle {
    fn resolve(&mut self, outcome: Result<Value, ApiError>) {
        if let Some(tx) = self.resolver.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// An event sink invoked for every event delivered to a subscription.
pub type EventSink = Arc<dyn Fn(Value) + Send + Sync>;

/// A long-lived subscription: 0..N events followed by exactly one terminal
/// result (success = unsubscribed; failure = the subscribe call itself failed).
pub struct Subscription {
    pub request: Request,
    sink: EventSink,
    completion: std::sync::Mutex<Option<oneshot::Sender<Result<(), ApiError>>>>,
}

impl Subscription {
    fn deliver_event(&self, data: Value) {
        (self.sink)(data);
    }

    fn complete(&self, outcome: Result<(), ApiError>) {
        if let Some(tx) = self.completion.lock().unwrap().take() {
            let _ = tx.send(outcome);
        }
    }
}

/// A cancellation handle returned to subscribers.
#[derive(Clone)]
pub struct CancelToken {
    id: Arc<std::sync::atomic::AtomicU64>,
}

impl CancelToken {
    fn new(id: Identifier) -> Self {
        Self {
            id: Arc::new(std::sync::atomic::AtomicU64::new(id)),
        }
    }

    pub fn current_id(&self) -> Identifier {
        self.id.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn rewrite(&self, id: Identifier) {
        self.id.store(id, std::sync::atomic::Ordering::SeqCst);
    }
}

/// A request to be written to the wire, as produced by the controller.
pub struct OutboundFrame {
    pub id: Identifier,
    pub value: Value,
}

/// Owns every in-flight single and subscription for one session.
#[derive(Default)]
pub struct RequestController {
    next_id: Identifier,
    pending: HashMap<Identifier, PendingSingle>,
    subscriptions: HashMap<Identifier, (CancelToken, Subscription)>,
    queued: VecDeque<QueuedRequest>,
}

enum QueuedRequest {
    Single(Request, oneshot::Sender<Result<Value, ApiError>>),
    Subscription(Request, CancelToken, EventSink, Option<oneshot::Sender<Result<(), ApiError>>>),
}

impl RequestController {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            queued: VecDeque::new(),
        }
    }

    fn allocate(&mut self) -> Identifier {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Submits a single-shot request. Returns the frame to send immediately
    /// when `connected`, or `None` when the request was queued.
    pub fn submit_single(
        &mut self,
        request: Request,
        connected: bool,
    ) -> (oneshot::Receiver<Result<Value, ApiError>>, Option<OutboundFrame>) {
        let (tx, rx) = oneshot::channel();
        if connected {
            let id = self.allocate();
            let value = request.to_wire(id);
            self.pending.insert(
                id,
                PendingSingle {
                    request,
                    resolver: Some(tx),
                },
            );
            (rx, Some(OutboundFrame { id, value }))
        } else {
            self.queued.push_back(QueuedRequest::Single(request, tx));
            (rx, None)
        }
    }

    /// Submits a subscription. Returns the cancel token, the completion
    /// receiver, and the frame to send immediately when `connected`.
    pub fn submit_subscription(
        &mut self,
        request: Request,
        sink: EventSink,
        connected: bool,
    ) -> (
        CancelToken,
        oneshot::Receiver<Result<(), ApiError>>,
        Option<OutboundFrame>,
    ) {
        let (tx, rx) = oneshot::channel();
        if connected {
            let id = self.allocate();
            let token = CancelToken::new(id);
            let value = request.to_wire(id);
            let sub = Subscription {
                request,
                sink,
                completion: std::sync::Mutex::new(Some(tx)),
            };
            self.subscriptions.insert(id, (token.clone(), sub));
            (token, rx, Some(OutboundFrame { id, value }))
        } else {
            let token = CancelToken::new(0);
            self.queued.push_back(QueuedRequest::Subscription(
                request,
                token.clone(),
                sink,
                Some(tx),
            ));
            (token, rx, None)
        }
    }

    /// Delivers a `result` frame to the owning single or subscription.
    pub fn resolve_result(&mut self, id: Identifier, outcome: Result<Value, ErrorInfo>) {
        let mapped = outcome
            .clone()
            .map_err(|e| ApiError::External { code: e.code, message: e.message });
        if let Some(mut single) = self.pending.remove(&id) {
            single.resolve(mapped);
            return;
        }
        if let Some((_, sub)) = self.subscriptions.remove(&id) {
            let completion = match outcome {
                Ok(_) => Ok(()),
                Err(e) => Err(ApiError::External { code: e.code, message: e.message }),
            };
            sub.complete(completion);
        }
    }

    /// Delivers an `event` frame to its subscription's sink. No-op if the
    /// identifier is unknown (already cancelled, or a stale replay id).
    pub fn deliver_event(&self, id: Identifier, data: Value) {
        if let Some((_, sub)) = self.subscriptions.get(&id) {
            sub.deliver_event(data);
        } else {
            tracing::debug!(id, "event for unknown subscription dropped");
        }
    }

    /// Invoked when phase reaches `Command`: flushes every queued request,
    /// allocating a fresh id for each. `reset_active` is expected to have
    /// already moved every live subscription into `queued`, so this is the
    /// only place subscriptions are re-submitted after a reconnect.
    pub fn prepare(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();

        while let Some(item) = self.queued.pop_front() {
            match item {
                QueuedRequest::Single(request, tx) => {
                    let id = self.allocate();
                    let value = request.to_wire(id);
                    frames.push(OutboundFrame { id, value: value.clone() });
                    self.pending.insert(
                        id,
                        PendingSingle {
                            request,
                            resolver: Some(tx),
                        },
                    );
                }
                QueuedRequest::Subscription(request, token, sink, completion) => {
                    let id = self.allocate();
                    token.rewrite(id);
                    let value = request.to_wire(id);
                    frames.push(OutboundFrame { id, value: value.clone() });
                    let sub = Subscription {
                        request,
                        sink,
                        completion: std::sync::Mutex::new(completion),
                    };
                    self.subscriptions.insert(id, (token, sub));
                }
            }
        }

        frames
    }

    /// Invoked on leaving `Command`. Non-retryable singles fail immediately;
    /// retryable singles and every subscription return to `queued` for
    /// replay by the next `prepare()`.
    pub fn reset_active(&mut self) {
        let pending: Vec<(Identifier, PendingSingle)> = self.pending.drain().collect();
        for (_, mut single) in pending {
            if single.request.should_retry {
                let resolver = single.resolver.take().unwrap();
                self.queued
                    .push_back(QueuedRequest::Single(single.request, resolver));
            } else {
                single.resolve(Err(ApiError::Cancelled));
            }
        }

        let subs: Vec<(Identifier, (CancelToken, Subscription))> = self.subscriptions.drain().collect();
        for (_, (token, sub)) in subs {
            let completion = sub.completion.into_inner().unwrap();
            self.queued.push_back(QueuedRequest::Subscription(
                sub.request,
                token,
                sub.sink,
                completion,
            ));
        }
    }

    /// Cancels a subscription locally and returns the `unsubscribe` frame to
    /// best-effort send, if the subscription is currently live.
    pub fn cancel(&mut self, token: &CancelToken) -> Option<OutboundFrame> {
        let id = token.current_id();
        if let Some((_, sub)) = self.subscriptions.remove(&id) {
            sub.complete(Ok(()));
            let unsub_id = self.allocate();
            let unsub = Request::new("unsubscribe_events", serde_json::json!({ "subscription": id }));
            return Some(OutboundFrame {
                id: unsub_id,
                value: unsub.to_wire(unsub_id),
            });
        }
        self.queued.retain(|item| match item {
            QueuedRequest::Subscription(_, t, _, _) => t.current_id() != id,
            _ => true,
        });
        None
    }

    /// Fails every pending single and subscription with `Cancelled`; used on
    /// permanent disconnect.
    pub fn cancel_all(&mut self) {
        for (_, mut single) in self.pending.drain() {
            single.resolve(Err(ApiError::Cancelled));
        }
        for (_, (_, sub)) in self.subscriptions.drain() {
            sub.complete(Err(ApiError::Cancelled));
        }
        for item in self.queued.drain(..) {
            match item {
                QueuedRequest::Single(_, tx) => {
                    let _ = tx.send(Err(ApiError::Cancelled));
                }
                QueuedRequest::Subscription(_, _, _, Some(tx)) => {
                    let _ = tx.send(Err(ApiError::Cancelled));
                }
                QueuedRequest::Subscription(_, _, _, None) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let mut ctrl = RequestController::new();
        let (_, f1) = ctrl.submit_single(Request::new("get_states", Value::Null), true);
        let (_, f2) = ctrl.submit_single(Request::new("get_states", Value::Null), true);
        assert_eq!(f1.unwrap().id, 1);
        assert_eq!(f2.unwrap().id, 2);
    }

    #[tokio::test]
    async fn single_resolves_exactly_once() {
        let mut ctrl = RequestController::new();
        let (rx, frame) = ctrl.submit_single(Request::new("get_states", Value::Null), true);
        let id = frame.unwrap().id;
        ctrl.resolve_result(id, Ok(Value::String("ok".into())));
        let result = rx.await.unwrap();
        assert!(result.is_ok());
        // Second resolution for the same id is a no-op (already removed).
        ctrl.resolve_result(id, Ok(Value::Null));
    }

    #[test]
    fn subscription_survives_reconnect_under_new_id() {
        let mut ctrl = RequestController::new();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events2 = events.clone();
        let sink: EventSink = Arc::new(move |v| events2.lock().unwrap().push(v));
        let (token, _rx, frame) = ctrl.submit_subscription(
            Request::new("subscribe_events", Value::Null),
            sink,
            true,
        );
        let old_id = frame.unwrap().id;
        assert_eq!(token.current_id(), old_id);

        ctrl.reset_active();
        let frames = ctrl.prepare();
        assert_eq!(frames.len(), 1);
        let new_id = frames[0].id;
        assert_ne!(new_id, old_id);
        assert_eq!(token.current_id(), new_id);

        ctrl.deliver_event(new_id, serde_json::json!({"x": 1}));
        ctrl.deliver_event(old_id, serde_json::json!({"x": 2}));
        assert_eq!(events.lock().unwrap().len(), 1);
    }
}
