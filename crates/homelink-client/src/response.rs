//! Response controller: parses inbound frames, classifies them, and owns
//! the single source of truth for connection phase.

use serde_json::Value;

use homelink_core::model::{AuthState, ErrorInfo, RawFrame, WebSocketResponse};
use homelink_core::{Identifier, Phase};

/// What the orchestrator should do after feeding one inbound frame through
/// the response controller.
pub enum DemuxOutcome {
    /// Phase changed; the orchestrator should react (e.g. fetch and send an
    /// auth token, or schedule a reconnect).
    PhaseChanged,
    /// The server rejected the auth frame. Distinct from the generic
    /// `PhaseChanged` so the orchestrator can suppress automatic reconnection
    /// with the same (presumably still-bad) token until the caller explicitly
    /// calls `connect()` again.
    AuthRejected { message: String },
    /// An event arrived for a live or stale subscription id.
    Event { id: Identifier, data: Value },
    /// A result arrived for a pending single or subscription id.
    Result {
        id: Identifier,
        outcome: Result<Value, ErrorInfo>,
    },
    /// The frame was malformed or irrelevant; nothing to do.
    Ignored,
}

/// Owns [`Phase`] and converts raw text frames into [`DemuxOutcome`]s.
pub struct ResponseController {
    phase: Phase,
}

impl ResponseController {
    pub fn new() -> Self {
        Self {
            phase: Phase::initial(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Forces phase back to the initial disconnected state, e.g. after the
    /// transport is torn down.
    pub fn reset(&mut self) {
        self.phase = Phase::initial();
    }

    pub fn mark_disconnected(&mut self, error: Option<String>, for_reset: bool) {
        self.phase = Phase::Disconnected { error, for_reset };
    }

    /// Feeds one inbound text frame through classification, updating phase
    /// as a side effect.
    pub fn on_text(&mut self, text: &str) -> DemuxOutcome {
        // Fast rejection before the authoritative parse: every auth_required
        // frame contains this literal substring, so we can short-circuit
        // classification without waiting on a successful parse.
        let looks_like_auth_required = text.contains("auth_required");

        let frame: RawFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(_) if looks_like_auth_required => {
                self.phase = Phase::Authenticating;
                return DemuxOutcome::PhaseChanged;
            }
            Err(_) => return DemuxOutcome::Ignored,
        };

        match frame.frame_type.as_deref() {
            Some("auth_required") => {
                self.phase = Phase::Authenticating;
                DemuxOutcome::PhaseChanged
            }
            Some("auth_ok") => {
                self.phase = Phase::Command {
                    server_version: frame.ha_version.unwrap_or_default(),
                };
                DemuxOutcome::PhaseChanged
            }
            Some("auth_invalid") => {
                let message = frame
                    .message
                    .unwrap_or_else(|| "authentication rejected".into());
                self.phase = Phase::Disconnected {
                    error: Some(message.clone()),
                    for_reset: false,
                };
                DemuxOutcome::AuthRejected { message }
            }
            Some("event") => match (frame.id, frame.event) {
                (Some(id), Some(data)) => DemuxOutcome::Event { id, data },
                _ => DemuxOutcome::Ignored,
            },
            Some("result") => match frame.id {
                Some(id) => {
                    let outcome = match frame.success {
                        Some(true) => Ok(frame.result.unwrap_or(Value::Null)),
                        _ => Err(frame.error.unwrap_or(ErrorInfo {
                            code: "unknown_error".into(),
                            message: "command failed with no error detail".into(),
                        })),
                    };
                    DemuxOutcome::Result { id, outcome }
                }
                None => DemuxOutcome::Ignored,
            },
            _ if looks_like_auth_required => {
                self.phase = Phase::Authenticating;
                DemuxOutcome::PhaseChanged
            }
            _ => DemuxOutcome::Ignored,
        }
    }

    /// Classifies an HTTP REST response into the same `WebSocketResponse`
    /// shape used for the WebSocket path, so both share one delivery pipeline.
    ///
    /// A JSON (or absent) content type is parsed; anything else is delivered
    /// as a plain string, even when the body happens to look like valid JSON.
    pub fn classify_http(status: u16, content_type: Option<String>, body: String) -> WebSocketResponse {
        if status >= 400 {
            return WebSocketResponse::Result {
                id: 0,
                outcome: Err(ErrorInfo {
                    code: status.to_string(),
                    message: if body.is_empty() {
                        "unacceptable status code".into()
                    } else {
                        body
                    },
                }),
            };
        }
        let is_json = content_type
            .as_deref()
            .is_none_or(|ct| ct.eq_ignore_ascii_case("application/json"));
        let value = if is_json {
            serde_json::from_str::<Value>(&body).unwrap_or(Value::String(body))
        } else {
            Value::String(body)
        };
        WebSocketResponse::Result {
            id: 0,
            outcome: Ok(value),
        }
    }
}

impl Default for ResponseController {
    fn default() -> Self {
        Self::new()
    }
}

/// Constructs the `AuthState::Required` transition variant for callers that
/// want to pattern-match on the high-level enum instead of [`DemuxOutcome`].
pub fn auth_state_from_phase(phase: &Phase) -> Option<AuthState> {
    match phase {
        Phase::Authenticating => Some(AuthState::Required),
        Phase::Command { server_version } => Some(AuthState::Ok {
            server_version: server_version.clone(),
        }),
        Phase::Disconnected {
            error: Some(msg), ..
        } => Some(AuthState::Invalid {
            message: msg.clone(),
        }),
        Phase::Disconnected { error: None, .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_required_transitions_to_authenticating() {
        let mut ctrl = ResponseController::new();
        let outcome = ctrl.on_text(r#"{"type":"auth_required","ha_version":"2024.1"}"#);
        assert!(matches!(outcome, DemuxOutcome::PhaseChanged));
        assert_eq!(*ctrl.phase(), Phase::Authenticating);
    }

    #[test]
    fn auth_ok_transitions_to_command_with_version() {
        let mut ctrl = ResponseController::new();
        ctrl.on_text(r#"{"type":"auth_required"}"#);
        ctrl.on_text(r#"{"type":"auth_ok","ha_version":"2024.1"}"#);
        assert_eq!(
            *ctrl.phase(),
            Phase::Command {
                server_version: "2024.1".into()
            }
        );
    }

    #[test]
    fn auth_invalid_transitions_to_disconnected_non_reset() {
        let mut ctrl = ResponseController::new();
        ctrl.on_text(r#"{"type":"auth_invalid","message":"bad token"}"#);
        match ctrl.phase() {
            Phase::Disconnected { error, for_reset } => {
                assert_eq!(error.as_deref(), Some("bad token"));
                assert!(!for_reset);
            }
            _ => panic!("expected Disconnected"),
        }
    }

    #[test]
    fn result_frame_without_success_flag_is_an_error() {
        let mut ctrl = ResponseController::new();
        let outcome = ctrl.on_text(r#"{"id":3,"type":"result"}"#);
        match outcome {
            DemuxOutcome::Result { id, outcome } => {
                assert_eq!(id, 3);
                assert!(outcome.is_err());
            }
            _ => panic!("expected Result"),
        }
    }

    #[test]
    fn malformed_text_is_ignored() {
        let mut ctrl = ResponseController::new();
        assert!(matches!(ctrl.on_text("not json"), DemuxOutcome::Ignored));
    }

    #[test]
    fn http_4xx_is_classified_as_external_error() {
        let resp = ResponseController::classify_http(401, None, "nope".into());
        match resp {
            WebSocketResponse::Result { outcome: Err(e), .. } => {
                assert_eq!(e.code, "401");
                assert_eq!(e.message, "nope");
            }
            _ => panic!("expected Err"),
        }
    }

    #[test]
    fn json_content_type_parses_body() {
        // `RestClient::call` contractually strips `;`-parameters before this
        // is ever reached, so the content type here is already bare.
        let resp = ResponseController::classify_http(200, Some("application/json".into()), "42".into());
        match resp {
            WebSocketResponse::Result { outcome: Ok(v), .. } => assert_eq!(v, Value::from(42)),
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn absent_content_type_parses_body() {
        let resp = ResponseController::classify_http(200, None, "true".into());
        match resp {
            WebSocketResponse::Result { outcome: Ok(v), .. } => assert_eq!(v, Value::Bool(true)),
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn non_json_content_type_is_delivered_as_string_even_if_parseable() {
        let resp = ResponseController::classify_http(200, Some("text/plain".into()), "true".into());
        match resp {
            WebSocketResponse::Result { outcome: Ok(v), .. } => {
                assert_eq!(v, Value::String("true".into()))
            }
            _ => panic!("expected Ok"),
        }
    }
}
