//! Endpoint descriptor: normalizes a base URL and derives the WebSocket/REST
//! request shapes from it.

use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// A validated, normalized server endpoint.
///
/// Normalization strips any `/api/websocket`, `/api` or trailing `/` suffix
/// so that two URLs differing only in that tail compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: Url,
    user_agent: Option<String>,
}

impl Endpoint {
    /// Parses and normalizes `url`.
    pub fn new(url: &str, user_agent: Option<String>) -> ConfigResult<Self> {
        let mut parsed = Url::parse(url).map_err(|e| {
            if matches!(e, url::ParseError::InvalidPort) {
                let port = url
                    .rsplit_once(':')
                    .and_then(|(_, rest)| rest.trim_end_matches(['/', '?', '#']).parse().ok())
                    .unwrap_or(0);
                ConfigError::InvalidPort { port }
            } else {
                ConfigError::InvalidUrl {
                    reason: e.to_string(),
                }
            }
        })?;

        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidHostname);
        }

        Self::strip_tail(&mut parsed);

        Ok(Self {
            base: parsed,
            user_agent,
        })
    }

    /// Removes `/api/websocket`, then `/api`, then any trailing slashes.
    ///
    /// Idempotent: calling this on an already-normalized URL is a no-op.
    fn strip_tail(url: &mut Url) {
        let mut path = url.path().to_string();
        for suffix in ["/api/websocket", "/api"] {
            if let Some(stripped) = path.strip_suffix(suffix) {
                path = stripped.to_string();
                break;
            }
        }
        while path.ends_with('/') {
            path.pop();
        }
        url.set_path(&path);
    }

    /// The normalized base URL (scheme, host, port, path prefix — no trailing tail).
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Derives the `ws(s)://.../api/websocket` URL used to open the connection.
    pub fn websocket_url(&self) -> Url {
        let mut ws = self.base.clone();
        let scheme = match ws.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => other,
        };
        // `Url::set_scheme` rejects ws/wss transitions from http/https on some
        // inputs because it treats them as "special" schemes inconsistently;
        // rebuild from string instead.
        let rebuilt = format!(
            "{scheme}://{host}{port}{path}/api/websocket",
            scheme = scheme,
            host = ws.host_str().unwrap_or_default(),
            port = ws
                .port()
                .map(|p| format!(":{p}"))
                .unwrap_or_default(),
            path = ws.path(),
        );
        Url::parse(&rebuilt).unwrap_or(ws)
    }

    /// Builds the absolute URL for a REST call rooted at `path` (e.g. `"api/states"`).
    pub fn rest_url(&self, path: &str, query: &[(String, String)]) -> Url {
        let mut url = self.base.clone();
        let joined = format!("{}/{}", url.path(), path.trim_start_matches('/'));
        url.set_path(&joined);
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        url
    }

    /// The `Host` header value: omits the port for 80/443, includes it otherwise.
    pub fn host_header(&self) -> String {
        let host = self.base.host_str().unwrap_or_default();
        match self.base.port() {
            Some(port) if port != 80 && port != 443 => format!("{host}:{port}"),
            _ => host.to_string(),
        }
    }

    /// The configured `User-Agent`, if any.
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Whether `other` points at a different normalized base than `self`.
    pub fn should_replace(&self, other: &Endpoint) -> bool {
        self.base != other.base
    }
}
