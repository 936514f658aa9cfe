//! Feed address resolution.
//!
//! Feed endpoints are configured either as absolute `ws(s)://` URLs or as
//! paths relative to the page (or host) the dashboard was served from. A
//! relative path is promoted to an absolute URL against an [`Origin`],
//! picking the secure scheme exactly when the origin is secure.

use url::Url;

use crate::error::FeedError;

/// The scheme/host pair relative feed paths resolve against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    secure: bool,
    host: String,
}

impl Origin {
    /// Build an origin from a secure flag and a host (with optional port),
    /// e.g. `Origin::new(true, "terminal.example.com:8443")`.
    pub fn new(secure: bool, host: impl Into<String>) -> Self {
        Self {
            secure,
            host: host.into(),
        }
    }

    /// Parse an origin out of a base URL such as `https://terminal.example.com`.
    ///
    /// Accepts `http`, `https`, `ws` and `wss` schemes; the secure variants
    /// map to a secure origin.
    pub fn parse(base: &str) -> Result<Self, FeedError> {
        let url =
            Url::parse(base).map_err(|e| FeedError::Address(format!("{base}: {e}")))?;
        let secure = match url.scheme() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            other => {
                return Err(FeedError::Address(format!(
                    "unsupported scheme {other:?} in origin {base}"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| FeedError::Address(format!("no host in origin {base}")))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self { secure, host })
    }

    /// Origin of the page the client is running on, from `window.location`.
    #[cfg(target_arch = "wasm32")]
    pub fn from_page() -> Option<Self> {
        let location = web_sys::window()?.location();
        let protocol = location.protocol().ok()?;
        let host = location.host().ok()?;
        Some(Self {
            secure: protocol == "https:",
            host,
        })
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Resolve a feed address to an absolute `ws(s)://` URL.
///
/// A leading `/` marks the address as relative; it is combined with the
/// origin's host, under `wss` when the origin is secure and `ws` otherwise.
/// Absolute addresses pass through verbatim, except that `http(s)://`
/// prefixes are mapped to their WebSocket counterparts.
pub fn resolve_address(address: &str, origin: Option<&Origin>) -> Result<String, FeedError> {
    if address.starts_with('/') {
        let origin = origin.ok_or_else(|| {
            FeedError::Address(format!("relative address {address:?} needs an origin"))
        })?;
        let scheme = if origin.secure { "wss" } else { "ws" };
        return Ok(format!("{scheme}://{}{address}", origin.host));
    }

    let absolute = if let Some(rest) = address.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = address.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        address.to_string()
    };

    let url = Url::parse(&absolute).map_err(|e| FeedError::Address(format!("{address}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(absolute),
        other => Err(FeedError::Address(format!(
            "unsupported scheme {other:?} in feed address {address}"
        ))),
    }
}
