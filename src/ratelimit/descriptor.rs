//! Rate limit key derivation for inbound calls.

use super::rules::RateLimitConfig;

/// Transport-level details of an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Request method, e.g. `GET`
    pub method: String,
    /// Request target path
    pub path: String,
    /// Raw `X-Forwarded-For` header value, if present
    pub forwarded_for: Option<String>,
    /// Address of the directly connected peer
    pub peer_addr: String,
}

impl RequestInfo {
    /// Describe a request from its method, path and peer address.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        peer_addr: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            forwarded_for: None,
            peer_addr: peer_addr.into(),
        }
    }

    /// Attach an `X-Forwarded-For` header value.
    pub fn with_forwarded_for(mut self, header: impl Into<String>) -> Self {
        self.forwarded_for = Some(header.into());
        self
    }

    /// The client address: the first forwarded-for entry, else the peer address.
    pub fn client_ip(&self) -> &str {
        self.forwarded_for
            .as_deref()
            .and_then(|header| header.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .unwrap_or(self.peer_addr.as_str())
    }
}

/// Everything known about the call being admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Qualified name of the invoked component, e.g. `OrderService:create`
    pub component: String,
    /// The inbound request, when the call originates from one
    pub request: Option<RequestInfo>,
}

impl CallContext {
    /// A call made outside any request, identified by component name only.
    pub fn component(name: impl Into<String>) -> Self {
        Self {
            component: name.into(),
            request: None,
        }
    }

    /// A call serving an inbound request.
    pub fn request(component: impl Into<String>, request: RequestInfo) -> Self {
        Self {
            component: component.into(),
            request: Some(request),
        }
    }

    /// Derive the rate limit key for this call under `config`.
    ///
    /// Precedence: the configured explicit key, then `client_ip:METHOD:path`,
    /// then the component name.
    pub fn derive_key(&self, config: &RateLimitConfig) -> String {
        if let Some(key) = config.key() {
            return key.to_string();
        }

        match &self.request {
            Some(request) => format!(
                "{}:{}:{}",
                request.client_ip(),
                request.method,
                request.path
            ),
            None => self.component.clone(),
        }
    }
}
