//! Capabilities granted to deployed WASM tools.
//!
//! Guests start with nothing but `host.log` and `host.fail`. Everything else
//! is opt-in: the deploy request has to ask for it and the operator has to
//! have configured it. A module that imports a function it was not granted is
//! rejected before it is ever instantiated.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Import namespace for every host function.
pub const HOST_MODULE: &str = "host";

pub const IMPORT_LOG: &str = "log";
pub const IMPORT_FAIL: &str = "fail";
pub const IMPORT_HTTP_FETCH: &str = "http_fetch";

/// Capability names a deploy request may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Http,
}

impl std::str::FromStr for CapabilityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            other => Err(format!("unknown capability '{}'", other)),
        }
    }
}

/// Everything a single guest is allowed to do.
///
/// By default only logging and failure reporting are available.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Outbound HTTP to allowlisted endpoints.
    pub http: Option<HttpCapability>,
}

impl Capabilities {
    /// Create capabilities with no optional permissions.
    pub fn none() -> Self {
        Self::default()
    }

    /// Enable HTTP requests with the given configuration.
    pub fn with_http(mut self, http: HttpCapability) -> Self {
        self.http = Some(http);
        self
    }

    /// Host functions a guest with these capabilities may import.
    pub fn granted_imports(&self) -> Vec<&'static str> {
        let mut names = vec![IMPORT_LOG, IMPORT_FAIL];
        if self.http.is_some() {
            names.push(IMPORT_HTTP_FETCH);
        }
        names
    }

    pub fn grants(&self, module: &str, name: &str) -> bool {
        module == HOST_MODULE && self.granted_imports().contains(&name)
    }
}

/// HTTP request capability configuration.
#[derive(Debug, Clone)]
pub struct HttpCapability {
    /// Allowed endpoint patterns. Empty denies everything.
    pub allowlist: Vec<EndpointPattern>,
    /// Maximum request body size in bytes.
    pub max_request_bytes: usize,
    /// Maximum response body size in bytes.
    pub max_response_bytes: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpCapability {
    fn default() -> Self {
        Self {
            allowlist: Vec::new(),
            max_request_bytes: 256 * 1024,
            max_response_bytes: 1024 * 1024,
            timeout: Duration::from_secs(5),
        }
    }
}

impl HttpCapability {
    /// Create a new HTTP capability with an allowlist.
    pub fn new(allowlist: Vec<EndpointPattern>) -> Self {
        Self {
            allowlist,
            ..Default::default()
        }
    }

    /// Build from a comma-separated operator allowlist such as
    /// `api.example.com,*.internal.test/v1/`.
    pub fn from_allowlist(spec: &str) -> Option<Self> {
        let patterns: Vec<EndpointPattern> = spec
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(EndpointPattern::parse)
            .collect();
        if patterns.is_empty() {
            None
        } else {
            Some(Self::new(patterns))
        }
    }

    /// Set request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set max response body size.
    pub fn with_max_response_bytes(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes;
        self
    }

    /// Validate a guest request against the allowlist.
    pub fn check(&self, url: &str, method: &str) -> Result<reqwest::Url, String> {
        let parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL: {}", e))?;
        if parsed.scheme() != "https" {
            return Err("only https URLs are allowed".to_string());
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| "URL missing host".to_string())?;
        if self
            .allowlist
            .iter()
            .any(|p| p.matches(host, parsed.path(), method))
        {
            Ok(parsed)
        } else {
            Err(format!("{} {} is not in the allowlist", method, host))
        }
    }
}

/// Pattern for matching allowed HTTP endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPattern {
    /// Hostname pattern (e.g., "api.example.com", "*.example.com").
    pub host: String,
    /// Path prefix (e.g., "/v1/").
    pub path_prefix: Option<String>,
    /// Allowed HTTP methods (empty = all methods allowed).
    pub methods: Vec<String>,
}

impl EndpointPattern {
    /// Create a pattern for a specific host.
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path_prefix: None,
            methods: Vec::new(),
        }
    }

    /// Parse `host` or `host/path/prefix`.
    pub fn parse(entry: &str) -> Self {
        match entry.find('/') {
            Some(idx) => Self::host(&entry[..idx]).with_path_prefix(&entry[idx..]),
            None => Self::host(entry),
        }
    }

    /// Add a path prefix constraint.
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    /// Restrict to specific HTTP methods.
    pub fn with_methods(mut self, methods: Vec<String>) -> Self {
        self.methods = methods;
        self
    }

    /// Check if this pattern matches a URL and method.
    pub fn matches(&self, url_host: &str, url_path: &str, method: &str) -> bool {
        if !self.host_matches(url_host) {
            return false;
        }

        if let Some(ref prefix) = self.path_prefix
            && !url_path.starts_with(prefix)
        {
            return false;
        }

        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Check if host pattern matches.
    pub fn host_matches(&self, url_host: &str) -> bool {
        if self.host.eq_ignore_ascii_case(url_host) {
            return true;
        }

        // *.example.com matches sub.example.com but not example.com or badexample.com
        if let Some(suffix) = self.host.strip_prefix("*.")
            && url_host.len() > suffix.len() + 1
        {
            let (prefix, tail) = url_host.split_at(url_host.len() - suffix.len());
            return tail.eq_ignore_ascii_case(suffix) && prefix.ends_with('.');
        }

        false
    }
}
