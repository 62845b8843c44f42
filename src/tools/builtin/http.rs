//! `http.fetch`: outbound HTTP requests.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;

use crate::tools::tool::{Tool, ToolContext, ToolError, ToolOutput, require_str};

/// Maximum response body size (5 MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Placeholder hosts a planner tends to invent.
const BLOCKED_HOSTS: &[&str] = &["example.com", "www.example.com", "api.example.com"];

/// Tool for making HTTP requests.
pub struct HttpFetchTool {
    client: Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Static URL checks: https only, no localhost, no placeholder hosts, no private IP literals.
fn validate_url(url: &str) -> Result<reqwest::Url, ToolError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ToolError::InvalidParameters(format!("invalid URL: {}", e)))?;

    if parsed.scheme() != "https" {
        return Err(ToolError::NotAuthorized(
            "only https URLs are allowed".to_string(),
        ));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ToolError::InvalidParameters("URL missing host".to_string()))?
        .to_lowercase();

    if host == "localhost" || host.ends_with(".localhost") {
        return Err(ToolError::NotAuthorized(
            "localhost is not allowed".to_string(),
        ));
    }

    if BLOCKED_HOSTS.contains(&host.as_str()) {
        return Err(ToolError::NotAuthorized(format!(
            "blocked placeholder host ({})",
            host
        )));
    }

    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>()
        && is_disallowed_ip(&ip)
    {
        return Err(ToolError::NotAuthorized(
            "private or local IPs are not allowed".to_string(),
        ));
    }

    Ok(parsed)
}

/// Resolve the host and reject it if any address is private (DNS rebinding).
async fn check_resolved(url: &reqwest::Url) -> Result<(), ToolError> {
    let Some(host) = url.host_str() else {
        return Ok(());
    };
    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ToolError::ExternalService(format!("DNS resolution failed ({}): {}", host, e)))?;
    for addr in addrs {
        if is_disallowed_ip(&addr.ip()) {
            return Err(ToolError::NotAuthorized(format!(
                "hostname '{}' resolves to disallowed IP {}",
                host,
                addr.ip()
            )));
        }
    }
    Ok(())
}

fn is_disallowed_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
                || v6.to_ipv4_mapped().is_some_and(|v4| is_disallowed_ip(&IpAddr::V4(v4)))
        }
    }
}

fn parse_headers(headers: Option<&serde_json::Value>) -> Result<Vec<(String, String)>, ToolError> {
    match headers {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => Ok((k.clone(), s.clone())),
                serde_json::Value::Number(n) => Ok((k.clone(), n.to_string())),
                serde_json::Value::Bool(b) => Ok((k.clone(), b.to_string())),
                _ => Err(ToolError::InvalidParameters(format!(
                    "header '{}' must have a scalar value",
                    k
                ))),
            })
            .collect(),
        Some(_) => Err(ToolError::InvalidParameters(
            "'headers' must be an object".to_string(),
        )),
    }
}

/// `params`/`query` as query-string pairs.
fn parse_query(args: &serde_json::Value) -> Result<Vec<(String, String)>, ToolError> {
    let query = args.get("params").or_else(|| args.get("query"));
    match query {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Object(map)) => Ok(map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()),
        Some(_) => Err(ToolError::InvalidParameters(
            "'params' must be an object".to_string(),
        )),
    }
}

fn parse_timeout(args: &serde_json::Value) -> Result<Duration, ToolError> {
    match args.get("timeoutMs") {
        None | Some(serde_json::Value::Null) => Ok(DEFAULT_TIMEOUT),
        Some(v) => v
            .as_u64()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .ok_or_else(|| {
                ToolError::InvalidParameters("'timeoutMs' must be a positive integer".to_string())
            }),
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http.fetch"
    }

    fn description(&self) -> &str {
        "Make an HTTPS request to a public endpoint. Returns {status, headers, data}."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "https URL to request" },
                "method": {
                    "type": "string",
                    "enum": ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"],
                    "description": "HTTP method (default GET)"
                },
                "headers": { "type": "object", "description": "Request headers" },
                "params": { "type": "object", "description": "Query-string parameters (alias: query)" },
                "data": {
                    "type": ["object", "array", "string", "number", "boolean", "null"],
                    "description": "Request body (alias: body)"
                },
                "timeoutMs": { "type": "integer", "description": "Request timeout (default 20000)" }
            },
            "required": ["url"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext<'_>,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();

        let url = require_str(&params, "url")?;
        let parsed_url = validate_url(url)?;
        check_resolved(&parsed_url).await?;

        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| ToolError::InvalidParameters(format!("unsupported method: {}", method)))?;

        let timeout = parse_timeout(&params)?;
        let mut request = self
            .client
            .request(method, parsed_url.clone())
            .timeout(timeout);

        let query = parse_query(&params)?;
        if !query.is_empty() {
            request = request.query(&query);
        }
        for (key, value) in parse_headers(params.get("headers"))? {
            request = request.header(key, value);
        }
        match params.get("data").or_else(|| params.get("body")) {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::String(s)) => request = request.body(s.clone()),
            Some(body) => request = request.json(body),
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::Timeout(timeout)
            } else if e.is_connect() {
                ToolError::ExternalService(format!("connection failed ({}): {}", parsed_url, e))
            } else {
                ToolError::ExternalService(e.to_string())
            }
        })?;

        let status = response.status().as_u16();

        // Redirects could point anywhere, including private addresses.
        if (300..400).contains(&status) {
            return Err(ToolError::NotAuthorized(format!(
                "request returned redirect (HTTP {}), which is blocked",
                status
            )));
        }

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();

        if let Some(len) = response.content_length()
            && len as usize > MAX_RESPONSE_SIZE
        {
            tracing::warn!(
                url = %parsed_url,
                content_length = len,
                max = MAX_RESPONSE_SIZE,
                "Rejected HTTP response: Content-Length exceeds limit"
            );
            return Err(ToolError::ExecutionFailed(format!(
                "Response Content-Length ({} bytes) exceeds maximum allowed size ({} bytes)",
                len, MAX_RESPONSE_SIZE
            )));
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                ToolError::ExternalService(format!("failed to read response body: {}", e))
            })?;
            if body.len() + chunk.len() > MAX_RESPONSE_SIZE {
                return Err(ToolError::ExecutionFailed(format!(
                    "Response body exceeds maximum allowed size ({} bytes)",
                    MAX_RESPONSE_SIZE
                )));
            }
            body.extend_from_slice(&chunk);
        }

        let text = String::from_utf8_lossy(&body).into_owned();
        let data: serde_json::Value =
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

        tracing::debug!(url = %parsed_url, status, "http.fetch completed");

        Ok(ToolOutput::success(
            serde_json::json!({
                "status": status,
                "headers": headers,
                "data": data,
            }),
            start.elapsed(),
        ))
    }
}
