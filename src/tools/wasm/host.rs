//! Host functions linked into guest modules.

use std::time::Duration;

use futures::StreamExt;
use wasmtime::{Caller, Extern, Linker, StoreLimits};

use crate::error::WasmError;
use crate::tools::wasm::capabilities::{
    Capabilities, HOST_MODULE, HttpCapability, IMPORT_FAIL, IMPORT_HTTP_FETCH, IMPORT_LOG,
};
use crate::tools::wasm::runtime::{EXPORT_ALLOC, EXPORT_MEMORY};

/// Longest log line a guest may emit.
const MAX_LOG_BYTES: usize = 4096;

/// Outbound HTTP bridge handed to a guest that holds the `http` capability.
///
/// The guest runs on a blocking thread; requests are driven on the async
/// runtime captured in `handle`.
#[derive(Clone)]
pub struct HostHttp {
    pub client: reqwest::Client,
    pub handle: tokio::runtime::Handle,
    pub capability: HttpCapability,
}

/// Per-invocation store data.
pub struct HostState {
    pub(crate) limits: StoreLimits,
    http: Option<HostHttp>,
    failure: Option<String>,
}

impl HostState {
    pub(crate) fn new(limits: StoreLimits, http: Option<HostHttp>) -> Self {
        Self {
            limits,
            http,
            failure: None,
        }
    }

    /// Message passed to `host.fail`, if the guest called it.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = match caller.get_export(EXPORT_MEMORY) {
        Some(Extern::Memory(memory)) => memory,
        _ => return Err(wasmtime::Error::msg("guest has no exported memory")),
    };
    let start = ptr as u32 as usize;
    let end = start.saturating_add(len as u32 as usize);
    memory
        .data(&caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| wasmtime::Error::msg("guest pointer out of bounds"))
}

/// Copy `bytes` into guest memory via the guest's `alloc`, returning the packed region.
fn write_guest(caller: &mut Caller<'_, HostState>, bytes: &[u8]) -> wasmtime::Result<i64> {
    let alloc = match caller.get_export(EXPORT_ALLOC) {
        Some(Extern::Func(func)) => func.typed::<i32, i32>(&caller)?,
        _ => return Err(wasmtime::Error::msg("guest has no alloc export")),
    };
    let len = i32::try_from(bytes.len()).map_err(|_| wasmtime::Error::msg("response too large"))?;
    let ptr = alloc.call(&mut *caller, len)?;
    let memory = match caller.get_export(EXPORT_MEMORY) {
        Some(Extern::Memory(memory)) => memory,
        _ => return Err(wasmtime::Error::msg("guest has no exported memory")),
    };
    memory.write(&mut *caller, ptr as u32 as usize, bytes)?;
    Ok(((ptr as u32 as i64) << 32) | (len as u32 as i64))
}

/// Add every granted host function to `linker`.
pub(crate) fn link(
    linker: &mut Linker<HostState>,
    capabilities: &Capabilities,
) -> Result<(), WasmError> {
    let wrap_err = |e: wasmtime::Error| WasmError::Instantiate(e.to_string());

    linker
        .func_wrap(
            HOST_MODULE,
            IMPORT_LOG,
            |mut caller: Caller<'_, HostState>,
             level: i32,
             ptr: i32,
             len: i32|
             -> wasmtime::Result<()> {
                let len = len.clamp(0, MAX_LOG_BYTES as i32);
                let bytes = read_guest(&mut caller, ptr, len)?;
                let message = String::from_utf8_lossy(&bytes);
                match level {
                    0 => tracing::debug!(target: "ironplan::guest", "{}", message),
                    1 => tracing::info!(target: "ironplan::guest", "{}", message),
                    2 => tracing::warn!(target: "ironplan::guest", "{}", message),
                    _ => tracing::error!(target: "ironplan::guest", "{}", message),
                }
                Ok(())
            },
        )
        .map_err(wrap_err)?;

    linker
        .func_wrap(
            HOST_MODULE,
            IMPORT_FAIL,
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
                let bytes = read_guest(&mut caller, ptr, len)?;
                let message = String::from_utf8_lossy(&bytes).into_owned();
                caller.data_mut().failure = Some(message.clone());
                Err(wasmtime::Error::msg(message))
            },
        )
        .map_err(wrap_err)?;

    if capabilities.http.is_some() {
        linker
            .func_wrap(
                HOST_MODULE,
                IMPORT_HTTP_FETCH,
                |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> wasmtime::Result<i64> {
                    let request = read_guest(&mut caller, ptr, len)?;
                    let response = match caller.data().http.clone() {
                        Some(http) => http_fetch(&http, &request),
                        None => serde_json::json!({"error": "http capability not available"}),
                    };
                    let bytes = serde_json::to_vec(&response)?;
                    write_guest(&mut caller, &bytes)
                },
            )
            .map_err(wrap_err)?;
    }

    Ok(())
}

/// Perform one guest HTTP request. Failures come back to the guest as `{"error": ...}`.
fn http_fetch(http: &HostHttp, request: &[u8]) -> serde_json::Value {
    match try_http_fetch(http, request) {
        Ok(value) => value,
        Err(reason) => {
            tracing::debug!(%reason, "Guest HTTP request refused");
            serde_json::json!({ "error": reason })
        }
    }
}

fn try_http_fetch(http: &HostHttp, request: &[u8]) -> Result<serde_json::Value, String> {
    let request: serde_json::Value =
        serde_json::from_slice(request).map_err(|e| format!("invalid request JSON: {}", e))?;
    let url = request
        .get("url")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing 'url'".to_string())?;
    let method = request
        .get("method")
        .and_then(|v| v.as_str())
        .unwrap_or("GET")
        .to_uppercase();
    let parsed = http.capability.check(url, &method)?;
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| format!("unsupported method: {}", method))?;

    let mut builder = http
        .client
        .request(method, parsed)
        .timeout(http.capability.timeout);
    if let Some(headers) = request.get("headers").and_then(|v| v.as_object()) {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                builder = builder.header(name.as_str(), value);
            }
        }
    }
    if let Some(body) = request.get("body") {
        let bytes = match body {
            serde_json::Value::String(s) => s.clone().into_bytes(),
            other => serde_json::to_vec(other).map_err(|e| e.to_string())?,
        };
        if bytes.len() > http.capability.max_request_bytes {
            return Err("request body too large".to_string());
        }
        builder = builder.body(bytes);
    }

    let max = http.capability.max_response_bytes;
    let timeout = http.capability.timeout;
    http.handle.block_on(async move {
        let response = builder.send().await.map_err(|e| describe(e, timeout))?;
        let status = response.status().as_u16();
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| describe(e, timeout))?;
            if body.len() + chunk.len() > max {
                return Err(format!("response exceeds {} bytes", max));
            }
            body.extend_from_slice(&chunk);
        }
        let text = String::from_utf8_lossy(&body).into_owned();
        let data = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
        Ok(serde_json::json!({ "status": status, "data": data }))
    })
}

fn describe(err: reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        format!("request timed out after {:?}", timeout)
    } else {
        err.to_string()
    }
}
