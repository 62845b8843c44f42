//! WASM sandbox for deployed tools.
//!
//! Guests get linear memory, the `host.log`/`host.fail` imports and, when
//! granted, `host.http_fetch` to allowlisted endpoints. No WASI is linked, so
//! there is no filesystem, environment, clock or process access.

mod capabilities;
mod host;
mod runtime;
mod tool;

pub use capabilities::{
    Capabilities, CapabilityKind, EndpointPattern, HOST_MODULE, HttpCapability,
};
pub use host::HostHttp;
pub use runtime::{
    EPOCH_TICK, PreparedModule, WasmRuntime, WasmRuntimeConfig, check_imports, check_interface,
};
pub use tool::WasmTool;
