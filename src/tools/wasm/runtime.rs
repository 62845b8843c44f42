//! Compiles and runs guest modules.
//!
//! One [`WasmRuntime`] owns a wasmtime `Engine` configured for epoch
//! interruption and a background thread that advances the epoch every
//! [`EPOCH_TICK`]. Each invocation gets a fresh `Store` with a memory cap and
//! an epoch deadline, so a guest can never outlive its timeout or grow past
//! its memory budget.
//!
//! Guest ABI:
//! - `memory`: exported linear memory
//! - `alloc(len: i32) -> i32`: reserve `len` bytes for the host to write into
//! - `run(ptr: i32, len: i32) -> i64`: consume JSON input, return `(ptr << 32) | len`
//!   of a JSON output

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use wasmtime::{
    Config, Engine, ExternType, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap,
    ValType,
};

use crate::error::WasmError;
use crate::tools::wasm::capabilities::Capabilities;
use crate::tools::wasm::host::{self, HostHttp, HostState};

/// Granularity of guest deadlines.
pub const EPOCH_TICK: Duration = Duration::from_millis(10);

pub const EXPORT_MEMORY: &str = "memory";
pub const EXPORT_ALLOC: &str = "alloc";
pub const EXPORT_RUN: &str = "run";

/// Maximum size of a guest's JSON output.
const MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// Runtime configuration shared by every guest.
#[derive(Debug, Clone)]
pub struct WasmRuntimeConfig {
    /// Hard cap on a guest's linear memory.
    pub memory_limit_bytes: usize,
}

impl Default for WasmRuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Advances the engine epoch until dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: Engine) -> Result<Self, WasmError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("wasm-epoch".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    std::thread::sleep(EPOCH_TICK);
                    engine.increment_epoch();
                }
            })
            .map_err(|e| WasmError::Instantiate(format!("failed to start epoch ticker: {}", e)))?;
        Ok(Self { stop })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// A module that passed compilation, interface and capability checks.
#[derive(Clone)]
pub struct PreparedModule {
    module: Module,
    capabilities: Capabilities,
}

impl PreparedModule {
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }
}

impl std::fmt::Debug for PreparedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedModule")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// Sandbox runtime for deployed tools.
pub struct WasmRuntime {
    engine: Engine,
    config: WasmRuntimeConfig,
    _ticker: EpochTicker,
}

impl WasmRuntime {
    pub fn new(config: WasmRuntimeConfig) -> Result<Self, WasmError> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        let engine = Engine::new(&wasm_config)
            .map_err(|e| WasmError::Instantiate(format!("failed to create engine: {}", e)))?;
        let ticker = EpochTicker::start(engine.clone())?;
        Ok(Self {
            engine,
            config,
            _ticker: ticker,
        })
    }

    pub fn config(&self) -> &WasmRuntimeConfig {
        &self.config
    }

    /// Parse WAT text or a binary module and validate it.
    pub fn compile(&self, code: &[u8]) -> Result<Module, WasmError> {
        Module::new(&self.engine, code).map_err(|e| WasmError::Compile(format!("{:#}", e)))
    }

    /// Compile and run every static check that does not execute guest code.
    pub fn prepare(
        &self,
        code: &[u8],
        capabilities: Capabilities,
    ) -> Result<PreparedModule, WasmError> {
        let module = self.compile(code)?;
        check_interface(&module)?;
        check_imports(&module, &capabilities)?;
        Ok(PreparedModule {
            module,
            capabilities,
        })
    }

    /// Run the guest once. Blocks the calling thread until the guest returns,
    /// traps or hits `timeout`; callers on the async runtime go through
    /// `spawn_blocking`.
    pub fn invoke(
        &self,
        prepared: &PreparedModule,
        input: &serde_json::Value,
        timeout: Duration,
        http: Option<HostHttp>,
    ) -> Result<serde_json::Value, WasmError> {
        let limits: StoreLimits = StoreLimitsBuilder::new()
            .memory_size(self.config.memory_limit_bytes)
            .instances(1)
            .memories(1)
            .tables(4)
            .build();
        let mut store = Store::new(&self.engine, HostState::new(limits, http));
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(deadline_ticks(timeout));
        store.epoch_deadline_trap();

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        host::link(&mut linker, &prepared.capabilities)?;

        let instance = linker
            .instantiate(&mut store, &prepared.module)
            .map_err(|e| classify(e, &store, timeout, WasmError::Instantiate))?;

        let memory = instance
            .get_memory(&mut store, EXPORT_MEMORY)
            .ok_or_else(|| WasmError::Interface("missing memory export".to_string()))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, EXPORT_ALLOC)
            .map_err(|e| WasmError::Interface(e.to_string()))?;
        let run = instance
            .get_typed_func::<(i32, i32), i64>(&mut store, EXPORT_RUN)
            .map_err(|e| WasmError::Interface(e.to_string()))?;

        let bytes = serde_json::to_vec(input).map_err(|e| WasmError::Output(e.to_string()))?;
        let len = i32::try_from(bytes.len())
            .map_err(|_| WasmError::Guest("input too large for guest memory".to_string()))?;
        let ptr = alloc
            .call(&mut store, len)
            .map_err(|e| classify(e, &store, timeout, WasmError::Trap))?;
        memory
            .write(&mut store, ptr as u32 as usize, &bytes)
            .map_err(|e| WasmError::Guest(format!("alloc returned an invalid region: {}", e)))?;

        let packed = run
            .call(&mut store, (ptr, len))
            .map_err(|e| classify(e, &store, timeout, WasmError::Trap))?;

        let (out_ptr, out_len) = unpack(packed);
        if out_len > MAX_OUTPUT_BYTES {
            return Err(WasmError::Output(format!(
                "output of {} bytes exceeds {} bytes",
                out_len, MAX_OUTPUT_BYTES
            )));
        }
        let data = memory.data(&store);
        let slice = data
            .get(out_ptr..out_ptr.saturating_add(out_len))
            .ok_or_else(|| WasmError::Output("output region is out of bounds".to_string()))?;
        serde_json::from_slice(slice).map_err(|e| WasmError::Output(format!("not JSON: {}", e)))
    }
}

fn deadline_ticks(timeout: Duration) -> u64 {
    let tick = EPOCH_TICK.as_millis().max(1);
    let ticks = timeout.as_millis().div_ceil(tick);
    u64::try_from(ticks).unwrap_or(u64::MAX).max(1)
}

/// Split `(ptr << 32) | len`.
pub(crate) fn unpack(packed: i64) -> (usize, usize) {
    let raw = packed as u64;
    ((raw >> 32) as usize, (raw & 0xffff_ffff) as usize)
}

/// Turn a wasmtime error into the most specific sandbox error.
fn classify(
    err: wasmtime::Error,
    store: &Store<HostState>,
    timeout: Duration,
    fallback: fn(String) -> WasmError,
) -> WasmError {
    if let Some(message) = store.data().failure() {
        return WasmError::Guest(message.to_string());
    }
    if let Some(Trap::Interrupt) = err.downcast_ref::<Trap>() {
        return WasmError::Timeout(timeout);
    }
    fallback(format!("{:#}", err))
}

/// Require the `memory`, `alloc` and `run` exports with the ABI signatures.
pub fn check_interface(module: &Module) -> Result<(), WasmError> {
    let mut has_memory = false;
    let mut has_alloc = false;
    let mut has_run = false;

    for export in module.exports() {
        match (export.name(), export.ty()) {
            (EXPORT_MEMORY, ExternType::Memory(_)) => has_memory = true,
            (EXPORT_ALLOC, ExternType::Func(f)) => {
                let params: Vec<ValType> = f.params().collect();
                let results: Vec<ValType> = f.results().collect();
                has_alloc = matches!(params.as_slice(), [ValType::I32])
                    && matches!(results.as_slice(), [ValType::I32]);
                if !has_alloc {
                    return Err(WasmError::Interface(
                        "`alloc` must have type (i32) -> i32".to_string(),
                    ));
                }
            }
            (EXPORT_RUN, ExternType::Func(f)) => {
                let params: Vec<ValType> = f.params().collect();
                let results: Vec<ValType> = f.results().collect();
                has_run = matches!(params.as_slice(), [ValType::I32, ValType::I32])
                    && matches!(results.as_slice(), [ValType::I64]);
                if !has_run {
                    return Err(WasmError::Interface(
                        "`run` must have type (i32, i32) -> i64".to_string(),
                    ));
                }
            }
            (EXPORT_MEMORY | EXPORT_ALLOC | EXPORT_RUN, _) => {
                return Err(WasmError::Interface(format!(
                    "`{}` is exported with the wrong kind",
                    export.name()
                )));
            }
            _ => {}
        }
    }

    let missing: Vec<&str> = [
        (has_memory, EXPORT_MEMORY),
        (has_alloc, EXPORT_ALLOC),
        (has_run, EXPORT_RUN),
    ]
    .into_iter()
    .filter(|(present, _)| !present)
    .map(|(_, name)| name)
    .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(WasmError::Interface(format!(
            "missing export(s): {}",
            missing.join(", ")
        )))
    }
}

/// Reject every import the capabilities do not grant.
pub fn check_imports(module: &Module, capabilities: &Capabilities) -> Result<(), WasmError> {
    for import in module.imports() {
        let is_func = matches!(import.ty(), ExternType::Func(_));
        if !is_func || !capabilities.grants(import.module(), import.name()) {
            return Err(WasmError::Capability(format!(
                "{}.{}",
                import.module(),
                import.name()
            )));
        }
    }
    Ok(())
}
