//! Tool system.
//!
//! Tools are the only way a plan touches the outside world. Built-ins are
//! registered at startup; deployed tools are WASM guests admitted at runtime
//! by the deployer.

pub mod builtin;
pub mod redaction;
pub mod wasm;

mod registry;
mod tool;

pub use registry::{ToolInfo, ToolRegistry, ToolTable};
pub use tool::{
    Tool, ToolContext, ToolError, ToolOrigin, ToolOutput, require_param, require_str,
};
