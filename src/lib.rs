//! ironplan: turns natural-language instructions into tool plans and runs them.
//!
//! The crate is organised around the execution engine:
//! - [`plan`]: plan, step, output bag and run record types plus `$ref` resolution
//! - [`tools`]: the [`Tool`](tools::Tool) trait, the copy-on-write [`ToolRegistry`](tools::ToolRegistry)
//!   and the WASM sandbox used for deployed tools
//! - [`executor`]: per-step timeout/retry and the sequential, fail-fast plan runner
//! - [`deploy`]: validation, dry run and atomic admission of uploaded tool code
//! - [`rewrite`]: supervised replacement of the service's live source with rollback
//! - [`webhook`]: HMAC-SHA256 request verification with replay protection
//! - [`server`]: the axum gateway wiring it all together

pub mod audit;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod executor;
pub mod llm;
pub mod plan;
pub mod planner;
pub mod rewrite;
pub mod server;
pub mod testing;
pub mod tools;
pub mod webhook;

/// Crate version reported by the health endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
