//! Command-line interface.
//!
//! - `serve` (default): run the HTTP gateway
//! - `run <plan.json>`: execute a plan file against the built-in tools
//! - `sign`: produce webhook signature headers for a body
//! - `check-tool <file>`: run the deploy pipeline on a tool without registering it

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ColorChoice, Parser, Subcommand};

use crate::audit::{AdminLock, AuditLog};
use crate::config::{Config, LlmConfig};
use crate::deploy::{DeployRequest, DeploySettings, SandboxedDeployer};
use crate::plan::Plan;
use crate::server::AppState;
use crate::tools::ToolRegistry;
use crate::tools::builtin::register_builtins;
use crate::tools::wasm::{WasmRuntime, WasmRuntimeConfig};
use crate::webhook::{SIGNATURE_HEADER, TIMESTAMP_HEADER, WebhookVerifier};

#[derive(Parser, Debug)]
#[command(name = "ironplan")]
#[command(about = "Plans tool calls from instructions and runs them in a sandbox")]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP gateway (default if no subcommand given)
    Serve,

    /// Execute a plan file and print its run record
    Run {
        /// JSON file with `{ "planId"?, "steps": [...] }`
        plan: PathBuf,

        /// Directory for the run log
        #[arg(long, env = "DATA_DIR", default_value = "./data")]
        data_dir: PathBuf,
    },

    /// Print `x-timestamp` and `x-signature` headers for a webhook body
    Sign {
        #[arg(long, env = "RTA_WEBHOOK_SECRET", hide_env_values = true)]
        secret: String,

        /// Literal request body
        #[arg(long, conflicts_with = "body_file")]
        body: Option<String>,

        /// Read the request body from a file
        #[arg(long)]
        body_file: Option<PathBuf>,
    },

    /// Validate and dry-run a tool module without deploying it
    CheckTool {
        /// WebAssembly text or binary module
        file: PathBuf,

        /// Tool name to validate (defaults to the file stem)
        #[arg(long)]
        name: Option<String>,

        /// Requested capability, e.g. `http`
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
}

/// Execute a plan file with the built-in tools and print the run record.
pub async fn run_plan_command(plan_path: PathBuf, data_dir: PathBuf) -> anyhow::Result<bool> {
    let raw = tokio::fs::read_to_string(&plan_path)
        .await
        .with_context(|| format!("failed to read {}", plan_path.display()))?;
    let plan: Plan = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a valid plan", plan_path.display()))?;

    let mut config = Config::local(String::new(), data_dir);
    config.llm = LlmConfig::resolve()?;
    let state = AppState::from_config(config)?;

    let record = state.runner.run(&plan.with_default_id()).await;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(record.ok)
}

/// Print the signature headers for `body` signed now.
pub fn sign_command(
    secret: &str,
    body: Option<String>,
    body_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let body = match (body, body_file) {
        (Some(body), _) => body.into_bytes(),
        (None, Some(path)) => std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => Vec::new(),
    };
    if secret.is_empty() {
        anyhow::bail!("webhook secret must not be empty");
    }
    let verifier = WebhookVerifier::new(secret.as_bytes().to_vec(), std::time::Duration::ZERO);
    let (timestamp, signature) = verifier.sign_now(&body);
    println!("{}: {}", TIMESTAMP_HEADER, timestamp);
    println!("{}: {}", SIGNATURE_HEADER, signature);
    Ok(())
}

/// Run the deploy pipeline against a fresh registry and report the result.
pub async fn check_tool_command(
    file: PathBuf,
    name: Option<String>,
    capabilities: Vec<String>,
) -> anyhow::Result<bool> {
    let code = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let name = match name {
        Some(name) => name,
        None => file
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .context("cannot derive a tool name from the file; pass --name")?,
    };

    let sandbox = crate::config::SandboxConfig::default();
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry, None);
    let runtime = Arc::new(WasmRuntime::new(WasmRuntimeConfig {
        memory_limit_bytes: sandbox.memory_limit_bytes,
    })?);
    let deployer = SandboxedDeployer::new(
        registry,
        runtime,
        Arc::new(AuditLog::disabled()),
        AdminLock::new(),
        DeploySettings::from(&sandbox),
    );

    let mut request = DeployRequest::new(name, code);
    request.capabilities = capabilities;
    match deployer.check(&request).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(true)
        }
        Err(rejection) => {
            eprintln!(
                "rejected after {}: {} ({})",
                rejection.stage,
                rejection.error,
                rejection.error.code()
            );
            Ok(false)
        }
    }
}
