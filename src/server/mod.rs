//! HTTP gateway.
//!
//! Public routes are `/healthz`, `/readyz` and the HMAC-signed
//! `/rta/webhook`. Everything else requires the admin bearer token, and the
//! self-rewrite routes additionally check the rewrite key carried in the body.

pub mod auth;
mod handlers;
pub mod rate_limit;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method, header},
    middleware,
    routing::{delete, get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

use crate::audit::{AdminLock, AuditLog};
use crate::config::{Config, Features};
use crate::deploy::{DeploySettings, SandboxedDeployer};
use crate::executor::{FsRunStore, PlanRunner, RetryPolicy, RunStore, StepExecutor};
use crate::llm::{LlmProvider, create_llm_provider};
use crate::planner::{LlmPlanner, Planner};
use crate::rewrite::{
    ProcessRestarter, Restarter, SelfRewriteManager, WasmSourceValidator, load_live_source,
};
use crate::server::auth::{AuthState, REQUEST_ID_HEADER, auth_middleware, request_id_middleware};
use crate::server::rate_limit::{RateLimiter, rate_limit_middleware};
use crate::tools::builtin::register_builtins;
use crate::tools::wasm::{WasmRuntime, WasmRuntimeConfig};
use crate::tools::{Tool, ToolRegistry};
use crate::webhook::WebhookVerifier;

/// Everything a handler can reach.
pub struct AppState {
    pub env: String,
    pub admin_token: String,
    pub body_limit_bytes: usize,
    pub rate_limiter: Arc<RateLimiter>,
    pub features: Features,
    pub started_at: Instant,
    pub registry: Arc<ToolRegistry>,
    pub runner: Arc<PlanRunner>,
    pub planner: Option<Arc<dyn Planner>>,
    pub deployer: Arc<SandboxedDeployer>,
    pub rewrite: Arc<SelfRewriteManager>,
    pub webhook: WebhookVerifier,
}

impl AppState {
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        AppStateBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> AppStateBuilder {
        AppStateBuilder::new(config)
    }
}

/// Wires the components from a [`Config`], with optional overrides for
/// embedding and tests.
pub struct AppStateBuilder {
    config: Config,
    llm: Option<Arc<dyn LlmProvider>>,
    planner: Option<Arc<dyn Planner>>,
    restarter: Option<Arc<dyn Restarter>>,
    store: Option<Arc<dyn RunStore>>,
    tools: Vec<Arc<dyn Tool>>,
}

impl AppStateBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            llm: None,
            planner: None,
            restarter: None,
            store: None,
            tools: Vec::new(),
        }
    }

    /// Use this provider instead of the configured one.
    pub fn llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn restarter(mut self, restarter: Arc<dyn Restarter>) -> Self {
        self.restarter = Some(restarter);
        self
    }

    pub fn run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Extra built-in tool, registered after the standard ones.
    pub fn builtin(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn build(self) -> anyhow::Result<AppState> {
        let config = self.config;

        let llm = match self.llm {
            Some(llm) => Some(llm),
            None => create_llm_provider(&config.llm).context("failed to configure LLM provider")?,
        };

        let registry = Arc::new(ToolRegistry::new());
        register_builtins(&registry, llm.clone());
        for tool in self.tools {
            registry.register_builtin(tool);
        }

        let executor = StepExecutor::new(Arc::clone(&registry))
            .with_timeout(config.executor.step_timeout)
            .with_retry(RetryPolicy {
                max_retries: config.executor.max_retries,
                backoff_base: config.executor.backoff_base,
            });
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(FsRunStore::new(&config.executor.runs_path)));
        let runner = Arc::new(PlanRunner::new(executor, store));

        let runtime = Arc::new(
            WasmRuntime::new(WasmRuntimeConfig {
                memory_limit_bytes: config.sandbox.memory_limit_bytes,
            })
            .context("failed to start WASM runtime")?,
        );
        let audit = Arc::new(AuditLog::new(&config.sandbox.audit_path));
        let lock = AdminLock::new();

        if config.rewrite.enabled() {
            // A bad live source must not keep the gateway down; rollback stays reachable.
            match load_live_source(&config.rewrite, &runtime, config.sandbox.tool_timeout) {
                Ok(tool) => {
                    registry
                        .register(Arc::new(tool))
                        .context("live source name collides with a built-in")?;
                }
                Err(e) => tracing::warn!(error = %e, "Live source not loaded"),
            }
        }

        let deployer = Arc::new(SandboxedDeployer::new(
            Arc::clone(&registry),
            Arc::clone(&runtime),
            Arc::clone(&audit),
            lock.clone(),
            DeploySettings::from(&config.sandbox),
        ));

        let restarter = self
            .restarter
            .unwrap_or_else(|| Arc::new(ProcessRestarter));
        let rewrite = Arc::new(SelfRewriteManager::new(
            config.rewrite.clone(),
            Arc::new(WasmSourceValidator::new(Arc::clone(&runtime))),
            restarter,
            audit,
            lock,
        ));

        let planner = self.planner.or_else(|| {
            llm.map(|llm| Arc::new(LlmPlanner::new(llm, Arc::clone(&registry))) as Arc<dyn Planner>)
        });

        if config.webhook.generated {
            tracing::warn!("RTA_WEBHOOK_SECRET not set; generated a random secret for this process");
        }

        Ok(AppState {
            env: config.gateway.env.clone(),
            admin_token: config.gateway.admin_token().to_string(),
            body_limit_bytes: config.gateway.body_limit_bytes,
            rate_limiter: Arc::new(RateLimiter::new(config.gateway.rate_limit_per_minute)),
            features: config.features(),
            started_at: Instant::now(),
            registry,
            runner,
            planner,
            deployer,
            rewrite,
            webhook: WebhookVerifier::from_config(&config.webhook),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let auth = AuthState {
        token: state.admin_token.clone(),
    };

    let admin = Router::new()
        .route("/orchestrate", post(handlers::orchestrate))
        .route("/execute", post(handlers::execute))
        .route("/runs/{plan_id}", get(handlers::get_run))
        .route("/deploy", post(handlers::deploy))
        .route("/deploy/check", post(handlers::check_deploy))
        .route("/tools", get(handlers::list_tools))
        .route("/tools/{name}", delete(handlers::undeploy))
        .route("/self/rewrite", post(handlers::rewrite))
        .route("/self/rollback", post(handlers::rollback))
        .route_layer(middleware::from_fn_with_state(auth, auth_middleware));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/rta/webhook", post(handlers::webhook))
        .merge(admin)
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(state.body_limit_bytes))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.rate_limiter),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(cors_layer())
        .with_state(state)
}

/// Open CORS: any origin, the verbs the API uses, and the headers clients send.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

/// Bind `addr` and serve until ctrl-c or SIGTERM.
pub async fn serve(state: Arc<AppState>, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        env = %state.env,
        tools = state.registry.count(),
        "Gateway listening"
    );

    // Connect info gives the rate limiter a per-peer key.
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn app(dir: &std::path::Path) -> Router {
        let state = AppState::from_config(Config::local("admin-token", dir)).unwrap();
        router(Arc::new(state))
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_is_public_with_security_headers() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["referrer-policy"], "no-referrer");
        assert!(headers.contains_key("x-request-id"));

        let body = json_body(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["version"], crate::VERSION);
        assert_eq!(body["features"]["llm"], false);
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(
                Request::builder()
                    .uri("/readyz")
                    .header("x-request-id", "req-42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "req-42");
    }

    #[tokio::test]
    async fn test_admin_routes_need_token() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(Request::builder().uri("/tools").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "Unauthorized");
    }

    #[tokio::test]
    async fn test_rate_limit_answers_429_and_spares_healthz() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::local("admin-token", dir.path());
        config.gateway.rate_limit_per_minute = 3;
        let app = router(Arc::new(AppState::from_config(config).unwrap()));
        let tools = || {
            Request::builder()
                .uri("/tools")
                .header("authorization", "Bearer admin-token")
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..3 {
            let response = app.clone().oneshot(tools()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(tools()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        assert!(response.headers().contains_key("x-request-id"));
        let body = json_body(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "RateLimited");

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_cors_preflight_and_headers() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/execute")
                    .header("origin", "https://console.example.com")
                    .header("access-control-request-method", "POST")
                    .header("access-control-request-headers", "authorization")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        let methods = headers["access-control-allow-methods"].to_str().unwrap();
        assert!(methods.contains("DELETE"), "{}", methods);

        let response = app(dir.path())
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .header("origin", "https://console.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_unknown_route_is_enveloped() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "NotFound");
    }
}
