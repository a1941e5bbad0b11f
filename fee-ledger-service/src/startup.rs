//! Application startup and lifecycle management.

use axum::{
    extract::{DefaultBodyLimit, MatchedPath},
    middleware,
    routing::{get, post},
    Router,
};
use async_trait::async_trait;
use secrecy::{ExposeSecret, Secret};
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::signature::{
    signature_validation_middleware, SignatureConfig, SignatureStore, MAX_CLOCK_SKEW_SECS,
};
use service_core::middleware::tracing::{request_id_middleware, REQUEST_ID_HEADER};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::{
    FeeLedgerConfig, GatewayConfig, LedgerConfig, SigningConfig, StoreConfig, TenancyConfig,
};
use crate::handlers::{self, collections, fee_assignments, payments, reports, webhook};
use crate::middleware::{tenant_middleware, WEBHOOK_PATH_PREFIX};
use crate::services::collection::FeeCollector;
use crate::services::compensation::CompensationManager;
use crate::services::init_metrics;
use crate::services::intake::PaymentIntake;
use crate::services::reconciliation::ReconciliationEngine;
use crate::services::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
use crate::services::tenant_resolver::TenantResolver;
use crate::services::wallet::WalletService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LedgerStore>,
    pub resolver: TenantResolver,
    pub intake: PaymentIntake,
    pub engine: ReconciliationEngine,
    pub compensation: CompensationManager,
    pub wallet: WalletService,
    pub collector: FeeCollector,
    pub signature_config: SignatureConfig,
    signing_client_id: String,
    signing_secret: Secret<String>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: &GatewayConfig,
        tenancy: &TenancyConfig,
        ledger: &LedgerConfig,
        signing: &SigningConfig,
    ) -> Self {
        let retry = ledger.lock_retry.clone();
        Self {
            resolver: TenantResolver::new(store.clone(), tenancy.root_domains.clone()),
            intake: PaymentIntake::new(gateway.webhook_secret.clone()),
            engine: ReconciliationEngine::new(store.clone(), retry.clone())
                .with_checkout_ttl(ledger.checkout_ttl),
            compensation: CompensationManager::new(store.clone(), retry.clone()),
            wallet: WalletService::new(store.clone(), retry.clone()),
            collector: FeeCollector::new(store.clone(), retry),
            signature_config: SignatureConfig {
                require_signatures: signing.required,
                excluded_paths: vec![WEBHOOK_PATH_PREFIX.to_string()],
            },
            signing_client_id: signing.client_id.clone(),
            signing_secret: signing.secret.clone(),
            store,
        }
    }
}

impl AsRef<SignatureConfig> for AppState {
    fn as_ref(&self) -> &SignatureConfig {
        &self.signature_config
    }
}

#[async_trait]
impl SignatureStore for AppState {
    async fn validate_nonce(&self, client_id: &str, nonce: &str) -> Result<bool, AppError> {
        // A nonce only has to outlive the window in which its timestamp is accepted.
        let expires_utc =
            chrono::Utc::now() + chrono::Duration::seconds(2 * MAX_CLOCK_SKEW_SECS);
        Ok(self
            .store
            .claim_request_nonce(client_id, nonce, expires_utc)
            .await?)
    }

    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError> {
        Ok((client_id == self.signing_client_id)
            .then(|| self.signing_secret.expose_secret().clone()))
    }
}

/// Build the HTTP router. Everything except the probes is tenant-scoped.
///
/// Route layers run last-added first, so a request is signature checked
/// before its tenant is resolved.
pub fn build_router(state: AppState, body_limit_bytes: usize) -> Router {
    let tenant_routes = Router::new()
        .route("/webhooks/razorpay", post(webhook::razorpay_webhook))
        .route("/payments", post(payments::register_payment))
        .route("/payments/:id", get(payments::get_payment))
        .route("/payments/:id/refund", post(payments::refund_payment))
        .route(
            "/payments/:id/move-to-advance",
            post(payments::move_payment_to_advance),
        )
        .route(
            "/payments/:id/compensations",
            get(payments::list_compensations),
        )
        .route(
            "/fee-assignments",
            post(fee_assignments::create_fee_assignment),
        )
        .route(
            "/fee-assignments/:id",
            get(fee_assignments::get_fee_assignment)
                .delete(fee_assignments::delete_fee_assignment),
        )
        .route(
            "/fee-assignments/:id/settle-from-wallet",
            post(fee_assignments::settle_from_wallet),
        )
        .route(
            "/students/:id/fee-assignments",
            get(fee_assignments::list_student_fee_assignments),
        )
        .route(
            "/students/:id/advance-balance",
            get(reports::get_advance_balance),
        )
        .route(
            "/students/:id/collections",
            post(collections::collect_fees),
        )
        .route("/income", get(reports::list_income))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            tenant_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            signature_validation_middleware::<AppState>,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .merge(tenant_routes)
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");
                let path = request
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str)
                    .unwrap_or("unmatched");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    path = %path,
                    tenant_id = tracing::field::Empty,
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    router: Router,
    store: Arc<dyn LedgerStore>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: FeeLedgerConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: FeeLedgerConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: FeeLedgerConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn LedgerStore> = match &config.store {
            StoreConfig::Postgres(database) => {
                let pg = PgLedgerStore::connect(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    AppError::from(e)
                })?;

                if run_migrations {
                    pg.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        AppError::from(e)
                    })?;
                }
                Arc::new(pg)
            }
            StoreConfig::Memory => {
                tracing::warn!("Using in-memory ledger store; data is lost on restart");
                Arc::new(MemoryLedgerStore::new())
            }
        };

        let state = AppState::new(
            store.clone(),
            &config.gateway,
            &config.tenancy,
            &config.ledger,
            &config.signing,
        );
        let router = build_router(state, config.common.body_limit_bytes);

        let http_addr: SocketAddr = format!("{}:{}", config.common.host, config.common.port)
            .parse()
            .map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!(
                    "Invalid listen address {}:{}: {}",
                    config.common.host,
                    config.common.port,
                    e
                ))
            })?;
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(
            http_port = http_port,
            root_domains = ?config.tenancy.root_domains,
            signatures_required = config.signing.required,
            "Fee ledger service listener bound"
        );

        Ok(Self {
            http_port,
            http_listener,
            router,
            store,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn store(&self) -> Arc<dyn LedgerStore> {
        self.store.clone()
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.http_listener, self.router)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "HTTP server error");
                std::io::Error::other(format!("HTTP server error: {}", e))
            })
    }
}
