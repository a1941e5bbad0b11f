pub mod collection;
pub mod compensation;
pub mod intake;
pub mod metrics;
pub mod reconciliation;
pub mod retry;
pub mod store;
pub mod tenant_resolver;
pub mod wallet;

pub use collection::FeeCollector;
pub use compensation::CompensationManager;
pub use intake::PaymentIntake;
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::ReconciliationEngine;
pub use retry::LockRetryPolicy;
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use tenant_resolver::TenantResolver;
pub use wallet::WalletService;
