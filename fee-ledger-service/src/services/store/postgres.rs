//! PostgreSQL ledger store.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{LedgerStore, LedgerTx};
use crate::error::LedgerError;
use crate::models::{
    parse_features, AdvanceBalance, CompensationEntry, FeeAssignment, IncomeEntry, IncomeRange,
    PaymentRecord, Tenant, WalletTransaction,
};
use crate::services::metrics::DB_QUERY_DURATION;

const TENANT_COLUMNS: &str =
    "tenant_id, subdomain, webhook_secret, features, commission_percent, active";

const FEE_ASSIGNMENT_COLUMNS: &str = "fee_assignment_id, tenant_id, student_id, fee_head_id, \
     amount, discount, paid_amount, status, due_date, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, tenant_id, fee_assignment_id, amount, \
     advance_amount, method, platform_fee, school_share, status, gateway_transaction_id, \
     bank_ref_no, gateway_response_raw, transfer_id, split_status, redirected_to_advance, \
     collected_by, created_utc, updated_utc";

const INCOME_COLUMNS: &str =
    "income_id, tenant_id, source, amount, entry_utc, reference, payment_id, remarks";

const WALLET_TXN_COLUMNS: &str = "wallet_txn_id, tenant_id, student_id, direction, amount, \
     source_ref, actor, balance_after, created_utc";

const COMPENSATION_COLUMNS: &str =
    "compensation_id, tenant_id, payment_id, kind, amount, reason, actor, created_utc";

/// Map a sqlx error onto the ledger taxonomy.
///
/// Deadlocks, serialization failures and lock timeouts become `Contention`
/// so the caller can retry the whole transaction.
fn storage_error(operation: &str, err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(ref db_err) = err {
        if matches!(db_err.code().as_deref(), Some("40P01" | "40001" | "55P03")) {
            return LedgerError::Contention(format!("{}: {}", operation, db_err));
        }
        if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
            return LedgerError::Conflict(format!("{}: {}", operation, db_err));
        }
        if db_err.is_check_violation() {
            return LedgerError::InvariantViolation(format!("{}: {}", operation, db_err));
        }
    }
    LedgerError::TransientStorage(format!("Failed to {}: {}", operation, err))
}

#[derive(FromRow)]
struct TenantRow {
    tenant_id: Uuid,
    subdomain: String,
    webhook_secret: Option<String>,
    features: Vec<String>,
    commission_percent: Decimal,
    active: bool,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = LedgerError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        Ok(Tenant {
            tenant_id: row.tenant_id,
            subdomain: row.subdomain,
            webhook_secret: row.webhook_secret.map(Secret::new),
            features: parse_features(&row.features)?,
            commission_percent: row.commission_percent,
            active: row.active,
        })
    }
}

#[derive(FromRow)]
struct FeeAssignmentRow {
    fee_assignment_id: Uuid,
    tenant_id: Uuid,
    student_id: Uuid,
    fee_head_id: Uuid,
    amount: Decimal,
    discount: Decimal,
    paid_amount: Decimal,
    status: String,
    due_date: Option<NaiveDate>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<FeeAssignmentRow> for FeeAssignment {
    type Error = LedgerError;

    fn try_from(row: FeeAssignmentRow) -> Result<Self, Self::Error> {
        Ok(FeeAssignment {
            fee_assignment_id: row.fee_assignment_id,
            tenant_id: row.tenant_id,
            student_id: row.student_id,
            fee_head_id: row.fee_head_id,
            amount: row.amount,
            discount: row.discount,
            paid_amount: row.paid_amount,
            status: row.status.parse()?,
            due_date: row.due_date,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct PaymentRow {
    payment_id: Uuid,
    tenant_id: Uuid,
    fee_assignment_id: Uuid,
    amount: Decimal,
    advance_amount: Decimal,
    method: String,
    platform_fee: Decimal,
    school_share: Decimal,
    status: String,
    gateway_transaction_id: String,
    bank_ref_no: Option<String>,
    gateway_response_raw: Option<serde_json::Value>,
    transfer_id: Option<String>,
    split_status: String,
    redirected_to_advance: bool,
    collected_by: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for PaymentRecord {
    type Error = LedgerError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(PaymentRecord {
            payment_id: row.payment_id,
            tenant_id: row.tenant_id,
            fee_assignment_id: row.fee_assignment_id,
            amount: row.amount,
            advance_amount: row.advance_amount,
            method: row.method.parse()?,
            platform_fee: row.platform_fee,
            school_share: row.school_share,
            status: row.status.parse()?,
            gateway_transaction_id: row.gateway_transaction_id,
            bank_ref_no: row.bank_ref_no,
            gateway_response_raw: row.gateway_response_raw,
            transfer_id: row.transfer_id,
            split_status: row.split_status.parse()?,
            redirected_to_advance: row.redirected_to_advance,
            collected_by: row.collected_by,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        })
    }
}

#[derive(FromRow)]
struct IncomeRow {
    income_id: Uuid,
    tenant_id: Uuid,
    source: String,
    amount: Decimal,
    entry_utc: DateTime<Utc>,
    reference: String,
    payment_id: Uuid,
    remarks: Option<String>,
}

impl TryFrom<IncomeRow> for IncomeEntry {
    type Error = LedgerError;

    fn try_from(row: IncomeRow) -> Result<Self, Self::Error> {
        Ok(IncomeEntry {
            income_id: row.income_id,
            tenant_id: row.tenant_id,
            source: row.source.parse()?,
            amount: row.amount,
            entry_utc: row.entry_utc,
            reference: row.reference,
            payment_id: row.payment_id,
            remarks: row.remarks,
        })
    }
}

#[derive(FromRow)]
struct AdvanceBalanceRow {
    tenant_id: Uuid,
    student_id: Uuid,
    balance: Decimal,
    updated_utc: DateTime<Utc>,
}

impl From<AdvanceBalanceRow> for AdvanceBalance {
    fn from(row: AdvanceBalanceRow) -> Self {
        AdvanceBalance {
            tenant_id: row.tenant_id,
            student_id: row.student_id,
            balance: row.balance,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(FromRow)]
struct WalletTransactionRow {
    wallet_txn_id: Uuid,
    tenant_id: Uuid,
    student_id: Uuid,
    direction: String,
    amount: Decimal,
    source_ref: Uuid,
    actor: String,
    balance_after: Decimal,
    created_utc: DateTime<Utc>,
}

impl TryFrom<WalletTransactionRow> for WalletTransaction {
    type Error = LedgerError;

    fn try_from(row: WalletTransactionRow) -> Result<Self, Self::Error> {
        Ok(WalletTransaction {
            wallet_txn_id: row.wallet_txn_id,
            tenant_id: row.tenant_id,
            student_id: row.student_id,
            direction: row.direction.parse()?,
            amount: row.amount,
            source_ref: row.source_ref,
            actor: row.actor,
            balance_after: row.balance_after,
            created_utc: row.created_utc,
        })
    }
}

#[derive(FromRow)]
struct CompensationRow {
    compensation_id: Uuid,
    tenant_id: Uuid,
    payment_id: Uuid,
    kind: String,
    amount: Decimal,
    reason: String,
    actor: String,
    created_utc: DateTime<Utc>,
}

impl TryFrom<CompensationRow> for CompensationEntry {
    type Error = LedgerError;

    fn try_from(row: CompensationRow) -> Result<Self, Self::Error> {
        Ok(CompensationEntry {
            compensation_id: row.compensation_id,
            tenant_id: row.tenant_id,
            payment_id: row.payment_id,
            kind: row.kind.parse()?,
            amount: row.amount,
            reason: row.reason,
            actor: row.actor,
            created_utc: row.created_utc,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, LedgerError>
where
    T: TryFrom<R, Error = LedgerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Ledger store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "fee-ledger-service"))]
    pub async fn connect(
        database_url: &Secret<String>,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, LedgerError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url.expose_secret())
            .await
            .map_err(|e| storage_error("connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), LedgerError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::TransientStorage(format!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, LedgerError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| storage_error("begin transaction", e))?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    #[instrument(skip(self))]
    async fn find_tenant_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<Tenant>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_tenant_by_subdomain"])
            .start_timer();

        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {} FROM tenants WHERE lower(subdomain) = lower($1)",
            TENANT_COLUMNS
        ))
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("find tenant", e))?;

        timer.observe_duration();
        row.map(Tenant::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn get_tenant(&self, tenant_id: Uuid) -> Result<Option<Tenant>, LedgerError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "SELECT {} FROM tenants WHERE tenant_id = $1",
            TENANT_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("get tenant", e))?;

        row.map(Tenant::try_from).transpose()
    }

    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.tenant_id))]
    async fn insert_tenant(&self, tenant: &Tenant) -> Result<(), LedgerError> {
        let features: Vec<String> = tenant
            .features
            .iter()
            .map(|f| f.as_str().to_string())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO tenants (tenant_id, subdomain, webhook_secret, features,
                commission_percent, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(tenant.tenant_id)
        .bind(&tenant.subdomain)
        .bind(tenant.webhook_secret.as_ref().map(|s| s.expose_secret().as_str()))
        .bind(&features)
        .bind(tenant.commission_percent)
        .bind(tenant.active)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("insert tenant", e))?;

        Ok(())
    }

    #[instrument(skip(self, assignment), fields(tenant_id = %assignment.tenant_id, fee_assignment_id = %assignment.fee_assignment_id))]
    async fn create_fee_assignment(&self, assignment: &FeeAssignment) -> Result<(), LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_fee_assignment"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO fee_assignments (fee_assignment_id, tenant_id, student_id, fee_head_id,
                amount, discount, paid_amount, status, due_date, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(assignment.fee_assignment_id)
        .bind(assignment.tenant_id)
        .bind(assignment.student_id)
        .bind(assignment.fee_head_id)
        .bind(assignment.amount)
        .bind(assignment.discount)
        .bind(assignment.paid_amount)
        .bind(assignment.status.as_str())
        .bind(assignment.due_date)
        .bind(assignment.created_utc)
        .bind(assignment.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("create fee assignment", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_fee_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Option<FeeAssignment>, LedgerError> {
        let row = sqlx::query_as::<_, FeeAssignmentRow>(&format!(
            "SELECT {} FROM fee_assignments WHERE tenant_id = $1 AND fee_assignment_id = $2",
            FEE_ASSIGNMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(fee_assignment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("get fee assignment", e))?;

        row.map(FeeAssignment::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list_fee_assignments_for_student(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<FeeAssignment>, LedgerError> {
        let rows = sqlx::query_as::<_, FeeAssignmentRow>(&format!(
            "SELECT {} FROM fee_assignments WHERE tenant_id = $1 AND student_id = $2 \
             ORDER BY created_utc",
            FEE_ASSIGNMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list fee assignments", e))?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn delete_fee_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<bool, LedgerError> {
        // The payment_records foreign key is ON DELETE RESTRICT; a referencing
        // payment surfaces here as a foreign key violation.
        let result = sqlx::query(
            "DELETE FROM fee_assignments WHERE tenant_id = $1 AND fee_assignment_id = $2",
        )
        .bind(tenant_id)
        .bind(fee_assignment_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match storage_error("delete fee assignment", e) {
            LedgerError::Conflict(_) => LedgerError::Conflict(format!(
                "fee assignment {} has payments and cannot be deleted",
                fee_assignment_id
            )),
            other => other,
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn get_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payment_records WHERE tenant_id = $1 AND payment_id = $2",
            PAYMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("get payment", e))?;

        row.map(PaymentRecord::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list_payments_for_assignment(
        &self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Vec<PaymentRecord>, LedgerError> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payment_records WHERE tenant_id = $1 AND fee_assignment_id = $2 \
             ORDER BY created_utc",
            PAYMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(fee_assignment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list payments", e))?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_income(
        &self,
        tenant_id: Uuid,
        range: IncomeRange,
    ) -> Result<Vec<IncomeEntry>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_income"])
            .start_timer();

        let rows = sqlx::query_as::<_, IncomeRow>(&format!(
            "SELECT {} FROM income_entries WHERE tenant_id = $1 \
             AND ($2::timestamptz IS NULL OR entry_utc >= $2) \
             AND ($3::timestamptz IS NULL OR entry_utc < $3) \
             ORDER BY entry_utc",
            INCOME_COLUMNS
        ))
        .bind(tenant_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list income", e))?;

        timer.observe_duration();
        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_income_for_payment(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<IncomeEntry>, LedgerError> {
        let rows = sqlx::query_as::<_, IncomeRow>(&format!(
            "SELECT {} FROM income_entries WHERE tenant_id = $1 AND payment_id = $2 \
             ORDER BY entry_utc",
            INCOME_COLUMNS
        ))
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list income for payment", e))?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn get_advance_balance(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Option<AdvanceBalance>, LedgerError> {
        let row = sqlx::query_as::<_, AdvanceBalanceRow>(
            "SELECT tenant_id, student_id, balance, updated_utc FROM advance_balances \
             WHERE tenant_id = $1 AND student_id = $2",
        )
        .bind(tenant_id)
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error("get advance balance", e))?;

        Ok(row.map(AdvanceBalance::from))
    }

    #[instrument(skip(self))]
    async fn list_wallet_transactions(
        &self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<WalletTransaction>, LedgerError> {
        let rows = sqlx::query_as::<_, WalletTransactionRow>(&format!(
            "SELECT {} FROM wallet_transactions WHERE tenant_id = $1 AND student_id = $2 \
             ORDER BY created_utc",
            WALLET_TXN_COLUMNS
        ))
        .bind(tenant_id)
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list wallet transactions", e))?;

        convert_all(rows)
    }

    #[instrument(skip(self))]
    async fn list_compensations(
        &self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Vec<CompensationEntry>, LedgerError> {
        let rows = sqlx::query_as::<_, CompensationRow>(&format!(
            "SELECT {} FROM compensation_log WHERE tenant_id = $1 AND payment_id = $2 \
             ORDER BY created_utc",
            COMPENSATION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error("list compensations", e))?;

        convert_all(rows)
    }

    #[instrument(skip(self, nonce))]
    async fn claim_request_nonce(
        &self,
        client_id: &str,
        nonce: &str,
        expires_utc: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        // An expired claim on the same nonce is taken over in place.
        let result = sqlx::query(
            r#"
            INSERT INTO request_nonces (client_id, nonce, expires_utc)
            VALUES ($1, $2, $3)
            ON CONFLICT (client_id, nonce) DO UPDATE SET expires_utc = EXCLUDED.expires_utc
            WHERE request_nonces.expires_utc < NOW()
            "#,
        )
        .bind(client_id)
        .bind(nonce)
        .bind(expires_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("claim request nonce", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("health check", e))?;
        Ok(())
    }
}

/// An open PostgreSQL transaction. sqlx rolls back on drop.
struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

impl PgLedgerTx {
    async fn lock_payment_where(
        &mut self,
        operation: &str,
        predicate: &str,
        tenant_id: Uuid,
        value: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payment_records WHERE tenant_id = $1 AND ({}) \
             ORDER BY created_utc LIMIT 1 FOR UPDATE",
            PAYMENT_COLUMNS, predicate
        ))
        .bind(tenant_id)
        .bind(value)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| storage_error(operation, e))?;

        timer.observe_duration();
        row.map(PaymentRecord::try_from).transpose()
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_payment_by_gateway_id(
        &mut self,
        tenant_id: Uuid,
        gateway_transaction_id: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        self.lock_payment_where(
            "lock_payment_by_gateway_id",
            "gateway_transaction_id = $2",
            tenant_id,
            gateway_transaction_id,
        )
        .await
    }

    async fn lock_payment(
        &mut self,
        tenant_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {} FROM payment_records WHERE tenant_id = $1 AND payment_id = $2 FOR UPDATE",
            PAYMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(payment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| storage_error("lock payment", e))?;

        row.map(PaymentRecord::try_from).transpose()
    }

    async fn lock_payment_by_reference(
        &mut self,
        tenant_id: Uuid,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        self.lock_payment_where(
            "lock_payment_by_reference",
            "bank_ref_no = $2 OR gateway_transaction_id = $2",
            tenant_id,
            reference,
        )
        .await
    }

    async fn lock_fee_assignment(
        &mut self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
    ) -> Result<Option<FeeAssignment>, LedgerError> {
        let row = sqlx::query_as::<_, FeeAssignmentRow>(&format!(
            "SELECT {} FROM fee_assignments WHERE tenant_id = $1 AND fee_assignment_id = $2 \
             FOR UPDATE",
            FEE_ASSIGNMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(fee_assignment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| storage_error("lock fee assignment", e))?;

        row.map(FeeAssignment::try_from).transpose()
    }

    async fn lock_fee_assignments_for_student(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<Vec<FeeAssignment>, LedgerError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_fee_assignments_for_student"])
            .start_timer();

        let rows = sqlx::query_as::<_, FeeAssignmentRow>(&format!(
            "SELECT {} FROM fee_assignments WHERE tenant_id = $1 AND student_id = $2 \
             ORDER BY due_date NULLS LAST, created_utc FOR UPDATE",
            FEE_ASSIGNMENT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(student_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| storage_error("lock student fee assignments", e))?;

        timer.observe_duration();
        convert_all(rows)
    }

    async fn sum_pending_payments(
        &mut self,
        tenant_id: Uuid,
        fee_assignment_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Decimal, LedgerError> {
        let (total,): (Decimal,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0) FROM payment_records \
             WHERE tenant_id = $1 AND fee_assignment_id = $2 AND status = 'PENDING' \
             AND created_utc >= $3",
        )
        .bind(tenant_id)
        .bind(fee_assignment_id)
        .bind(since)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| storage_error("sum pending payments", e))?;

        Ok(total)
    }

    async fn lock_advance_balance(
        &mut self,
        tenant_id: Uuid,
        student_id: Uuid,
    ) -> Result<AdvanceBalance, LedgerError> {
        sqlx::query(
            "INSERT INTO advance_balances (tenant_id, student_id, balance) VALUES ($1, $2, 0) \
             ON CONFLICT (tenant_id, student_id) DO NOTHING",
        )
        .bind(tenant_id)
        .bind(student_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("open advance balance", e))?;

        let row = sqlx::query_as::<_, AdvanceBalanceRow>(
            "SELECT tenant_id, student_id, balance, updated_utc FROM advance_balances \
             WHERE tenant_id = $1 AND student_id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(student_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| storage_error("lock advance balance", e))?;

        Ok(row.into())
    }

    async fn insert_payment(&mut self, payment: &PaymentRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO payment_records (payment_id, tenant_id, fee_assignment_id, amount,
                advance_amount, method, platform_fee, school_share, status,
                gateway_transaction_id, bank_ref_no, gateway_response_raw, transfer_id,
                split_status, redirected_to_advance, collected_by, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18)
            "#,
        )
        .bind(payment.payment_id)
        .bind(payment.tenant_id)
        .bind(payment.fee_assignment_id)
        .bind(payment.amount)
        .bind(payment.advance_amount)
        .bind(payment.method.as_str())
        .bind(payment.platform_fee)
        .bind(payment.school_share)
        .bind(payment.status.as_str())
        .bind(&payment.gateway_transaction_id)
        .bind(&payment.bank_ref_no)
        .bind(&payment.gateway_response_raw)
        .bind(&payment.transfer_id)
        .bind(payment.split_status.as_str())
        .bind(payment.redirected_to_advance)
        .bind(&payment.collected_by)
        .bind(payment.created_utc)
        .bind(payment.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match storage_error("insert payment", e) {
            LedgerError::Conflict(_) => LedgerError::Conflict(format!(
                "payment for gateway transaction '{}' already exists",
                payment.gateway_transaction_id
            )),
            other => other,
        })?;

        Ok(())
    }

    async fn update_payment(&mut self, payment: &PaymentRecord) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE payment_records
            SET status = $3, bank_ref_no = $4, gateway_response_raw = $5, transfer_id = $6,
                split_status = $7, redirected_to_advance = $8, advance_amount = $9,
                updated_utc = $10
            WHERE tenant_id = $1 AND payment_id = $2
            "#,
        )
        .bind(payment.tenant_id)
        .bind(payment.payment_id)
        .bind(payment.status.as_str())
        .bind(&payment.bank_ref_no)
        .bind(&payment.gateway_response_raw)
        .bind(&payment.transfer_id)
        .bind(payment.split_status.as_str())
        .bind(payment.redirected_to_advance)
        .bind(payment.advance_amount)
        .bind(payment.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("update payment", e))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("payment {}", payment.payment_id)));
        }
        Ok(())
    }

    async fn update_fee_assignment(
        &mut self,
        assignment: &FeeAssignment,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE fee_assignments
            SET paid_amount = $3, status = $4, updated_utc = $5
            WHERE tenant_id = $1 AND fee_assignment_id = $2
            "#,
        )
        .bind(assignment.tenant_id)
        .bind(assignment.fee_assignment_id)
        .bind(assignment.paid_amount)
        .bind(assignment.status.as_str())
        .bind(assignment.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("update fee assignment", e))?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!(
                "fee assignment {}",
                assignment.fee_assignment_id
            )));
        }
        Ok(())
    }

    async fn update_advance_balance(
        &mut self,
        balance: &AdvanceBalance,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE advance_balances SET balance = $3, updated_utc = $4 \
             WHERE tenant_id = $1 AND student_id = $2",
        )
        .bind(balance.tenant_id)
        .bind(balance.student_id)
        .bind(balance.balance)
        .bind(balance.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("update advance balance", e))?;

        Ok(())
    }

    async fn insert_wallet_transaction(
        &mut self,
        entry: &WalletTransaction,
    ) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            "INSERT INTO wallet_transactions ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            WALLET_TXN_COLUMNS
        ))
        .bind(entry.wallet_txn_id)
        .bind(entry.tenant_id)
        .bind(entry.student_id)
        .bind(entry.direction.as_str())
        .bind(entry.amount)
        .bind(entry.source_ref)
        .bind(&entry.actor)
        .bind(entry.balance_after)
        .bind(entry.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("insert wallet transaction", e))?;

        Ok(())
    }

    async fn insert_income(&mut self, entry: &IncomeEntry) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            "INSERT INTO income_entries ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            INCOME_COLUMNS
        ))
        .bind(entry.income_id)
        .bind(entry.tenant_id)
        .bind(entry.source.as_str())
        .bind(entry.amount)
        .bind(entry.entry_utc)
        .bind(&entry.reference)
        .bind(entry.payment_id)
        .bind(&entry.remarks)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("insert income entry", e))?;

        Ok(())
    }

    async fn insert_compensation(
        &mut self,
        entry: &CompensationEntry,
    ) -> Result<(), LedgerError> {
        sqlx::query(&format!(
            "INSERT INTO compensation_log ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            COMPENSATION_COLUMNS
        ))
        .bind(entry.compensation_id)
        .bind(entry.tenant_id)
        .bind(entry.payment_id)
        .bind(entry.kind.as_str())
        .bind(entry.amount)
        .bind(&entry.reason)
        .bind(&entry.actor)
        .bind(entry.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| storage_error("insert compensation", e))?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), LedgerError> {
        self.tx
            .commit()
            .await
            .map_err(|e| storage_error("commit transaction", e))
    }
}
