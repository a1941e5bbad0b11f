//! Request and response bodies for the HTTP API.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    AdvanceBalance, FeeAssignment, IncomeEntry, PaymentMethod, PaymentRecord, WalletTransaction,
};
use crate::services::collection::FeeAllocation;

#[derive(Debug, Deserialize)]
pub struct RegisterPaymentRequest {
    pub fee_assignment_id: Uuid,
    pub amount: Decimal,
    /// Gateway order id the checkout was opened with.
    pub gateway_transaction_id: String,
    /// Route the school's share through a gateway transfer.
    #[serde(default)]
    pub split_settlement: bool,
}

#[derive(Debug, Deserialize)]
pub struct CollectFeesRequest {
    pub amount_received: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub remarks: Option<String>,
    #[serde(default)]
    pub allocations: Vec<FeeAllocation>,
}

#[derive(Debug, Deserialize)]
pub struct CompensationRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct SettleFromWalletRequest {
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct CreateFeeAssignmentRequest {
    pub student_id: Uuid,
    pub fee_head_id: Uuid,
    pub amount: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
pub struct PaymentDetailResponse {
    #[serde(flatten)]
    pub payment: PaymentRecord,
    pub income_entries: Vec<IncomeEntry>,
}

#[derive(Debug, Serialize)]
pub struct FeeAssignmentDetailResponse {
    #[serde(flatten)]
    pub assignment: FeeAssignment,
    pub outstanding: Decimal,
    pub payments: Vec<PaymentRecord>,
}

#[derive(Debug, Serialize)]
pub struct AdvanceBalanceResponse {
    pub student_id: Uuid,
    pub balance: Decimal,
    pub transactions: Vec<WalletTransaction>,
}

impl AdvanceBalanceResponse {
    pub fn new(
        student_id: Uuid,
        balance: Option<AdvanceBalance>,
        transactions: Vec<WalletTransaction>,
    ) -> Self {
        Self {
            student_id,
            balance: balance.map(|b| b.balance).unwrap_or(Decimal::ZERO),
            transactions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IncomeReportResponse {
    pub entries: Vec<IncomeEntry>,
    pub total: Decimal,
}

impl From<Vec<IncomeEntry>> for IncomeReportResponse {
    fn from(entries: Vec<IncomeEntry>) -> Self {
        let total = entries.iter().map(|e| e.amount).sum();
        Self { entries, total }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl WebhookAck {
    pub fn new(outcome: impl Into<String>) -> Self {
        Self {
            received: true,
            outcome: outcome.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
