//! Ledger domain types.
//!
//! These are storage-agnostic: the Postgres store maps its rows onto them and
//! the in-memory store keeps them directly.

pub mod compensation;
pub mod fee_assignment;
pub mod income;
pub mod payment;
pub mod tenant;
pub mod wallet;

pub use compensation::{CompensationEntry, CompensationKind};
pub use fee_assignment::{
    derive_fee_status, ensure_money_scale, FeeAssignment, FeeStatus, NewFeeAssignment,
    FULL_PAYMENT_TOLERANCE, MONEY_SCALE,
};
pub use income::{IncomeEntry, IncomeRange, IncomeSource};
pub use payment::{
    platform_fee_for, NewPendingPayment, PaymentMethod, PaymentRecord, PaymentStatus, SplitStatus,
    LEDGER_CURRENCY,
};
pub use tenant::{parse_features, PlanFeature, Tenant, DEFAULT_COMMISSION_PERCENT};
pub use wallet::{AdvanceBalance, WalletDirection, WalletTransaction};
