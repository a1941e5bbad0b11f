//! Fee collection at the school office.
//!
//! One collection can settle several of a student's fees. Each allocation
//! becomes a COMPLETED payment with its own income row. Money received beyond
//! the allocations goes to the advance wallet as part of the last payment, so
//! refunding that payment takes it back out.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{
    ensure_money_scale, AdvanceBalance, FeeAssignment, IncomeEntry, PaymentMethod, PaymentRecord,
    PlanFeature, Tenant,
};
use crate::services::metrics::FEE_COLLECTIONS_TOTAL;
use crate::services::retry::{with_lock_retry, LockRetryPolicy};
use crate::services::store::LedgerStore;
use crate::services::wallet;

/// Part of a collection earmarked for one fee.
#[derive(Debug, Clone, Deserialize)]
pub struct FeeAllocation {
    pub fee_assignment_id: Uuid,
    pub amount: Decimal,
}

/// Money handed over at the office for one student.
#[derive(Debug, Clone)]
pub struct FeeCollection {
    pub student_id: Uuid,
    pub amount_received: Decimal,
    pub method: PaymentMethod,
    /// Cheque number, bank transfer UTR or similar.
    pub reference: Option<String>,
    pub remarks: Option<String>,
    /// Explicit split across fees. Empty means oldest due date first.
    pub allocations: Vec<FeeAllocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReceipt {
    pub receipt_no: String,
    pub student_id: Uuid,
    pub method: PaymentMethod,
    pub total_received: Decimal,
    pub total_applied: Decimal,
    pub advance_amount: Decimal,
    /// Wallet after the advance credit; absent when nothing was credited.
    pub wallet_balance: Option<AdvanceBalance>,
    pub payments: Vec<PaymentRecord>,
    pub assignments: Vec<FeeAssignment>,
}

fn receipt_number(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "RCPT-{}-{}",
        now.format("%Y%m%d"),
        suffix[..8].to_ascii_uppercase()
    )
}

/// Decide how much of the collection each fee takes.
fn plan_allocations(
    fees: Vec<FeeAssignment>,
    collection: &FeeCollection,
) -> Result<Vec<(FeeAssignment, Decimal)>, LedgerError> {
    if collection.allocations.is_empty() {
        let mut remaining = collection.amount_received;
        let mut plan = Vec::new();
        for fee in fees {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = fee.outstanding().min(remaining);
            if take > Decimal::ZERO {
                remaining -= take;
                plan.push((fee, take));
            }
        }
        return Ok(plan);
    }

    let mut by_id: HashMap<Uuid, FeeAssignment> = fees
        .into_iter()
        .map(|fee| (fee.fee_assignment_id, fee))
        .collect();
    collection
        .allocations
        .iter()
        .map(|allocation| {
            let fee = by_id.remove(&allocation.fee_assignment_id).ok_or_else(|| {
                LedgerError::NotFound(format!(
                    "fee assignment {} for student {}",
                    allocation.fee_assignment_id, collection.student_id
                ))
            })?;
            let (fits, _) = fee.split_incoming(allocation.amount);
            if fits != allocation.amount {
                return Err(LedgerError::Validation(format!(
                    "allocation {} exceeds outstanding {} on fee {}",
                    allocation.amount,
                    fee.outstanding(),
                    fee.fee_assignment_id
                )));
            }
            Ok((fee, allocation.amount))
        })
        .collect()
}

#[derive(Clone)]
pub struct FeeCollector {
    store: Arc<dyn LedgerStore>,
    retry: LockRetryPolicy,
}

impl FeeCollector {
    pub fn new(store: Arc<dyn LedgerStore>, retry: LockRetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Record cash, cheque or other offline money against a student's fees.
    ///
    /// Any excess over what the fees absorb needs the advance wallet; without
    /// it the collection is refused rather than leaving money unbooked.
    #[instrument(skip(self, tenant, collection), fields(tenant_id = %tenant.tenant_id, student_id = %collection.student_id, method = %collection.method))]
    pub async fn collect_fees(
        &self,
        tenant: &Tenant,
        collection: &FeeCollection,
        actor: &str,
    ) -> Result<CollectionReceipt, LedgerError> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(LedgerError::Validation("actor is required".to_string()));
        }
        if !collection.method.is_offline() {
            return Err(LedgerError::Validation(
                "online payments are settled by gateway webhooks".to_string(),
            ));
        }
        ensure_money_scale(collection.amount_received, "amount received")?;
        if collection.amount_received <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "amount received must be positive, got {}",
                collection.amount_received
            )));
        }

        let mut seen = HashSet::new();
        let mut allocated = Decimal::ZERO;
        for allocation in &collection.allocations {
            ensure_money_scale(allocation.amount, "allocation amount")?;
            if allocation.amount <= Decimal::ZERO {
                return Err(LedgerError::Validation(format!(
                    "allocation for fee {} must be positive",
                    allocation.fee_assignment_id
                )));
            }
            if !seen.insert(allocation.fee_assignment_id) {
                return Err(LedgerError::Validation(format!(
                    "fee {} is allocated more than once",
                    allocation.fee_assignment_id
                )));
            }
            allocated += allocation.amount;
        }
        if allocated > collection.amount_received {
            return Err(LedgerError::Validation(format!(
                "allocations total {} but only {} was received",
                allocated, collection.amount_received
            )));
        }

        let result = with_lock_retry(&self.retry, "collect_fees", || {
            self.collect_once(tenant, collection, actor)
        })
        .await;

        let status = match &result {
            Ok(_) => "ok",
            Err(LedgerError::Validation(_)) | Err(LedgerError::FeatureDisabled(_)) => "rejected",
            Err(_) => "error",
        };
        FEE_COLLECTIONS_TOTAL
            .with_label_values(&[collection.method.as_str(), status])
            .inc();
        let receipt = result?;

        tracing::info!(
            target: "audit",
            tenant_id = %tenant.tenant_id,
            student_id = %collection.student_id,
            receipt_no = %receipt.receipt_no,
            method = %receipt.method,
            received = %receipt.total_received,
            applied = %receipt.total_applied,
            advance = %receipt.advance_amount,
            actor = %actor,
            "Fees collected"
        );
        Ok(receipt)
    }

    async fn collect_once(
        &self,
        tenant: &Tenant,
        collection: &FeeCollection,
        actor: &str,
    ) -> Result<CollectionReceipt, LedgerError> {
        let tenant_id = tenant.tenant_id;
        let now = Utc::now();
        let receipt_no = receipt_number(now);
        let mut tx = self.store.begin().await?;

        let fees = tx
            .lock_fee_assignments_for_student(tenant_id, collection.student_id)
            .await?;
        if fees.is_empty() {
            return Err(LedgerError::NotFound(format!(
                "fee assignments for student {}",
                collection.student_id
            )));
        }

        let plan = plan_allocations(fees, collection)?;
        if plan.is_empty() {
            return Err(LedgerError::Validation(format!(
                "student {} has nothing outstanding to collect against",
                collection.student_id
            )));
        }
        let total_applied: Decimal = plan.iter().map(|(_, amount)| *amount).sum();
        let excess = collection.amount_received - total_applied;
        if excess > Decimal::ZERO {
            tenant.require_feature(PlanFeature::AdvanceWallet)?;
        }

        let last = plan.len() - 1;
        let mut payments = Vec::with_capacity(plan.len());
        let mut assignments = Vec::with_capacity(plan.len());
        for (index, (mut fee, amount)) in plan.into_iter().enumerate() {
            let carried = if index == last { excess } else { Decimal::ZERO };
            let mut payment = PaymentRecord::collected(
                tenant_id,
                fee.fee_assignment_id,
                amount + carried,
                collection.method,
                format!("{}/{}", receipt_no, index + 1),
                actor,
                now,
            );
            payment.advance_amount = carried;
            payment.bank_ref_no = collection.reference.clone();

            fee.apply_payment(amount, now)?;
            tx.insert_payment(&payment).await?;
            tx.update_fee_assignment(&fee).await?;
            tx.insert_income(&IncomeEntry::fee_collected(
                tenant_id,
                payment.payment_id,
                payment.amount,
                payment.gateway_transaction_id.clone(),
                collection.method,
                collection.remarks.as_deref(),
                now,
            ))
            .await?;

            payments.push(payment);
            assignments.push(fee);
        }

        let wallet_balance = match payments.last() {
            Some(payment) if excess > Decimal::ZERO => Some(
                wallet::credit(
                    tx.as_mut(),
                    tenant_id,
                    collection.student_id,
                    excess,
                    payment.payment_id,
                    actor,
                    now,
                )
                .await?,
            ),
            _ => None,
        };
        tx.commit().await?;

        Ok(CollectionReceipt {
            receipt_no,
            student_id: collection.student_id,
            method: collection.method,
            total_received: collection.amount_received,
            total_applied,
            advance_amount: excess,
            wallet_balance,
            payments,
            assignments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewFeeAssignment;
    use chrono::NaiveDate;

    fn fee(amount: i64, due: Option<NaiveDate>) -> FeeAssignment {
        FeeAssignment::new(
            &NewFeeAssignment {
                tenant_id: Uuid::new_v4(),
                student_id: Uuid::new_v4(),
                fee_head_id: Uuid::new_v4(),
                amount: Decimal::from(amount),
                discount: Decimal::ZERO,
                due_date: due,
            },
            Utc::now(),
        )
        .unwrap()
    }

    fn collection(received: i64, allocations: Vec<FeeAllocation>) -> FeeCollection {
        FeeCollection {
            student_id: Uuid::new_v4(),
            amount_received: Decimal::from(received),
            method: PaymentMethod::Cash,
            reference: None,
            remarks: None,
            allocations,
        }
    }

    #[test]
    fn automatic_allocation_fills_fees_in_order() {
        let first = fee(1000, NaiveDate::from_ymd_opt(2026, 4, 1));
        let second = fee(800, NaiveDate::from_ymd_opt(2026, 5, 1));

        let plan = plan_allocations(vec![first.clone(), second.clone()], &collection(1500, vec![]))
            .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].0.fee_assignment_id, first.fee_assignment_id);
        assert_eq!(plan[0].1, Decimal::from(1000));
        assert_eq!(plan[1].1, Decimal::from(500));
    }

    #[test]
    fn explicit_allocation_cannot_exceed_outstanding() {
        let target = fee(1000, None);
        let err = plan_allocations(
            vec![target.clone()],
            &collection(
                2000,
                vec![FeeAllocation {
                    fee_assignment_id: target.fee_assignment_id,
                    amount: Decimal::from(1200),
                }],
            ),
        )
        .unwrap_err();

        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn receipt_numbers_carry_the_date() {
        let at = DateTime::parse_from_rfc3339("2026-06-15T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let receipt = receipt_number(at);
        assert!(receipt.starts_with("RCPT-20260615-"));
        assert_eq!(receipt.len(), "RCPT-20260615-".len() + 8);
    }
}
