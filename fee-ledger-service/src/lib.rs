//! Multi-tenant fee payment reconciliation ledger.
//!
//! Gateway webhooks move payments from PENDING to COMPLETED and credit the
//! matching fee assignment and income ledger in one transaction. Refunds and
//! moves to the advance wallet are the only ways a completed payment is
//! unwound.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use error::LedgerError;
pub use startup::{build_router, AppState, Application};
