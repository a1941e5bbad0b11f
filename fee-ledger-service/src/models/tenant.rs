use rust_decimal::Decimal;
use secrecy::Secret;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::LedgerError;

/// Plan features a school can have switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanFeature {
    OnlinePayments,
    AdvanceWallet,
    SplitSettlement,
}

impl PlanFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnlinePayments => "ONLINE_PAYMENTS",
            Self::AdvanceWallet => "ADVANCE_WALLET",
            Self::SplitSettlement => "SPLIT_SETTLEMENT",
        }
    }
}

impl fmt::Display for PlanFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanFeature {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLINE_PAYMENTS" => Ok(Self::OnlinePayments),
            "ADVANCE_WALLET" => Ok(Self::AdvanceWallet),
            "SPLIT_SETTLEMENT" => Ok(Self::SplitSettlement),
            other => Err(LedgerError::Validation(format!(
                "unknown plan feature '{}'",
                other
            ))),
        }
    }
}

/// Platform commission on online payments unless the school negotiated another.
pub const DEFAULT_COMMISSION_PERCENT: Decimal = Decimal::from_parts(250, 0, 0, false, 2);

/// One isolated school on the platform.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub tenant_id: Uuid,
    pub subdomain: String,
    pub webhook_secret: Option<Secret<String>>,
    pub features: Vec<PlanFeature>,
    pub commission_percent: Decimal,
    pub active: bool,
}

impl Tenant {
    pub fn has_feature(&self, feature: PlanFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Fail with `FeatureDisabled` unless the plan includes `feature`.
    pub fn require_feature(&self, feature: PlanFeature) -> Result<(), LedgerError> {
        if self.has_feature(feature) {
            Ok(())
        } else {
            Err(LedgerError::FeatureDisabled(feature))
        }
    }
}

/// Parse stored feature flags, rejecting anything outside the closed set.
pub fn parse_features<I, S>(raw: I) -> Result<Vec<PlanFeature>, LedgerError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter().map(|s| s.as_ref().parse()).collect()
}
