use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{env_opt, env_parse};
use crate::models::{AmbassadorTier, MembershipTier};
use crate::money::apply_bps;

/// Fallback key in the withdrawal fee table.
pub const DEFAULT_COUNTRY: &str = "*";

/// Rates, thresholds and limits used by the settlement core.
///
/// Amounts are minor units, rates are basis points.
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub processor_fee_bps: i64,
    pub platform_commission_bps: i64,
    pub loyalty_fund_bps: i64,
    pub points_unit_minor: i64,
    pub loyalty_bonus_threshold: i64,
    pub loyalty_bonus_amount: i64,
    pub default_daily_spending_limit: i64,
    pub default_withdrawal_limit: i64,
    pub provider_ambassador_share_bps: i64,
    pub requester_ambassador_share_bps: i64,
    pub store_max_retries: u32,
    pub reconcile_max_attempts: i32,
    pub withdrawal_fees: WithdrawalFeeTable,
    pub membership_commissions: MembershipCommissionTable,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            processor_fee_bps: 400,
            platform_commission_bps: 600,
            loyalty_fund_bps: 1_000,
            points_unit_minor: 1_000,
            loyalty_bonus_threshold: 200_000,
            loyalty_bonus_amount: 2_000,
            default_daily_spending_limit: 500_000,
            default_withdrawal_limit: 1_000_000,
            provider_ambassador_share_bps: 6_000,
            requester_ambassador_share_bps: 4_000,
            store_max_retries: 5,
            reconcile_max_attempts: 10,
            withdrawal_fees: WithdrawalFeeTable::default(),
            membership_commissions: MembershipCommissionTable::default(),
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let withdrawal_fees = match env_opt("WITHDRAWAL_FEES") {
            Some(raw) => match WithdrawalFeeTable::from_json(&raw) {
                Ok(table) => table,
                Err(err) => {
                    tracing::warn!(error = %err, "WITHDRAWAL_FEES is not valid JSON; using defaults");
                    defaults.withdrawal_fees.clone()
                }
            },
            None => defaults.withdrawal_fees.clone(),
        };

        Self {
            processor_fee_bps: env_parse("PROCESSOR_FEE_BPS", defaults.processor_fee_bps),
            platform_commission_bps: env_parse(
                "PLATFORM_COMMISSION_BPS",
                defaults.platform_commission_bps,
            ),
            loyalty_fund_bps: env_parse("LOYALTY_FUND_BPS", defaults.loyalty_fund_bps),
            points_unit_minor: env_parse("POINTS_UNIT_MINOR", defaults.points_unit_minor),
            loyalty_bonus_threshold: env_parse(
                "LOYALTY_BONUS_THRESHOLD_MINOR",
                defaults.loyalty_bonus_threshold,
            ),
            loyalty_bonus_amount: env_parse(
                "LOYALTY_BONUS_AMOUNT_MINOR",
                defaults.loyalty_bonus_amount,
            ),
            default_daily_spending_limit: env_parse(
                "DEFAULT_DAILY_SPENDING_LIMIT_MINOR",
                defaults.default_daily_spending_limit,
            ),
            default_withdrawal_limit: env_parse(
                "DEFAULT_WITHDRAWAL_LIMIT_MINOR",
                defaults.default_withdrawal_limit,
            ),
            provider_ambassador_share_bps: env_parse(
                "PROVIDER_AMBASSADOR_SHARE_BPS",
                defaults.provider_ambassador_share_bps,
            ),
            requester_ambassador_share_bps: env_parse(
                "REQUESTER_AMBASSADOR_SHARE_BPS",
                defaults.requester_ambassador_share_bps,
            ),
            store_max_retries: env_parse("STORE_MAX_RETRIES", defaults.store_max_retries),
            reconcile_max_attempts: env_parse(
                "RECONCILE_MAX_ATTEMPTS",
                defaults.reconcile_max_attempts,
            ),
            withdrawal_fees,
            membership_commissions: defaults.membership_commissions,
        }
    }
}

/// Transfer fee rule for one country
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalFeeRule {
    pub base: i64,
    pub pct_bps: i64,
    pub min: i64,
    pub max: i64,
}

impl WithdrawalFeeRule {
    /// `clamp(base + amount * pct, min, max)`
    pub fn fee_for(&self, amount: i64) -> i64 {
        let raw = self.base + apply_bps(amount, self.pct_bps);
        raw.max(self.min).min(self.max)
    }
}

/// Country-keyed withdrawal fees with a `"*"` fallback
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WithdrawalFeeTable {
    rules: HashMap<String, WithdrawalFeeRule>,
}

impl Default for WithdrawalFeeTable {
    fn default() -> Self {
        let mut rules = HashMap::new();
        rules.insert(
            DEFAULT_COUNTRY.to_string(),
            WithdrawalFeeRule {
                base: 200,
                pct_bps: 150,
                min: 200,
                max: 500,
            },
        );
        Self { rules }
    }
}

impl WithdrawalFeeTable {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let parsed: HashMap<String, WithdrawalFeeRule> = serde_json::from_str(raw)?;
        let mut table = Self::default();
        for (country, rule) in parsed {
            table.rules.insert(country.to_uppercase(), rule);
        }
        Ok(table)
    }

    pub fn with_rule(mut self, country: &str, rule: WithdrawalFeeRule) -> Self {
        self.rules.insert(country.to_uppercase(), rule);
        self
    }

    pub fn rule_for(&self, country: &str) -> WithdrawalFeeRule {
        self.rules
            .get(&country.to_uppercase())
            .or_else(|| self.rules.get(DEFAULT_COUNTRY))
            .copied()
            .unwrap_or(WithdrawalFeeRule {
                base: 0,
                pct_bps: 0,
                min: 0,
                max: 0,
            })
    }
}

/// Flat membership commission amounts by membership and ambassador tier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipCommissionTable {
    pub base_standard: i64,
    pub base_premium: i64,
    pub business_standard: i64,
    pub business_premium: i64,
}

impl Default for MembershipCommissionTable {
    fn default() -> Self {
        Self {
            base_standard: 400,
            base_premium: 500,
            business_standard: 1_000,
            business_premium: 1_250,
        }
    }
}

impl MembershipCommissionTable {
    pub fn amount(&self, membership: MembershipTier, ambassador: AmbassadorTier) -> i64 {
        match (membership, ambassador) {
            (MembershipTier::Base, AmbassadorTier::Standard) => self.base_standard,
            (MembershipTier::Base, AmbassadorTier::Premium) => self.base_premium,
            (MembershipTier::Business, AmbassadorTier::Standard) => self.business_standard,
            (MembershipTier::Business, AmbassadorTier::Premium) => self.business_premium,
        }
    }
}
