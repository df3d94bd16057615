//! Environment-driven configuration

mod ledger;
mod server;

pub use ledger::{LedgerConfig, MembershipCommissionTable, WithdrawalFeeRule, WithdrawalFeeTable};
pub use server::ServerConfig;

use std::str::FromStr;

/// Parse `key` from the environment, falling back to `default` when it is
/// unset or malformed.
pub(crate) fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring malformed configuration value");
                default
            }
        },
        Err(_) => default,
    }
}

/// Non-empty environment value.
pub(crate) fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
