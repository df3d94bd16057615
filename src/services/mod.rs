//! Settlement core services
//!
//! Services are built bottom-up: the wallet ledger first, then the engines
//! that credit it, then the lifecycle that triggers settlement.

pub mod commission;
pub mod lifecycle;
pub mod loyalty_bonus;
pub mod reconciliation;
pub mod settlement;
pub mod wallet_ledger;
pub mod withdrawal;

use std::sync::Arc;

use tokio::time::Duration;

pub use commission::{split_commission, CommissionDistributor, CommissionShare};
pub use lifecycle::{ServiceLifecycle, TransitionOutcome};
pub use loyalty_bonus::{GrantedBonus, LoyaltyBonusEngine, LoyaltyPoints};
pub use reconciliation::{ReconciliationReport, ReconciliationWorker};
pub use settlement::{compute_breakdown, SettlementEngine};
pub use wallet_ledger::{Credit, WalletLedger, WalletVerification};
pub use withdrawal::{WithdrawalOutcome, WithdrawalProcessor};

use crate::collaborators::Collaborators;
use crate::config::LedgerConfig;
use crate::store::LedgerStore;

/// Every service wired against one store and one set of collaborators
#[derive(Clone)]
pub struct Services {
    pub wallets: Arc<WalletLedger>,
    pub loyalty: Arc<LoyaltyBonusEngine>,
    pub commissions: Arc<CommissionDistributor>,
    pub settlement: Arc<SettlementEngine>,
    pub lifecycle: Arc<ServiceLifecycle>,
    pub withdrawals: Arc<WithdrawalProcessor>,
    pub reconciliation: Arc<ReconciliationWorker>,
}

impl Services {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: Arc<LedgerConfig>,
        collaborators: Collaborators,
        reconcile_interval: Duration,
    ) -> Self {
        let wallets = Arc::new(WalletLedger::new(
            store.clone(),
            config.clone(),
            collaborators.clone(),
        ));
        let loyalty = Arc::new(LoyaltyBonusEngine::new(
            store.clone(),
            config.clone(),
            wallets.clone(),
            collaborators.clone(),
        ));
        let commissions = Arc::new(CommissionDistributor::new(
            store.clone(),
            config.clone(),
            wallets.clone(),
            collaborators.clone(),
        ));
        let settlement = Arc::new(SettlementEngine::new(
            store.clone(),
            config.clone(),
            commissions.clone(),
            collaborators.clone(),
        ));
        let lifecycle = Arc::new(ServiceLifecycle::new(
            store.clone(),
            config.clone(),
            settlement.clone(),
            wallets.clone(),
            loyalty.clone(),
            collaborators.clone(),
        ));
        let withdrawals = Arc::new(WithdrawalProcessor::new(
            store.clone(),
            config.clone(),
            wallets.clone(),
            collaborators,
        ));
        let reconciliation = Arc::new(ReconciliationWorker::new(
            store,
            config,
            settlement.clone(),
            commissions.clone(),
            loyalty.clone(),
            lifecycle.clone(),
            reconcile_interval,
        ));

        Self {
            wallets,
            loyalty,
            commissions,
            settlement,
            lifecycle,
            withdrawals,
            reconciliation,
        }
    }
}
