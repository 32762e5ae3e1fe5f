use crate::error::LienError;
use crate::ledger::LedgerClient;
use crate::types::{Borrower, ChainProfile, LoanSnapshot};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Poller timing and validation configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Recurring poll period while a borrower identity is connected.
    pub interval: Duration,
    /// Client-side bound on a single poll.
    pub timeout: Duration,
    /// Network every read is validated against.
    pub chain: ChainProfile,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(15),
            chain: ChainProfile::default(),
        }
    }
}

/// Validated, timeout-bounded loan reads.
///
/// Concurrent polls for the same identity are not de-duplicated: snapshots
/// are idempotent reads, so callers keep whichever poll completes last.
pub struct LoanPoller {
    ledger: Arc<dyn LedgerClient>,
    config: PollerConfig,
}

impl LoanPoller {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: PollerConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Fetch and normalize the borrower's loan record.
    ///
    /// An empty-reason revert means an account without a loan and yields
    /// the empty snapshot rather than an error.
    pub async fn poll(&self, borrower: &Borrower) -> Result<LoanSnapshot, LienError> {
        match tokio::time::timeout(self.config.timeout, self.poll_inner(borrower)).await {
            Ok(result) => result,
            Err(_) => Err(LienError::NetworkTimeout(self.config.timeout.as_secs())),
        }
    }

    async fn poll_inner(&self, borrower: &Borrower) -> Result<LoanSnapshot, LienError> {
        let actual = self.ledger.chain_id().await?;
        let expected = self.config.chain.chain_id;
        if actual != expected {
            return Err(LienError::WrongNetwork { expected, actual });
        }

        if !self.ledger.has_contract_code().await? {
            return Err(LienError::ContractNotFound(
                self.ledger.contract_address().to_string(),
            ));
        }

        match self.ledger.get_active_loan(borrower).await {
            Ok(raw) => raw.into_snapshot(Utc::now()),
            Err(LienError::TransientRevert) => {
                debug!(borrower = %borrower.short(), "empty revert from loan read, no active loan");
                Ok(LoanSnapshot::empty(Utc::now()))
            }
            Err(other) => Err(other),
        }
    }
}
