use crate::error::LienError;
use crate::ledger::LedgerClient;
use crate::poller::LoanPoller;
use crate::runtime::EnforcementState;
use crate::types::{Borrower, LoanStatus, PaymentAttempt, PaymentOutcome, PaymentReceipt};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Post-payment confirmation timing.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Period between confirmation polls.
    pub confirm_interval: Duration,
    /// Hard bound on confirmation polls per cycle.
    pub max_confirm_polls: u32,
    /// Iteration from which the device is unlocked regardless of polled
    /// status. The payment was accepted by the ledger; the user must not
    /// stay locked out waiting for a late confirmation.
    pub force_unlock_after: u32,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            confirm_interval: Duration::from_secs(1),
            max_confirm_polls: 15,
            force_unlock_after: 3,
        }
    }
}

/// Orchestrates the post-payment unlock sequence: the status-correcting
/// payment retry and the bounded confirmation loop.
pub struct PaymentCoordinator {
    ledger: Arc<dyn LedgerClient>,
    config: PaymentConfig,
}

impl PaymentCoordinator {
    pub fn new(ledger: Arc<dyn LedgerClient>, config: PaymentConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Submit the repayment. If the direct call is rejected for a
    /// status-dependent reason, move the loan into a payable state and
    /// retry once. When both paths fail the original error is surfaced;
    /// the first failure is diagnostic ground truth.
    pub async fn pay_with_fallback(
        &self,
        borrower: &Borrower,
        value_minor: u64,
    ) -> Result<PaymentReceipt, LienError> {
        match self.ledger.pay_back_loan(borrower, value_minor).await {
            Ok(tx_hash) => Ok(receipt(tx_hash, value_minor, false)),
            Err(primary) => {
                warn!(error = %primary, "direct payment rejected, trying status-correcting retry");
                match self.status_corrected_payment(borrower, value_minor).await {
                    Some(r) => Ok(r),
                    None => Err(primary),
                }
            }
        }
    }

    async fn status_corrected_payment(
        &self,
        borrower: &Borrower,
        value_minor: u64,
    ) -> Option<PaymentReceipt> {
        if let Err(err) = self
            .ledger
            .update_loan_status(borrower, LoanStatus::Overdue)
            .await
        {
            warn!(error = %err, "status correction rejected");
            return None;
        }

        match self.ledger.pay_back_loan(borrower, value_minor).await {
            Ok(tx_hash) => Some(receipt(tx_hash, value_minor, true)),
            Err(err) => {
                warn!(error = %err, "payment retry after status correction failed");
                None
            }
        }
    }

    /// Bounded confirmation loop, run after the ledger accepted a payment.
    ///
    /// Polls once per `confirm_interval`. From `force_unlock_after`
    /// iterations onward the device is unlocked regardless of polled
    /// status. Ending at the poll bound without ledger confirmation is
    /// eventual-consistency lag, not an error. Progress is mirrored into
    /// `cycle` so a cancelled task leaves accurate bookkeeping behind.
    pub(crate) async fn confirm(
        &self,
        poller: &LoanPoller,
        state: &EnforcementState,
        borrower: &Borrower,
        cycle: &tokio::sync::Mutex<Option<PaymentAttempt>>,
    ) -> PaymentAttempt {
        let mut attempt = PaymentAttempt::begin();
        *cycle.lock().await = Some(attempt.clone());
        info!(
            trace_id = %attempt.trace_id,
            borrower = %borrower.short(),
            "payment confirmation started"
        );

        let mut forced = false;
        for iteration in 1..=self.config.max_confirm_polls {
            tokio::time::sleep(self.config.confirm_interval).await;
            attempt.polls = iteration;
            cycle.lock().await.replace(attempt.clone());

            match poller.poll(borrower).await {
                Ok(snapshot) => {
                    let settled = !snapshot.requires_lock();
                    state.ingest_snapshot(snapshot).await;
                    if settled {
                        info!(
                            trace_id = %attempt.trace_id,
                            iteration,
                            "ledger confirmed repayment"
                        );
                        attempt.finish(PaymentOutcome::Confirmed);
                        cycle.lock().await.replace(attempt.clone());
                        return attempt;
                    }
                }
                // Poll failures stay advisory; the cycle keeps going.
                Err(err) => state.ingest_error(&err).await,
            }

            if iteration >= self.config.force_unlock_after {
                state.force_unlock().await;
                forced = true;
            }
        }

        attempt.finish(if forced {
            PaymentOutcome::ForcedUnlock
        } else {
            PaymentOutcome::Abandoned
        });
        cycle.lock().await.replace(attempt.clone());
        info!(
            trace_id = %attempt.trace_id,
            polls = attempt.polls,
            outcome = ?attempt.outcome,
            "payment confirmation ended without ledger confirmation"
        );
        attempt
    }
}

fn receipt(tx_hash: String, amount_minor: u64, via_status_correction: bool) -> PaymentReceipt {
    PaymentReceipt {
        tx_hash,
        amount_minor,
        via_status_correction,
        submitted_at: Utc::now(),
    }
}
