use crate::error::LienError;
use crate::types::{Borrower, LoanSnapshot, LoanStatus};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

/// Read/write surface of the loan contract.
///
/// Implementations map these calls onto whatever transport the surrounding
/// app supplies. The contract is the single source of truth for loan state;
/// this core persists nothing.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Chain id of the network the client is currently connected to.
    async fn chain_id(&self) -> Result<u64, LienError>;

    /// Whether contract code is deployed at the configured address.
    async fn has_contract_code(&self) -> Result<bool, LienError>;

    /// The configured contract address, for diagnostics.
    fn contract_address(&self) -> &str;

    /// Fetch the borrower's loan record. An account without a loan may
    /// surface as `LienError::TransientRevert` (empty revert); callers must
    /// treat that as an empty record, not a failure.
    async fn get_active_loan(&self, borrower: &Borrower) -> Result<RawLoanRecord, LienError>;

    /// Transfer `value_minor` to repay the loan. Returns the transaction
    /// hash. May reject for insufficient funds or ineligible loan status.
    async fn pay_back_loan(
        &self,
        borrower: &Borrower,
        value_minor: u64,
    ) -> Result<String, LienError>;

    /// Privileged write moving the loan to `status`. Used only by the
    /// status-correction fallback; may reject `Unauthorized`.
    async fn update_loan_status(
        &self,
        borrower: &Borrower,
        status: LoanStatus,
    ) -> Result<String, LienError>;

    /// Contract's pooled balance. Informational only.
    async fn get_contract_balance(&self) -> Result<u64, LienError>;
}

/// Wire-shaped loan record as returned by the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawLoanRecord {
    pub amount_minor: u64,
    /// Unix seconds.
    pub max_payment_date: i64,
    pub status_code: u8,
    /// Unix seconds.
    pub created_at: i64,
    pub is_overdue: bool,
}

impl RawLoanRecord {
    /// Normalize the wire record into an immutable snapshot.
    ///
    /// Unknown status codes are a contract violation and are rejected
    /// rather than guessed; guessing could unlock a device that should
    /// stay locked.
    pub fn into_snapshot(self, fetched_at: DateTime<Utc>) -> Result<LoanSnapshot, LienError> {
        let status = LoanStatus::from_code(self.status_code)
            .ok_or_else(|| LienError::Ledger(format!("unknown status code {}", self.status_code)))?;

        Ok(LoanSnapshot {
            principal_minor: self.amount_minor,
            due_at: unix_seconds(self.max_payment_date),
            status,
            created_at: unix_seconds(self.created_at),
            ledger_overdue: self.is_overdue,
            fetched_at,
        })
    }
}

fn unix_seconds(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
