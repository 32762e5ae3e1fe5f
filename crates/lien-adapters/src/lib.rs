//! Ledger clients and kiosk device bridges for the lien enforcement core.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lien_core::capability::{BridgeOp, KioskBridge};
use lien_core::error::LienError;
use lien_core::ledger::{LedgerClient, RawLoanRecord};
use lien_core::types::{Borrower, LoanStatus};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// A loan record held by the simulated contract.
#[derive(Debug, Clone)]
pub struct SimulatedLoan {
    pub principal_minor: u64,
    pub due_at: DateTime<Utc>,
    pub status: LoanStatus,
    pub created_at: DateTime<Utc>,
}

impl SimulatedLoan {
    /// A loan that fell due yesterday.
    pub fn overdue(principal_minor: u64) -> Self {
        let now = Utc::now();
        Self {
            principal_minor,
            due_at: now - ChronoDuration::days(1),
            status: LoanStatus::Overdue,
            created_at: now - ChronoDuration::days(30),
        }
    }

    /// A defaulted loan well past its payment window.
    pub fn defaulted(principal_minor: u64) -> Self {
        Self {
            status: LoanStatus::Defaulted,
            ..Self::overdue(principal_minor)
        }
    }

    /// A current loan with time left to pay.
    pub fn active(principal_minor: u64) -> Self {
        let now = Utc::now();
        Self {
            principal_minor,
            due_at: now + ChronoDuration::days(14),
            status: LoanStatus::Active,
            created_at: now,
        }
    }

    fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status != LoanStatus::Paid && now > self.due_at
    }

    fn to_record(&self, now: DateTime<Utc>) -> RawLoanRecord {
        RawLoanRecord {
            amount_minor: self.principal_minor,
            max_payment_date: self.due_at.timestamp(),
            status_code: self.status.code(),
            created_at: self.created_at.timestamp(),
            is_overdue: self.is_overdue(now),
        }
    }
}

/// Behavior knobs for [`SimulatedLedger`].
#[derive(Debug, Clone)]
pub struct SimulatedLedgerConfig {
    pub chain_id: u64,
    pub contract_address: String,
    /// False simulates an address with no deployed code.
    pub deployed: bool,
    /// Contract guard: direct repayment of a defaulted loan reverts and the
    /// caller must first move the loan to a payable status.
    pub reject_defaulted_payment: bool,
    /// Whether the caller holds the operator role for status writes.
    pub privileged_caller: bool,
    /// Number of reads after repayment that still report the pre-payment
    /// record, simulating ledger settlement lag.
    pub settlement_lag_reads: u32,
    /// Artificial latency per read.
    pub read_delay: Option<Duration>,
}

impl Default for SimulatedLedgerConfig {
    fn default() -> Self {
        Self {
            chain_id: 10_143,
            contract_address: "0x5e1f00d5a9b7c64e3a2d9f81c0ffee04216ab001".to_string(),
            deployed: true,
            reject_defaulted_payment: true,
            privileged_caller: true,
            settlement_lag_reads: 0,
            read_delay: None,
        }
    }
}

struct SimulatedLedgerState {
    loan: Option<SimulatedLoan>,
    /// Pre-payment record still served while settlement lag remains.
    stale: Option<(SimulatedLoan, u32)>,
    balance_minor: u64,
}

/// Deterministic in-memory loan contract for local runs and tests.
///
/// Mirrors the deployed contract's observable behavior: an account without
/// a loan reads back as an empty revert, repayment of a defaulted loan is
/// guarded, and status writes require the operator role.
pub struct SimulatedLedger {
    config: SimulatedLedgerConfig,
    state: Mutex<SimulatedLedgerState>,
}

impl SimulatedLedger {
    pub fn new(config: SimulatedLedgerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SimulatedLedgerState {
                loan: None,
                stale: None,
                balance_minor: 0,
            }),
        }
    }

    pub fn with_loan(config: SimulatedLedgerConfig, loan: SimulatedLoan) -> Self {
        let ledger = Self::new(config);
        ledger.seed_loan(loan);
        ledger
    }

    /// Install or replace the borrower's loan record.
    pub fn seed_loan(&self, loan: SimulatedLoan) {
        let mut state = self.state.lock().unwrap();
        state.loan = Some(loan);
        state.stale = None;
    }

    pub fn clear_loan(&self) {
        let mut state = self.state.lock().unwrap();
        state.loan = None;
        state.stale = None;
    }

    fn tx_hash() -> String {
        format!("0x{}", Uuid::new_v4().simple())
    }
}

#[async_trait]
impl LedgerClient for SimulatedLedger {
    async fn chain_id(&self) -> Result<u64, LienError> {
        Ok(self.config.chain_id)
    }

    async fn has_contract_code(&self) -> Result<bool, LienError> {
        Ok(self.config.deployed)
    }

    fn contract_address(&self) -> &str {
        &self.config.contract_address
    }

    async fn get_active_loan(&self, _borrower: &Borrower) -> Result<RawLoanRecord, LienError> {
        if let Some(delay) = self.config.read_delay {
            tokio::time::sleep(delay).await;
        }

        let now = Utc::now();
        let mut state = self.state.lock().unwrap();

        if let Some((stale_loan, remaining)) = state.stale.take() {
            let record = stale_loan.to_record(now);
            if remaining > 1 {
                state.stale = Some((stale_loan, remaining - 1));
            }
            return Ok(record);
        }

        match state.loan.as_ref() {
            Some(loan) => Ok(loan.to_record(now)),
            None => Err(LienError::TransientRevert),
        }
    }

    async fn pay_back_loan(
        &self,
        _borrower: &Borrower,
        value_minor: u64,
    ) -> Result<String, LienError> {
        let lag = self.config.settlement_lag_reads;
        let mut state = self.state.lock().unwrap();
        let Some(loan) = state.loan.clone() else {
            return Err(LienError::Ledger("no active loan for caller".to_string()));
        };

        if loan.status == LoanStatus::Paid {
            return Err(LienError::Ledger("loan already repaid".to_string()));
        }
        if value_minor < loan.principal_minor {
            return Err(LienError::InsufficientFunds(format!(
                "repayment requires {} minor units, got {}",
                loan.principal_minor, value_minor
            )));
        }
        if loan.status == LoanStatus::Defaulted && self.config.reject_defaulted_payment {
            return Err(LienError::Ledger(
                "execution reverted: loan is not payable in its current status".to_string(),
            ));
        }

        if lag > 0 {
            state.stale = Some((loan.clone(), lag));
        }
        if let Some(current) = state.loan.as_mut() {
            current.status = LoanStatus::Paid;
        }
        state.balance_minor += value_minor;
        Ok(Self::tx_hash())
    }

    async fn update_loan_status(
        &self,
        _borrower: &Borrower,
        status: LoanStatus,
    ) -> Result<String, LienError> {
        if !self.config.privileged_caller {
            return Err(LienError::Unauthorized(
                "caller lacks the operator role".to_string(),
            ));
        }

        let mut state = self.state.lock().unwrap();
        let Some(loan) = state.loan.as_mut() else {
            return Err(LienError::Ledger("no active loan for caller".to_string()));
        };
        loan.status = status;
        Ok(Self::tx_hash())
    }

    async fn get_contract_balance(&self) -> Result<u64, LienError> {
        Ok(self.state.lock().unwrap().balance_minor)
    }
}

/// Kiosk bridge for platforms without any pinning capability. Every
/// operation short-circuits to unsupported and enforcement stays
/// display-only.
#[derive(Debug, Clone, Default)]
pub struct UnsupportedKioskBridge;

#[async_trait]
impl KioskBridge for UnsupportedKioskBridge {
    fn platform_supported(&self) -> bool {
        false
    }

    fn supports(&self, _op: BridgeOp) -> bool {
        false
    }

    async fn invoke(&self, op: BridgeOp) -> Result<(), String> {
        Err(format!("{op} is not available on this platform"))
    }

    async fn is_currently_pinned(&self) -> Option<bool> {
        None
    }
}

struct ScriptedBridgeState {
    missing: HashSet<BridgeOp>,
    failing: HashSet<BridgeOp>,
    pinned: bool,
    manual_exit_allowed: bool,
    calls: Vec<BridgeOp>,
}

/// Scriptable in-memory device bridge.
///
/// Tracks the simulated pin state, records every invocation, and lets
/// callers knock out or fail individual primitives to exercise the
/// partial-availability paths.
pub struct ScriptedKioskBridge {
    state: Mutex<ScriptedBridgeState>,
}

impl Default for ScriptedKioskBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedKioskBridge {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptedBridgeState {
                missing: HashSet::new(),
                failing: HashSet::new(),
                pinned: false,
                manual_exit_allowed: true,
                calls: Vec::new(),
            }),
        }
    }

    /// Remove a primitive from the build, as an older OS would.
    pub fn without(self, op: BridgeOp) -> Self {
        self.state.lock().unwrap().missing.insert(op);
        self
    }

    /// Make a primitive present but failing.
    pub fn failing(self, op: BridgeOp) -> Self {
        self.state.lock().unwrap().failing.insert(op);
        self
    }

    /// Simulate the user un-pinning the device behind the app's back.
    pub fn externally_unpin(&self) {
        self.state.lock().unwrap().pinned = false;
    }

    pub fn pinned(&self) -> bool {
        self.state.lock().unwrap().pinned
    }

    pub fn calls(&self) -> Vec<BridgeOp> {
        self.state.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl KioskBridge for ScriptedKioskBridge {
    fn platform_supported(&self) -> bool {
        true
    }

    fn supports(&self, op: BridgeOp) -> bool {
        !self.state.lock().unwrap().missing.contains(&op)
    }

    async fn invoke(&self, op: BridgeOp) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(op);
        if state.failing.contains(&op) {
            return Err(format!("{op} rejected by the pin service"));
        }
        match op {
            BridgeOp::StartPinning => state.pinned = true,
            BridgeOp::ExitPinning => state.pinned = false,
            BridgeOp::AllowUnpinExit => state.manual_exit_allowed = true,
            BridgeOp::DenyUnpinExit => state.manual_exit_allowed = false,
            BridgeOp::NoteRecentsPressed => {}
        }
        Ok(())
    }

    async fn is_currently_pinned(&self) -> Option<bool> {
        Some(self.state.lock().unwrap().pinned)
    }
}
