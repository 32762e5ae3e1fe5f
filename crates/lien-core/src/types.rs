use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// On-ledger lifecycle states for a device-collateralized loan.
///
/// Wire codes 0..=3 follow the loan contract's status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Active,
    Overdue,
    Paid,
    Defaulted,
}

impl LoanStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Active),
            1 => Some(Self::Overdue),
            2 => Some(Self::Paid),
            3 => Some(Self::Defaulted),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Overdue => 1,
            Self::Paid => 2,
            Self::Defaulted => 3,
        }
    }

    /// Delinquent states that trigger device restriction when principal remains.
    pub fn is_delinquent(self) -> bool {
        matches!(self, Self::Overdue | Self::Defaulted)
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Overdue => "overdue",
            Self::Paid => "paid",
            Self::Defaulted => "defaulted",
        };
        f.write_str(name)
    }
}

/// Chain identity whose loan is enforced on this device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Borrower(String);

impl Borrower {
    pub fn new(account: impl Into<String>) -> Self {
        Self(account.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs and status displays.
    pub fn short(&self) -> String {
        if self.0.len() <= 14 {
            return self.0.clone();
        }
        format!("{}...{}", &self.0[..8], &self.0[self.0.len() - 6..])
    }
}

impl fmt::Display for Borrower {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One immutable read of the borrower's loan record.
///
/// Snapshots are created fresh per poll and wholly superseded by the next
/// poll; there are no merge semantics. `principal_minor == 0` means no
/// enforceable obligation regardless of `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanSnapshot {
    /// Outstanding principal in the smallest currency unit.
    pub principal_minor: u64,
    pub due_at: DateTime<Utc>,
    pub status: LoanStatus,
    pub created_at: DateTime<Utc>,
    /// Ledger-computed `now > due_at while unpaid`; may transiently disagree
    /// with `status`.
    pub ledger_overdue: bool,
    pub fetched_at: DateTime<Utc>,
}

impl LoanSnapshot {
    /// Snapshot for an account with no loan on record. Mirrors the
    /// contract's zero-value struct, which decodes as status code 0.
    pub fn empty(fetched_at: DateTime<Utc>) -> Self {
        Self {
            principal_minor: 0,
            due_at: DateTime::<Utc>::UNIX_EPOCH,
            status: LoanStatus::Active,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            ledger_overdue: false,
            fetched_at,
        }
    }

    pub fn has_obligation(&self) -> bool {
        self.principal_minor > 0
    }

    /// Whether this snapshot demands device restriction.
    pub fn requires_lock(&self) -> bool {
        self.has_obligation() && self.status.is_delinquent()
    }
}

/// Desired device restriction level. Owned exclusively by the kiosk state
/// machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KioskMode {
    Unlocked,
    Locked,
}

impl KioskMode {
    pub fn for_snapshot(snapshot: &LoanSnapshot) -> Self {
        if snapshot.requires_lock() {
            Self::Locked
        } else {
            Self::Unlocked
        }
    }
}

impl fmt::Display for KioskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocked => f.write_str("unlocked"),
            Self::Locked => f.write_str("locked"),
        }
    }
}

/// Outcome of a single native capability call. Reduced to best-effort
/// signal; never escalated as a hard failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum CapabilityResult {
    Succeeded,
    Unsupported,
    Failed(String),
}

impl CapabilityResult {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn unsupported(&self) -> bool {
        matches!(self, Self::Unsupported)
    }
}

/// Network profile the poller validates every read against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProfile {
    pub chain_id: u64,
    pub name: String,
}

impl Default for ChainProfile {
    fn default() -> Self {
        // The loan contract's original deployment network.
        Self {
            chain_id: 10_143,
            name: "Monad Testnet".to_string(),
        }
    }
}

/// Terminal outcome of one payment confirmation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// A polled snapshot confirmed the loan no longer demands a lock.
    Confirmed,
    /// The bounded loop ended with the ledger still reporting delinquency;
    /// the device was unlocked anyway.
    ForcedUnlock,
    /// The cycle was cancelled before reaching a terminal poll.
    Abandoned,
}

/// Transient bookkeeping for a single payment confirmation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub polls: u32,
    pub outcome: Option<PaymentOutcome>,
}

impl PaymentAttempt {
    pub fn begin() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            polls: 0,
            outcome: None,
        }
    }

    pub fn finish(&mut self, outcome: PaymentOutcome) {
        self.outcome = Some(outcome);
    }
}

/// Receipt for a payment transaction accepted by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub tx_hash: String,
    pub amount_minor: u64,
    /// True when the status-correcting fallback path produced the payment.
    pub via_status_correction: bool,
    pub submitted_at: DateTime<Utc>,
}

/// Last completed poll outcome, published to observers.
///
/// Advisory errors never change `mode`; lock decisions come only from
/// successful snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcementUpdate {
    pub snapshot: Option<LoanSnapshot>,
    pub mode: KioskMode,
    /// True when the platform carries no kiosk support and enforcement is
    /// display-only.
    pub display_only: bool,
    pub advisory: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl EnforcementUpdate {
    pub fn initial(display_only: bool) -> Self {
        Self {
            snapshot: None,
            mode: KioskMode::Unlocked,
            display_only,
            advisory: None,
            updated_at: Utc::now(),
        }
    }
}
