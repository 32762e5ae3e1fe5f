//! Lien enforcement core.
//!
//! Locks a device into kiosk mode while its collateralized loan is overdue
//! or defaulted, and unlocks it once repayment is confirmed. Loan state is
//! observed from an external ledger; device restriction goes through a
//! best-effort capability bridge; the post-payment path forces an unlock
//! rather than leave a paying user waiting on ledger lag.

#![deny(unsafe_code)]

pub mod capability;
pub mod error;
pub mod ledger;
pub mod machine;
pub mod payment;
pub mod poller;
pub mod runtime;
pub mod types;

pub use capability::{BridgeOp, CapabilityAdapter, KioskBridge};
pub use error::LienError;
pub use ledger::{LedgerClient, RawLoanRecord};
pub use machine::KioskStateMachine;
pub use payment::{PaymentConfig, PaymentCoordinator};
pub use poller::{LoanPoller, PollerConfig};
pub use runtime::{EngineConfig, LienEngine};
pub use types::{
    Borrower, CapabilityResult, ChainProfile, EnforcementUpdate, KioskMode, LoanSnapshot,
    LoanStatus, PaymentAttempt, PaymentOutcome, PaymentReceipt,
};
