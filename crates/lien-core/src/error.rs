use thiserror::Error;

/// Lien enforcement runtime errors.
///
/// Nothing here is fatal: pollers surface these as advisory, capability
/// failures are absorbed into best-effort results, and payment failures are
/// shown to the user with guidance. No path may leave the device locked
/// without a retry route.
#[derive(Debug, Error)]
pub enum LienError {
    #[error("ledger call timed out after {0}s")]
    NetworkTimeout(u64),

    #[error("wrong network: expected chain {expected}, connected to {actual}")]
    WrongNetwork { expected: u64, actual: u64 },

    #[error("no contract code deployed at '{0}'")]
    ContractNotFound(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Read reverted with no decodable reason. An empty loan record is
    /// expected for accounts without a loan; the poller converts this into
    /// the empty snapshot instead of propagating it.
    #[error("ledger call reverted without a decodable reason")]
    TransientRevert,

    #[error("kiosk capability '{operation}' failed: {reason}")]
    CapabilityFailed { operation: String, reason: String },

    #[error("kiosk capability '{0}' is not supported on this platform")]
    CapabilityUnsupported(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("no borrower identity connected")]
    NotConnected,
}

impl LienError {
    /// Actionable text shown to the user when a payment fails.
    pub fn user_guidance(&self) -> String {
        match self {
            Self::InsufficientFunds(_) => {
                "Insufficient funds. The full loan amount plus gas fees is \
                 required to complete the payment."
                    .to_string()
            }
            Self::Unauthorized(_) => {
                "Not authorized to update the loan status. Contact the loan \
                 administrator for assistance."
                    .to_string()
            }
            Self::TransientRevert | Self::Ledger(_) => {
                "The loan contract rejected the payment. Contact the loan \
                 administrator to reset the loan to a payable status, then \
                 retry. The device remains restricted until the payment is \
                 processed."
                    .to_string()
            }
            Self::NetworkTimeout(_) => {
                "Network timeout. Check the connection to the loan network \
                 and try again."
                    .to_string()
            }
            Self::WrongNetwork { expected, .. } => {
                format!("Wrong network. Switch to chain id {expected} and try again.")
            }
            other => format!("Payment failed: {other}. Contact support if this persists."),
        }
    }
}
