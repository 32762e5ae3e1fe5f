use crate::types::CapabilityResult;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Native kiosk primitives, mirroring the platform module surface.
///
/// Individual functions may be absent depending on OS and build; callers
/// must feature-detect through [`KioskBridge::supports`] before invoking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BridgeOp {
    /// Pin the app to the foreground.
    StartPinning,
    /// Release the pin.
    ExitPinning,
    /// Permit the user's manual unpin gesture.
    AllowUnpinExit,
    /// Block the user's manual unpin gesture.
    DenyUnpinExit,
    /// Acknowledge the recents-button press after a foreground resume.
    NoteRecentsPressed,
}

impl BridgeOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::StartPinning => "start_pinning",
            Self::ExitPinning => "exit_pinning",
            Self::AllowUnpinExit => "allow_unpin_exit",
            Self::DenyUnpinExit => "deny_unpin_exit",
            Self::NoteRecentsPressed => "note_recents_pressed",
        }
    }
}

impl fmt::Display for BridgeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw platform surface for device pinning.
///
/// Implementations report capability per primitive rather than raising on
/// missing functions; the adapter turns absence into `Unsupported`.
#[async_trait]
pub trait KioskBridge: Send + Sync {
    /// True when this platform build carries any kiosk support at all.
    fn platform_supported(&self) -> bool;

    /// Whether a specific primitive is callable in this build.
    fn supports(&self, op: BridgeOp) -> bool;

    /// Invoke a primitive. Callers must check `supports` first.
    async fn invoke(&self, op: BridgeOp) -> Result<(), String>;

    /// Best-effort probe of the OS pin state. `None` when the platform
    /// cannot say.
    async fn is_currently_pinned(&self) -> Option<bool>;
}

/// Best-effort wrapper over the native bridge.
///
/// Every operation returns a [`CapabilityResult`] and never an `Err`: a
/// missing primitive yields `Unsupported` and the remaining best-effort
/// steps still run. The state machine treats all outcomes as advisory.
#[derive(Clone)]
pub struct CapabilityAdapter {
    bridge: Arc<dyn KioskBridge>,
}

impl CapabilityAdapter {
    pub fn new(bridge: Arc<dyn KioskBridge>) -> Self {
        Self { bridge }
    }

    pub fn platform_supported(&self) -> bool {
        self.bridge.platform_supported()
    }

    /// Pin the app to the foreground.
    pub async fn lock(&self) -> CapabilityResult {
        self.attempt(BridgeOp::StartPinning).await
    }

    /// Release the pin, with an ordered fallback chain: direct exit first,
    /// then allow-manual-exit followed by one exit retry. Only total
    /// failure across the chain surfaces as `Failed`.
    pub async fn unlock(&self) -> CapabilityResult {
        let direct = self.attempt(BridgeOp::ExitPinning).await;
        if direct.succeeded() {
            return direct;
        }
        debug!(result = ?direct, "direct exit unsuccessful, trying manual-exit fallback");

        let allow = self.attempt(BridgeOp::AllowUnpinExit).await;
        let retry = self.attempt(BridgeOp::ExitPinning).await;
        if retry.succeeded() || allow.succeeded() {
            // The pin is released, or the user can now release it manually.
            return CapabilityResult::Succeeded;
        }

        if direct.unsupported() && allow.unsupported() && retry.unsupported() {
            return CapabilityResult::Unsupported;
        }

        let reason = format!(
            "exit: {}; allow-exit: {}; exit retry: {}",
            describe(&direct),
            describe(&allow),
            describe(&retry)
        );
        warn!(%reason, "all unlock attempts failed");
        CapabilityResult::Failed(reason)
    }

    pub async fn allow_manual_exit(&self) -> CapabilityResult {
        self.attempt(BridgeOp::AllowUnpinExit).await
    }

    pub async fn deny_manual_exit(&self) -> CapabilityResult {
        self.attempt(BridgeOp::DenyUnpinExit).await
    }

    /// Forward the platform's recents-button acknowledgement. Outcome is
    /// log-only.
    pub async fn note_foreground_resume(&self) {
        let result = self.attempt(BridgeOp::NoteRecentsPressed).await;
        debug!(?result, "foreground resume acknowledged");
    }

    /// Probe the OS pin state. `None` when the platform cannot say.
    pub async fn probe_pinned(&self) -> Option<bool> {
        if !self.bridge.platform_supported() {
            return None;
        }
        self.bridge.is_currently_pinned().await
    }

    async fn attempt(&self, op: BridgeOp) -> CapabilityResult {
        if !self.bridge.platform_supported() {
            return CapabilityResult::Unsupported;
        }
        if !self.bridge.supports(op) {
            debug!(%op, "kiosk primitive not available in this build");
            return CapabilityResult::Unsupported;
        }
        match self.bridge.invoke(op).await {
            Ok(()) => CapabilityResult::Succeeded,
            Err(reason) => {
                warn!(%op, %reason, "kiosk primitive call failed");
                CapabilityResult::Failed(reason)
            }
        }
    }
}

fn describe(result: &CapabilityResult) -> String {
    match result {
        CapabilityResult::Succeeded => "succeeded".to_string(),
        CapabilityResult::Unsupported => "unsupported".to_string(),
        CapabilityResult::Failed(reason) => reason.clone(),
    }
}
