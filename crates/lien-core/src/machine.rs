use crate::capability::CapabilityAdapter;
use crate::types::{CapabilityResult, KioskMode, LoanSnapshot};
use tracing::{debug, info, warn};

/// Authoritative owner of the device's logical [`KioskMode`].
///
/// The capability action is re-applied on every snapshot, including ones
/// that reconfirm the current state, because the OS pin can be revoked
/// externally without the logical state changing.
/// Capability failures never change the logical mode; the desired state is
/// policy and is retried on the next trigger.
pub struct KioskStateMachine {
    adapter: CapabilityAdapter,
    mode: KioskMode,
    display_only: bool,
    locking_snapshot: Option<LoanSnapshot>,
}

impl KioskStateMachine {
    pub fn new(adapter: CapabilityAdapter) -> Self {
        let display_only = !adapter.platform_supported();
        if display_only {
            info!("no kiosk support on this platform, enforcement is display-only");
        }
        Self {
            adapter,
            mode: KioskMode::Unlocked,
            display_only,
            locking_snapshot: None,
        }
    }

    pub fn mode(&self) -> KioskMode {
        self.mode
    }

    /// True when the platform cannot restrict the device and the mode is
    /// tracked for display only.
    pub fn display_only(&self) -> bool {
        self.display_only
    }

    /// The snapshot that drove the current Locked mode, for status surfaces.
    pub fn locking_snapshot(&self) -> Option<&LoanSnapshot> {
        self.locking_snapshot.as_ref()
    }

    /// Derive the target mode from a fresh snapshot and re-apply the
    /// corresponding device action.
    pub async fn apply_snapshot(&mut self, snapshot: &LoanSnapshot) -> KioskMode {
        let target = KioskMode::for_snapshot(snapshot);
        if target != self.mode {
            info!(
                from = %self.mode,
                to = %target,
                status = %snapshot.status,
                principal_minor = snapshot.principal_minor,
                "kiosk mode transition"
            );
        } else {
            debug!(mode = %target, "re-asserting kiosk mode");
        }
        self.mode = target;

        match target {
            KioskMode::Locked => {
                self.locking_snapshot = Some(snapshot.clone());
                self.assert_locked().await;
            }
            KioskMode::Unlocked => {
                self.locking_snapshot = None;
                let result = self.adapter.unlock().await;
                log_outcome("unlock", &result);
            }
        }

        self.mode
    }

    /// Unlock without waiting for ledger confirmation. Issued by the
    /// payment coordinator to bound user-facing latency.
    pub async fn force_unlock(&mut self) {
        if self.mode == KioskMode::Locked {
            info!("forcing unlock ahead of ledger confirmation");
        }
        self.mode = KioskMode::Unlocked;
        self.locking_snapshot = None;
        let result = self.adapter.unlock().await;
        log_outcome("forced unlock", &result);
    }

    /// Re-assert the lock after an app-foreground transition. Counters a
    /// user backgrounding the app to escape restriction. Returns true when
    /// a re-assert was performed.
    pub async fn on_foreground_resume(&mut self) -> bool {
        if self.mode != KioskMode::Locked {
            return false;
        }
        self.adapter.note_foreground_resume().await;
        if let Some(pinned) = self.adapter.probe_pinned().await {
            if !pinned {
                warn!("device was unpinned externally, re-pinning");
            }
        }
        self.assert_locked().await;
        true
    }

    /// Back/cancel gesture handling: suppressed while Locked.
    pub fn on_back_button(&self) -> bool {
        self.mode == KioskMode::Locked
    }

    async fn assert_locked(&self) {
        let lock = self.adapter.lock().await;
        log_outcome("lock", &lock);
        let deny = self.adapter.deny_manual_exit().await;
        log_outcome("deny manual exit", &deny);
    }
}

fn log_outcome(action: &str, result: &CapabilityResult) {
    match result {
        CapabilityResult::Succeeded => debug!(action, "capability action applied"),
        CapabilityResult::Unsupported => debug!(action, "capability action unsupported"),
        CapabilityResult::Failed(reason) => {
            warn!(action, %reason, "capability action failed, will retry on next trigger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{BridgeOp, KioskBridge};
    use crate::types::LoanStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    struct RecordingBridge {
        platform: bool,
        failing: bool,
        pinned: Mutex<bool>,
        calls: Mutex<Vec<BridgeOp>>,
    }

    impl RecordingBridge {
        fn supported() -> Arc<Self> {
            Arc::new(Self {
                platform: true,
                failing: false,
                pinned: Mutex::new(false),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn unsupported() -> Arc<Self> {
            Arc::new(Self {
                platform: false,
                failing: false,
                pinned: Mutex::new(false),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                platform: true,
                failing: true,
                pinned: Mutex::new(false),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<BridgeOp> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl KioskBridge for RecordingBridge {
        fn platform_supported(&self) -> bool {
            self.platform
        }

        fn supports(&self, _op: BridgeOp) -> bool {
            true
        }

        async fn invoke(&self, op: BridgeOp) -> Result<(), String> {
            self.calls.lock().unwrap().push(op);
            if self.failing {
                return Err("pin service unavailable".to_string());
            }
            let mut pinned = self.pinned.lock().unwrap();
            match op {
                BridgeOp::StartPinning => *pinned = true,
                BridgeOp::ExitPinning => *pinned = false,
                _ => {}
            }
            Ok(())
        }

        async fn is_currently_pinned(&self) -> Option<bool> {
            Some(*self.pinned.lock().unwrap())
        }
    }

    fn snapshot(principal_minor: u64, status: LoanStatus) -> LoanSnapshot {
        LoanSnapshot {
            principal_minor,
            due_at: Utc::now(),
            status,
            created_at: Utc::now(),
            ledger_overdue: status == LoanStatus::Overdue,
            fetched_at: Utc::now(),
        }
    }

    fn machine(bridge: Arc<RecordingBridge>) -> KioskStateMachine {
        KioskStateMachine::new(CapabilityAdapter::new(bridge))
    }

    #[tokio::test]
    async fn overdue_loan_locks_and_suppresses_back_button() {
        let bridge = RecordingBridge::supported();
        let mut machine = machine(bridge.clone());

        let mode = machine.apply_snapshot(&snapshot(500, LoanStatus::Overdue)).await;

        assert_eq!(mode, KioskMode::Locked);
        assert!(machine.on_back_button());
        assert_eq!(
            bridge.calls(),
            vec![BridgeOp::StartPinning, BridgeOp::DenyUnpinExit]
        );
        assert_eq!(machine.locking_snapshot().unwrap().principal_minor, 500);
    }

    #[tokio::test]
    async fn reapplying_the_same_snapshot_reinvokes_the_capability() {
        let bridge = RecordingBridge::supported();
        let mut machine = machine(bridge.clone());
        let overdue = snapshot(500, LoanStatus::Defaulted);

        machine.apply_snapshot(&overdue).await;
        machine.apply_snapshot(&overdue).await;

        assert_eq!(
            bridge.calls(),
            vec![
                BridgeOp::StartPinning,
                BridgeOp::DenyUnpinExit,
                BridgeOp::StartPinning,
                BridgeOp::DenyUnpinExit,
            ]
        );
        assert_eq!(machine.mode(), KioskMode::Locked);
    }

    #[tokio::test]
    async fn non_delinquent_snapshots_unlock() {
        let bridge = RecordingBridge::supported();
        let mut machine = machine(bridge.clone());

        machine.apply_snapshot(&snapshot(500, LoanStatus::Overdue)).await;
        let mode = machine.apply_snapshot(&snapshot(500, LoanStatus::Paid)).await;

        assert_eq!(mode, KioskMode::Unlocked);
        assert!(!machine.on_back_button());
        assert!(machine.locking_snapshot().is_none());
        assert_eq!(bridge.calls().last(), Some(&BridgeOp::ExitPinning));
    }

    #[tokio::test]
    async fn zero_principal_unlocks_regardless_of_status() {
        let bridge = RecordingBridge::supported();
        let mut machine = machine(bridge);

        let mode = machine.apply_snapshot(&snapshot(0, LoanStatus::Active)).await;

        assert_eq!(mode, KioskMode::Unlocked);
    }

    #[tokio::test]
    async fn capability_failures_do_not_change_logical_mode() {
        let bridge = RecordingBridge::failing();
        let mut machine = machine(bridge);

        let mode = machine.apply_snapshot(&snapshot(500, LoanStatus::Overdue)).await;

        assert_eq!(mode, KioskMode::Locked);
        assert!(machine.on_back_button());
    }

    #[tokio::test]
    async fn unsupported_platform_tracks_mode_without_device_calls() {
        let bridge = RecordingBridge::unsupported();
        let mut machine = machine(bridge.clone());

        let mode = machine.apply_snapshot(&snapshot(500, LoanStatus::Defaulted)).await;

        assert_eq!(mode, KioskMode::Locked);
        assert!(machine.display_only());
        assert!(bridge.calls().is_empty());
        assert_eq!(machine.locking_snapshot().unwrap().status, LoanStatus::Defaulted);
    }

    #[tokio::test]
    async fn foreground_resume_reasserts_lock_exactly_once() {
        let bridge = RecordingBridge::supported();
        let mut machine = machine(bridge.clone());
        machine.apply_snapshot(&snapshot(500, LoanStatus::Overdue)).await;
        let before = bridge.calls().len();

        assert!(machine.on_foreground_resume().await);

        let after = bridge.calls();
        assert_eq!(
            &after[before..],
            &[
                BridgeOp::NoteRecentsPressed,
                BridgeOp::StartPinning,
                BridgeOp::DenyUnpinExit,
            ]
        );
    }

    #[tokio::test]
    async fn foreground_resume_is_a_no_op_while_unlocked() {
        let bridge = RecordingBridge::supported();
        let mut machine = machine(bridge.clone());

        assert!(!machine.on_foreground_resume().await);
        assert!(bridge.calls().is_empty());
    }

    #[tokio::test]
    async fn force_unlock_clears_mode_and_snapshot() {
        let bridge = RecordingBridge::supported();
        let mut machine = machine(bridge.clone());
        machine.apply_snapshot(&snapshot(500, LoanStatus::Defaulted)).await;

        machine.force_unlock().await;

        assert_eq!(machine.mode(), KioskMode::Unlocked);
        assert!(machine.locking_snapshot().is_none());
        assert_eq!(bridge.calls().last(), Some(&BridgeOp::ExitPinning));
    }
}
