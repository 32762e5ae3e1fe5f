use crate::capability::{CapabilityAdapter, KioskBridge};
use crate::error::LienError;
use crate::ledger::LedgerClient;
use crate::machine::KioskStateMachine;
use crate::payment::{PaymentConfig, PaymentCoordinator};
use crate::poller::{LoanPoller, PollerConfig};
use crate::types::{
    Borrower, EnforcementUpdate, KioskMode, LoanSnapshot, PaymentAttempt, PaymentOutcome,
    PaymentReceipt,
};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub poller: PollerConfig,
    pub payment: PaymentConfig,
}

/// Mode owner plus the observer slot, shared between the poll loop, the
/// lifecycle surface, and the payment coordinator. All mode mutations
/// serialize through the machine lock; the watch slot carries whichever
/// poll completed last.
pub(crate) struct EnforcementState {
    machine: Mutex<KioskStateMachine>,
    updates: watch::Sender<EnforcementUpdate>,
}

impl EnforcementState {
    pub(crate) fn new(machine: KioskStateMachine) -> Self {
        let initial = EnforcementUpdate::initial(machine.display_only());
        let (updates, _) = watch::channel(initial);
        Self {
            machine: Mutex::new(machine),
            updates,
        }
    }

    pub(crate) async fn mode(&self) -> KioskMode {
        self.machine.lock().await.mode()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<EnforcementUpdate> {
        self.updates.subscribe()
    }

    pub(crate) fn latest(&self) -> EnforcementUpdate {
        self.updates.borrow().clone()
    }

    /// Apply a fresh snapshot and publish the result.
    pub(crate) async fn ingest_snapshot(&self, snapshot: LoanSnapshot) {
        let mut machine = self.machine.lock().await;
        let mode = machine.apply_snapshot(&snapshot).await;
        let display_only = machine.display_only();
        drop(machine);

        self.updates.send_replace(EnforcementUpdate {
            snapshot: Some(snapshot),
            mode,
            display_only,
            advisory: None,
            updated_at: Utc::now(),
        });
    }

    /// Record a poll failure as advisory text. Lock decisions come only
    /// from successful snapshots, so the mode never changes here.
    pub(crate) async fn ingest_error(&self, error: &LienError) {
        self.updates.send_modify(|update| {
            update.advisory = Some(error.to_string());
            update.updated_at = Utc::now();
        });
    }

    pub(crate) async fn force_unlock(&self) {
        self.machine.lock().await.force_unlock().await;
        self.updates.send_modify(|update| {
            update.mode = KioskMode::Unlocked;
            update.updated_at = Utc::now();
        });
    }

    /// Drop all loan context and release the device, e.g. after an
    /// identity disconnect.
    pub(crate) async fn reset(&self) {
        let mut machine = self.machine.lock().await;
        machine.force_unlock().await;
        let display_only = machine.display_only();
        drop(machine);
        self.updates.send_replace(EnforcementUpdate::initial(display_only));
    }
}

/// Timers owned by one connected borrower identity. Dropped (and aborted)
/// on disconnect so nothing keeps polling against a stale identity.
struct Session {
    borrower: Borrower,
    refresh_tx: mpsc::Sender<()>,
    poll_task: JoinHandle<()>,
    confirm_task: Option<JoinHandle<()>>,
}

/// The lien enforcement engine: one explicitly constructed instance per
/// device, started and stopped with the borrower identity.
///
/// The surrounding app drives lifecycle hooks and subscribes to
/// [`EnforcementUpdate`]s; no UI concern lives here.
pub struct LienEngine {
    poller: Arc<LoanPoller>,
    coordinator: Arc<PaymentCoordinator>,
    ledger: Arc<dyn LedgerClient>,
    state: Arc<EnforcementState>,
    session: Mutex<Option<Session>>,
    payment_cycle: Arc<Mutex<Option<PaymentAttempt>>>,
    in_foreground: AtomicBool,
    display_only: bool,
}

impl LienEngine {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn LedgerClient>,
        bridge: Arc<dyn KioskBridge>,
    ) -> Self {
        let adapter = CapabilityAdapter::new(bridge);
        let machine = KioskStateMachine::new(adapter);
        let display_only = machine.display_only();

        Self {
            poller: Arc::new(LoanPoller::new(ledger.clone(), config.poller)),
            coordinator: Arc::new(PaymentCoordinator::new(ledger.clone(), config.payment)),
            ledger,
            state: Arc::new(EnforcementState::new(machine)),
            session: Mutex::new(None),
            payment_cycle: Arc::new(Mutex::new(None)),
            in_foreground: AtomicBool::new(true),
            display_only,
        }
    }

    /// True when the platform carries no kiosk support; the mode is still
    /// tracked and published, display-only.
    pub fn display_only(&self) -> bool {
        self.display_only
    }

    pub async fn current_kiosk_mode(&self) -> KioskMode {
        self.state.mode().await
    }

    pub fn current_update(&self) -> EnforcementUpdate {
        self.state.latest()
    }

    pub fn subscribe(&self) -> watch::Receiver<EnforcementUpdate> {
        self.state.subscribe()
    }

    pub async fn last_payment_attempt(&self) -> Option<PaymentAttempt> {
        self.payment_cycle.lock().await.clone()
    }

    /// Informational contract balance, proxied for status surfaces.
    pub async fn contract_balance(&self) -> Result<u64, LienError> {
        self.ledger.get_contract_balance().await
    }

    /// Connect a borrower identity and start the recurring poll loop. An
    /// existing session is torn down first.
    pub async fn start(&self, borrower: Borrower) {
        self.stop().await;

        info!(borrower = %borrower.short(), "enforcement session started");
        let (refresh_tx, refresh_rx) = mpsc::channel(4);
        let poll_task = tokio::spawn(poll_loop(
            self.poller.clone(),
            self.state.clone(),
            borrower.clone(),
            refresh_rx,
        ));

        *self.session.lock().await = Some(Session {
            borrower,
            refresh_tx,
            poll_task,
            confirm_task: None,
        });
    }

    /// Disconnect: cancel every timer owned by the session, abandon a live
    /// payment cycle, and release the device.
    pub async fn stop(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        info!(borrower = %session.borrower.short(), "enforcement session stopped");

        session.poll_task.abort();
        if let Some(confirm_task) = session.confirm_task {
            if !confirm_task.is_finished() {
                confirm_task.abort();
                let mut cycle = self.payment_cycle.lock().await;
                if let Some(attempt) = cycle.as_mut() {
                    if attempt.outcome.is_none() {
                        attempt.finish(PaymentOutcome::Abandoned);
                        info!(trace_id = %attempt.trace_id, "payment confirmation abandoned");
                    }
                }
            }
        }

        self.state.reset().await;
    }

    pub async fn on_identity_changed(&self, borrower: Option<Borrower>) {
        match borrower {
            Some(borrower) => self.start(borrower).await,
            None => self.stop().await,
        }
    }

    /// Request an out-of-band poll (pull-to-refresh, post-write re-check).
    pub async fn force_refresh(&self) -> Result<(), LienError> {
        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(LienError::NotConnected);
        };
        let _ = session.refresh_tx.try_send(());
        Ok(())
    }

    /// Repay the outstanding principal and start the confirmation cycle.
    pub async fn submit_payment(&self) -> Result<PaymentReceipt, LienError> {
        let borrower = {
            let session = self.session.lock().await;
            let Some(session) = session.as_ref() else {
                return Err(LienError::NotConnected);
            };
            session.borrower.clone()
        };

        let update = self.state.latest();
        let Some(snapshot) = update.snapshot else {
            return Err(LienError::Ledger("no loan snapshot available yet".to_string()));
        };
        if !snapshot.has_obligation() {
            return Err(LienError::Ledger("no outstanding loan to repay".to_string()));
        }

        let receipt = self
            .coordinator
            .pay_with_fallback(&borrower, snapshot.principal_minor)
            .await?;
        self.on_payment_submitted().await?;
        Ok(receipt)
    }

    /// Start the post-payment confirmation loop. Callable directly when
    /// the payment was submitted outside this engine.
    pub async fn on_payment_submitted(&self) -> Result<(), LienError> {
        let mut session = self.session.lock().await;
        let Some(session) = session.as_mut() else {
            return Err(LienError::NotConnected);
        };

        if let Some(previous) = session.confirm_task.take() {
            if !previous.is_finished() {
                previous.abort();
                debug!("superseding an in-flight payment confirmation cycle");
            }
        }

        let coordinator = self.coordinator.clone();
        let poller = self.poller.clone();
        let state = self.state.clone();
        let cycle = self.payment_cycle.clone();
        let borrower = session.borrower.clone();
        session.confirm_task = Some(tokio::spawn(async move {
            coordinator.confirm(&poller, &state, &borrower, &cycle).await;
        }));

        Ok(())
    }

    /// Host hook: the app returned to the foreground. Re-asserts the lock
    /// once per background→foreground transition.
    pub async fn on_foreground(&self) {
        let was_foreground = self.in_foreground.swap(true, Ordering::SeqCst);
        if was_foreground {
            return;
        }
        self.state.machine.lock().await.on_foreground_resume().await;
    }

    /// Host hook: the app left the foreground.
    pub async fn on_background(&self) {
        self.in_foreground.store(false, Ordering::SeqCst);
    }

    /// Host hook: back/cancel gesture. Returns true when the gesture must
    /// be suppressed.
    pub async fn on_back_button(&self) -> bool {
        self.state.machine.lock().await.on_back_button()
    }
}

async fn poll_loop(
    poller: Arc<LoanPoller>,
    state: Arc<EnforcementState>,
    borrower: Borrower,
    mut refresh_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval(poller.config().interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            trigger = refresh_rx.recv() => {
                if trigger.is_none() {
                    break;
                }
                debug!(borrower = %borrower.short(), "out-of-band poll requested");
            }
        }

        match poller.poll(&borrower).await {
            Ok(snapshot) => state.ingest_snapshot(snapshot).await,
            Err(error) => {
                debug!(borrower = %borrower.short(), %error, "loan poll failed");
                state.ingest_error(&error).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::BridgeOp;
    use crate::ledger::RawLoanRecord;
    use crate::types::LoanStatus;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::time::sleep;

    struct CountingLedger {
        record: StdMutex<RawLoanRecord>,
        reads: StdMutex<u32>,
    }

    impl CountingLedger {
        fn new(record: RawLoanRecord) -> Arc<Self> {
            Arc::new(Self {
                record: StdMutex::new(record),
                reads: StdMutex::new(0),
            })
        }

        fn reads(&self) -> u32 {
            *self.reads.lock().unwrap()
        }

        fn set_record(&self, record: RawLoanRecord) {
            *self.record.lock().unwrap() = record;
        }
    }

    #[async_trait]
    impl LedgerClient for CountingLedger {
        async fn chain_id(&self) -> Result<u64, LienError> {
            Ok(10_143)
        }

        async fn has_contract_code(&self) -> Result<bool, LienError> {
            Ok(true)
        }

        fn contract_address(&self) -> &str {
            "0xfeed"
        }

        async fn get_active_loan(&self, _borrower: &Borrower) -> Result<RawLoanRecord, LienError> {
            *self.reads.lock().unwrap() += 1;
            Ok(*self.record.lock().unwrap())
        }

        async fn pay_back_loan(
            &self,
            _borrower: &Borrower,
            _value_minor: u64,
        ) -> Result<String, LienError> {
            Ok("0xtx".to_string())
        }

        async fn update_loan_status(
            &self,
            _borrower: &Borrower,
            _status: LoanStatus,
        ) -> Result<String, LienError> {
            Ok("0xstatus".to_string())
        }

        async fn get_contract_balance(&self) -> Result<u64, LienError> {
            Ok(1_000_000)
        }
    }

    struct RecordingBridge {
        calls: StdMutex<Vec<BridgeOp>>,
    }

    impl RecordingBridge {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<BridgeOp> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl KioskBridge for RecordingBridge {
        fn platform_supported(&self) -> bool {
            true
        }

        fn supports(&self, _op: BridgeOp) -> bool {
            true
        }

        async fn invoke(&self, op: BridgeOp) -> Result<(), String> {
            self.calls.lock().unwrap().push(op);
            Ok(())
        }

        async fn is_currently_pinned(&self) -> Option<bool> {
            None
        }
    }

    fn overdue() -> RawLoanRecord {
        RawLoanRecord {
            amount_minor: 500,
            max_payment_date: 1_736_100_000,
            status_code: 1,
            created_at: 1_735_000_000,
            is_overdue: true,
        }
    }

    fn paid() -> RawLoanRecord {
        RawLoanRecord {
            status_code: 2,
            ..overdue()
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            payment: PaymentConfig {
                confirm_interval: Duration::from_millis(5),
                ..PaymentConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn engine(ledger: Arc<CountingLedger>, bridge: Arc<RecordingBridge>) -> LienEngine {
        LienEngine::new(fast_config(), ledger, bridge)
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn start_polls_immediately_and_locks_on_delinquency() {
        let ledger = CountingLedger::new(overdue());
        let engine = engine(ledger.clone(), RecordingBridge::new());

        engine.start(Borrower::new("0xabc")).await;
        settle().await;

        assert!(ledger.reads() >= 1);
        assert_eq!(engine.current_kiosk_mode().await, KioskMode::Locked);
        assert!(engine.on_back_button().await);
        let update = engine.current_update();
        assert_eq!(update.snapshot.unwrap().principal_minor, 500);
    }

    #[tokio::test]
    async fn force_refresh_triggers_an_extra_poll() {
        let ledger = CountingLedger::new(paid());
        let engine = engine(ledger.clone(), RecordingBridge::new());

        engine.start(Borrower::new("0xabc")).await;
        settle().await;
        let before = ledger.reads();

        engine.force_refresh().await.unwrap();
        settle().await;

        assert!(ledger.reads() > before);
    }

    #[tokio::test]
    async fn force_refresh_requires_a_session() {
        let ledger = CountingLedger::new(paid());
        let engine = engine(ledger, RecordingBridge::new());

        let err = engine.force_refresh().await.unwrap_err();
        assert!(matches!(err, LienError::NotConnected));
    }

    #[tokio::test]
    async fn stop_halts_polling_and_releases_the_device() {
        let ledger = CountingLedger::new(overdue());
        let engine = engine(ledger.clone(), RecordingBridge::new());

        engine.start(Borrower::new("0xabc")).await;
        settle().await;
        assert_eq!(engine.current_kiosk_mode().await, KioskMode::Locked);

        engine.on_identity_changed(None).await;
        let after_stop = ledger.reads();
        settle().await;

        assert_eq!(ledger.reads(), after_stop);
        assert_eq!(engine.current_kiosk_mode().await, KioskMode::Unlocked);
        assert!(engine.current_update().snapshot.is_none());
    }

    #[tokio::test]
    async fn submitted_payment_forces_unlock_despite_stale_ledger() {
        let ledger = CountingLedger::new(RawLoanRecord {
            status_code: 3,
            ..overdue()
        });
        let engine = engine(ledger.clone(), RecordingBridge::new());

        engine.start(Borrower::new("0xabc")).await;
        settle().await;
        assert_eq!(engine.current_kiosk_mode().await, KioskMode::Locked);

        // The ledger keeps reporting the defaulted loan for the whole cycle.
        let receipt = engine.submit_payment().await.unwrap();
        assert!(!receipt.via_status_correction);
        sleep(Duration::from_millis(150)).await;

        assert_eq!(engine.current_kiosk_mode().await, KioskMode::Unlocked);
        let attempt = engine.last_payment_attempt().await.unwrap();
        assert_eq!(attempt.outcome, Some(PaymentOutcome::ForcedUnlock));
        assert_eq!(attempt.polls, 15);
    }

    #[tokio::test]
    async fn confirmation_confirms_once_the_ledger_reflects_repayment() {
        let ledger = CountingLedger::new(overdue());
        let engine = engine(ledger.clone(), RecordingBridge::new());

        engine.start(Borrower::new("0xabc")).await;
        settle().await;

        let _receipt = engine.submit_payment().await.unwrap();
        ledger.set_record(paid());
        sleep(Duration::from_millis(80)).await;

        let attempt = engine.last_payment_attempt().await.unwrap();
        assert_eq!(attempt.outcome, Some(PaymentOutcome::Confirmed));
        assert_eq!(engine.current_kiosk_mode().await, KioskMode::Unlocked);
    }

    #[tokio::test]
    async fn payment_requires_a_snapshot_with_an_obligation() {
        let ledger = CountingLedger::new(RawLoanRecord {
            amount_minor: 0,
            status_code: 0,
            ..overdue()
        });
        let engine = engine(ledger, RecordingBridge::new());

        engine.start(Borrower::new("0xabc")).await;
        settle().await;

        let err = engine.submit_payment().await.unwrap_err();
        assert!(err.to_string().contains("no outstanding loan"));
    }

    #[tokio::test]
    async fn foreground_reasserts_once_per_transition() {
        let ledger = CountingLedger::new(overdue());
        let bridge = RecordingBridge::new();
        let engine = engine(ledger, bridge.clone());

        engine.start(Borrower::new("0xabc")).await;
        settle().await;
        let before = bridge.calls().len();

        engine.on_background().await;
        engine.on_foreground().await;
        // A second resume without an intervening background is a no-op.
        engine.on_foreground().await;

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
    async fn stop_abandons_a_live_confirmation_cycle() {
        let ledger = CountingLedger::new(RawLoanRecord {
            status_code: 3,
            ..overdue()
        });
        let engine = LienEngine::new(
            EngineConfig {
                payment: PaymentConfig {
                    confirm_interval: Duration::from_millis(50),
                    ..PaymentConfig::default()
                },
                ..EngineConfig::default()
            },
            ledger.clone(),
            RecordingBridge::new(),
        );

        engine.start(Borrower::new("0xabc")).await;
        settle().await;
        engine.submit_payment().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        engine.stop().await;

        let attempt = engine.last_payment_attempt().await.unwrap();
        assert_eq!(attempt.outcome, Some(PaymentOutcome::Abandoned));
    }
}
