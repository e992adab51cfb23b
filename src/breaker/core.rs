//! State machine internals shared by every handle to one breaker.
//!
//! `BreakerCore` owns the mutex-guarded state cell (state, failure count,
//! half-open trial slot, pending reset timer), the legal transitions, and the
//! transition side effects: handler invocation and state-change publication.
//! It is deliberately free of the guarded result type, so reset timers and
//! handlers never depend on what the breaker produces.
//!
//! All state mutation happens inside a single critical section per breaker.
//! Two callers racing on the threshold-crossing failure take the lock in some
//! order, and only the one that moves the count to the threshold performs the
//! open transition — the other observes an already-open circuit.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::CircuitState;
use crate::{
    config::CircuitBreakerConfig,
    notify::{NotificationPublisher, StateChange},
};

/// Callback invoked at a state transition.
pub(crate) type Handler = Arc<dyn Fn() + Send + Sync + 'static>;

/// Outcome of asking the breaker whether a call may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Run the operation. `trial` marks the single half-open probe.
    Admitted {
        /// Whether this call holds the half-open trial slot.
        trial: bool,
    },
    /// Fail fast without invoking the operation.
    Rejected,
}

/// Transition that just happened, driving handlers and notification.
#[derive(Debug, Clone, Copy)]
enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

/// Mutable breaker state. Only ever touched under the cell mutex, which is
/// never held across an `.await`.
struct StateCell {
    state: CircuitState,
    failures: u32,
    /// Bumped on every transition (and on shutdown). A scheduled reset timer
    /// remembers the episode it was armed in and becomes a no-op once the
    /// episode moves on, so cancel-vs-fire races resolve to exactly one
    /// winner.
    episode: u64,
    trial_in_flight: bool,
    reset_timer: Option<JoinHandle<()>>,
}

/// Shared core of one named breaker.
pub(crate) struct BreakerCore {
    name: String,
    config: CircuitBreakerConfig,
    cell: Mutex<StateCell>,
    open_handlers: RwLock<Vec<Handler>>,
    half_open_handlers: RwLock<Vec<Handler>>,
    close_handlers: RwLock<Vec<Handler>>,
    publisher: Option<Arc<dyn NotificationPublisher>>,
}

impl fmt::Debug for BreakerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerCore")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failures", &self.failure_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BreakerCore {
    pub(crate) fn new(
        name: String,
        config: CircuitBreakerConfig,
        publisher: Option<Arc<dyn NotificationPublisher>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            config,
            cell: Mutex::new(StateCell {
                state: CircuitState::Closed,
                failures: 0,
                episode: 0,
                trial_in_flight: false,
                reset_timer: None,
            }),
            open_handlers: RwLock::new(Vec::new()),
            half_open_handlers: RwLock::new(Vec::new()),
            close_handlers: RwLock::new(Vec::new()),
            publisher,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.lock_cell().state
    }

    pub(crate) fn failure_count(&self) -> u32 {
        self.lock_cell().failures
    }

    /// Locks the state cell, recovering from a poisoned mutex. The cell only
    /// holds plain data, so a panic elsewhere cannot leave it inconsistent.
    fn lock_cell(&self) -> MutexGuard<'_, StateCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides whether a call may run right now.
    ///
    /// Closed admits everyone; open rejects everyone; half-open admits
    /// exactly one trial per episode and rejects the rest. Acquiring the
    /// trial slot and reading the state are one atomic step.
    pub(crate) fn admit(&self) -> Admission {
        let mut cell = self.lock_cell();
        match cell.state {
            CircuitState::Closed => Admission::Admitted { trial: false },
            CircuitState::Open => Admission::Rejected,
            CircuitState::HalfOpen => {
                if cell.trial_in_flight {
                    Admission::Rejected
                } else {
                    cell.trial_in_flight = true;
                    Admission::Admitted { trial: true }
                }
            }
        }
    }

    /// Records a successful outcome of an admitted call.
    ///
    /// A closed-state success resets the failure count. A successful trial
    /// closes the circuit. A success arriving after the circuit moved on
    /// (opened by other callers while this one was in flight) is stale and
    /// ignored; the count belongs to the open episode now.
    pub(crate) fn record_success(self: &Arc<Self>, trial: bool) {
        let transition = {
            let mut cell = self.lock_cell();
            if trial && cell.state == CircuitState::HalfOpen {
                cell.trial_in_flight = false;
                Some(self.transition_to_closed(&mut cell))
            } else {
                if cell.state == CircuitState::Closed {
                    cell.failures = 0;
                }
                None
            }
        };
        if let Some((transition, failures)) = transition {
            self.after_transition(transition, failures);
        }
    }

    /// Records a qualifying failure of an admitted call.
    ///
    /// A failing trial reopens the circuit. A closed-state failure bumps the
    /// count and opens the circuit exactly when the count reaches the
    /// threshold. A failure arriving after the circuit already opened is
    /// stale: it neither bumps the count nor schedules a second reset timer.
    pub(crate) fn record_failure(self: &Arc<Self>, trial: bool) {
        let transition = {
            let mut cell = self.lock_cell();
            if trial && cell.state == CircuitState::HalfOpen {
                cell.trial_in_flight = false;
                Some(self.transition_to_open(&mut cell))
            } else if cell.state == CircuitState::Closed {
                cell.failures = cell.failures.saturating_add(1).min(self.config.max_failures);
                if cell.failures >= self.config.max_failures {
                    Some(self.transition_to_open(&mut cell))
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some((transition, failures)) = transition {
            self.after_transition(transition, failures);
        }
    }

    /// Returns the half-open trial slot without recording an outcome.
    ///
    /// Used when an admitted trial call is abandoned before classification
    /// (its future was dropped), so the next caller can probe instead of the
    /// breaker wedging in half-open.
    pub(crate) fn release_trial(&self) {
        let mut cell = self.lock_cell();
        if cell.state == CircuitState::HalfOpen {
            cell.trial_in_flight = false;
        }
    }

    /// Trips the circuit open regardless of the failure count.
    pub(crate) fn trip(self: &Arc<Self>) {
        let transition = {
            let mut cell = self.lock_cell();
            (cell.state != CircuitState::Open).then(|| self.transition_to_open(&mut cell))
        };
        if let Some((transition, failures)) = transition {
            self.after_transition(transition, failures);
        }
    }

    /// Forces the circuit closed and zeroes the failure count.
    pub(crate) fn force_reset(self: &Arc<Self>) {
        let transition = {
            let mut cell = self.lock_cell();
            if cell.state == CircuitState::Closed {
                cell.failures = 0;
                None
            } else {
                Some(self.transition_to_closed(&mut cell))
            }
        };
        if let Some((transition, failures)) = transition {
            self.after_transition(transition, failures);
        }
    }

    /// Disarms any pending reset timer so a runtime can shut down cleanly.
    ///
    /// The state is left as-is; in-flight timer callbacks become stale via
    /// the episode bump. Idempotent.
    pub(crate) fn shutdown(&self) {
        let mut cell = self.lock_cell();
        cell.episode += 1;
        if let Some(timer) = cell.reset_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn register_open_handler(&self, handler: Handler) {
        self.open_handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    pub(crate) fn register_half_open_handler(&self, handler: Handler) {
        self.half_open_handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    pub(crate) fn register_close_handler(&self, handler: Handler) {
        self.close_handlers.write().unwrap_or_else(PoisonError::into_inner).push(handler);
    }

    /// Moves the cell to open: cancels any stray timer, starts a new episode,
    /// arms the reset timer. Caller must already hold the cell lock.
    fn transition_to_open(self: &Arc<Self>, cell: &mut StateCell) -> (Transition, u32) {
        cell.state = CircuitState::Open;
        cell.trial_in_flight = false;
        cell.episode += 1;
        if let Some(timer) = cell.reset_timer.take() {
            timer.abort();
        }
        self.arm_reset_timer(cell);
        (Transition::Opened, cell.failures)
    }

    /// Moves the cell to closed with a clean slate. Caller must already hold
    /// the cell lock.
    fn transition_to_closed(self: &Arc<Self>, cell: &mut StateCell) -> (Transition, u32) {
        cell.state = CircuitState::Closed;
        cell.failures = 0;
        cell.trial_in_flight = false;
        cell.episode += 1;
        if let Some(timer) = cell.reset_timer.take() {
            timer.abort();
        }
        (Transition::Closed, 0)
    }

    /// Arms the reset timer for the episode the cell is currently in.
    /// With `reset_timeout: None` the circuit stays open until a manual
    /// reset.
    fn arm_reset_timer(self: &Arc<Self>, cell: &mut StateCell) {
        let Some(delay) = self.config.reset_timeout else {
            return;
        };
        let weak = Arc::downgrade(self);
        let armed_episode = cell.episode;
        cell.reset_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(core) = weak.upgrade() {
                core.probe_half_open(armed_episode);
            }
        }));
    }

    /// Reset timer callback: move open to half-open, unless the episode
    /// moved on since the timer was armed.
    fn probe_half_open(self: &Arc<Self>, armed_episode: u64) {
        let transition = {
            let mut cell = self.lock_cell();
            if cell.state == CircuitState::Open && cell.episode == armed_episode {
                cell.state = CircuitState::HalfOpen;
                cell.trial_in_flight = false;
                cell.episode += 1;
                cell.reset_timer = None;
                Some((Transition::HalfOpened, cell.failures))
            } else {
                None
            }
        };
        if let Some((transition, failures)) = transition {
            self.after_transition(transition, failures);
        }
    }

    /// Runs transition side effects outside the cell lock: log, invoke the
    /// registered handlers in registration order, publish the record.
    /// A panicking handler is contained; it cannot affect the state machine
    /// or suppress the record.
    fn after_transition(&self, transition: Transition, failures: u32) {
        let (state, handlers) = match transition {
            Transition::Opened => {
                warn!(breaker = %self.name, failures, "circuit breaker opened");
                (CircuitState::Open, &self.open_handlers)
            }
            Transition::HalfOpened => {
                info!(breaker = %self.name, "circuit breaker half-open, probing recovery");
                (CircuitState::HalfOpen, &self.half_open_handlers)
            }
            Transition::Closed => {
                info!(breaker = %self.name, "circuit breaker closed, normal operation resumed");
                (CircuitState::Closed, &self.close_handlers)
            }
        };

        let handlers: Vec<Handler> =
            handlers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                warn!(breaker = %self.name, state = ?state, "state-change handler panicked");
            }
        }

        if let (Some(publisher), Some(topic)) =
            (self.publisher.as_deref(), self.config.notification_topic.as_deref())
        {
            let change = StateChange {
                state,
                name: self.name.clone(),
                failures,
                node: self.config.node_id.clone(),
            };
            publisher.publish(topic, &change);
        }
    }
}

impl Drop for BreakerCore {
    fn drop(&mut self) {
        let cell = self.cell.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = cell.reset_timer.take() {
            timer.abort();
        }
    }
}

/// RAII guard for the half-open trial slot.
///
/// Armed on admission of a trial call; disarmed once the outcome is
/// classified (classification itself releases the slot). If the guarded call
/// is abandoned before classification, dropping the permit returns the slot
/// so the breaker does not wedge in half-open.
pub(crate) struct TrialPermit {
    core: Arc<BreakerCore>,
    armed: bool,
}

impl TrialPermit {
    pub(crate) fn new(core: Arc<BreakerCore>) -> Self {
        Self { core, armed: true }
    }

    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TrialPermit {
    fn drop(&mut self) {
        if self.armed {
            self.core.release_trial();
        }
    }
}

impl fmt::Debug for TrialPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialPermit").field("armed", &self.armed).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use tokio::time::sleep;

    use super::*;

    fn core_with(config: CircuitBreakerConfig) -> Arc<BreakerCore> {
        BreakerCore::new("test".to_owned(), config, None)
    }

    fn no_reset_config(max_failures: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig { max_failures, reset_timeout: None, ..CircuitBreakerConfig::default() }
    }

    #[test]
    fn test_initial_state() {
        let core = core_with(no_reset_config(3));
        assert_eq!(core.state(), CircuitState::Closed);
        assert_eq!(core.failure_count(), 0);
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let core = core_with(no_reset_config(3));

        core.record_failure(false);
        core.record_failure(false);
        assert_eq!(core.state(), CircuitState::Closed);
        assert_eq!(core.failure_count(), 2);

        core.record_failure(false);
        assert_eq!(core.state(), CircuitState::Open);
        assert_eq!(core.failure_count(), 3);
    }

    #[test]
    fn test_success_resets_count_while_closed() {
        let core = core_with(no_reset_config(3));

        core.record_failure(false);
        core.record_failure(false);
        core.record_success(false);
        assert_eq!(core.failure_count(), 0);

        // The slate is clean: two more failures do not open.
        core.record_failure(false);
        core.record_failure(false);
        assert_eq!(core.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_and_closed_admits() {
        let core = core_with(no_reset_config(1));
        assert_eq!(core.admit(), Admission::Admitted { trial: false });

        core.record_failure(false);
        assert_eq!(core.admit(), Admission::Rejected);
    }

    #[test]
    fn test_stale_failure_while_open_is_ignored() {
        let core = core_with(no_reset_config(1));
        core.record_failure(false);
        assert_eq!(core.state(), CircuitState::Open);

        // A call admitted before the open resolves late; nothing changes.
        core.record_failure(false);
        core.record_success(false);
        assert_eq!(core.state(), CircuitState::Open);
        assert_eq!(core.failure_count(), 1);
    }

    #[test]
    fn test_count_caps_at_threshold() {
        let core = core_with(no_reset_config(2));
        core.record_failure(false);
        core.record_failure(false);
        assert_eq!(core.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_reset_timer_moves_open_to_half_open() {
        let config = CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Some(Duration::from_millis(50)),
            ..CircuitBreakerConfig::default()
        };
        let core = core_with(config);

        core.record_failure(false);
        assert_eq!(core.state(), CircuitState::Open);

        sleep(Duration::from_millis(120)).await;
        assert_eq!(core.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_admits_single_trial() {
        let config = CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Some(Duration::from_millis(20)),
            ..CircuitBreakerConfig::default()
        };
        let core = core_with(config);
        core.record_failure(false);
        sleep(Duration::from_millis(80)).await;
        assert_eq!(core.state(), CircuitState::HalfOpen);

        assert_eq!(core.admit(), Admission::Admitted { trial: true });
        assert_eq!(core.admit(), Admission::Rejected);
        assert_eq!(core.admit(), Admission::Rejected);
    }

    #[tokio::test]
    async fn test_trial_success_closes_and_zeroes_count() {
        let config = CircuitBreakerConfig {
            max_failures: 2,
            reset_timeout: Some(Duration::from_millis(20)),
            ..CircuitBreakerConfig::default()
        };
        let core = core_with(config);
        core.record_failure(false);
        core.record_failure(false);
        sleep(Duration::from_millis(80)).await;

        assert_eq!(core.admit(), Admission::Admitted { trial: true });
        core.record_success(true);
        assert_eq!(core.state(), CircuitState::Closed);
        assert_eq!(core.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_trial_failure_reopens_and_rearms_timer() {
        let config = CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Some(Duration::from_millis(50)),
            ..CircuitBreakerConfig::default()
        };
        let core = core_with(config);
        core.record_failure(false);
        sleep(Duration::from_millis(120)).await;
        assert_eq!(core.state(), CircuitState::HalfOpen);

        assert_eq!(core.admit(), Admission::Admitted { trial: true });
        core.record_failure(true);
        assert_eq!(core.state(), CircuitState::Open);

        // A fresh episode: the new timer probes again.
        sleep(Duration::from_millis(120)).await;
        assert_eq!(core.state(), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_no_auto_reset_without_timeout() {
        let core = core_with(no_reset_config(1));
        core.record_failure(false);
        sleep(Duration::from_millis(80)).await;
        assert_eq!(core.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_released_trial_slot_admits_next_probe() {
        let config = CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Some(Duration::from_millis(20)),
            ..CircuitBreakerConfig::default()
        };
        let core = core_with(config);
        core.record_failure(false);
        sleep(Duration::from_millis(80)).await;

        assert_eq!(core.admit(), Admission::Admitted { trial: true });
        // Abandoned probe: the permit returns the slot on drop.
        drop(TrialPermit::new(Arc::clone(&core)));
        assert_eq!(core.admit(), Admission::Admitted { trial: true });
    }

    #[tokio::test]
    async fn test_manual_trip_and_reset() {
        let config = CircuitBreakerConfig {
            max_failures: 5,
            reset_timeout: Some(Duration::from_secs(60)),
            ..CircuitBreakerConfig::default()
        };
        let core = core_with(config);

        core.trip();
        assert_eq!(core.state(), CircuitState::Open);
        assert_eq!(core.admit(), Admission::Rejected);

        core.force_reset();
        assert_eq!(core.state(), CircuitState::Closed);
        assert_eq!(core.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_cancels_pending_timer() {
        let config = CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Some(Duration::from_millis(50)),
            ..CircuitBreakerConfig::default()
        };
        let core = core_with(config);
        core.record_failure(false);
        core.force_reset();
        assert_eq!(core.state(), CircuitState::Closed);

        // The canceled timer must not fire a stale half-open probe.
        sleep(Duration::from_millis(120)).await;
        assert_eq!(core.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_disarms_timer() {
        let config = CircuitBreakerConfig {
            max_failures: 1,
            reset_timeout: Some(Duration::from_millis(50)),
            ..CircuitBreakerConfig::default()
        };
        let core = core_with(config);
        core.record_failure(false);
        core.shutdown();

        sleep(Duration::from_millis(120)).await;
        assert_eq!(core.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_block_record() {
        struct Capture(Mutex<Vec<CircuitState>>);
        impl NotificationPublisher for Capture {
            fn publish(&self, _topic: &str, change: &StateChange) {
                self.0.lock().unwrap().push(change.state);
            }
        }

        let capture = Arc::new(Capture(Mutex::new(Vec::new())));
        let core = BreakerCore::new(
            "panicky".to_owned(),
            no_reset_config(1),
            Some(Arc::clone(&capture) as Arc<dyn NotificationPublisher>),
        );
        core.register_open_handler(Arc::new(|| panic!("handler bug")));

        core.record_failure(false);
        assert_eq!(core.state(), CircuitState::Open);
        assert_eq!(*capture.0.lock().unwrap(), vec![CircuitState::Open]);
    }

    #[tokio::test]
    async fn test_handlers_invoked_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let core = core_with(no_reset_config(1));

        for tag in [1_u32, 2, 3] {
            let order = Arc::clone(&order);
            core.register_open_handler(Arc::new(move || order.lock().unwrap().push(tag)));
        }

        core.record_failure(false);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_racing_threshold_failures_open_once() {
        let opened = Arc::new(AtomicU32::new(0));
        let core = core_with(no_reset_config(2));
        {
            let opened = Arc::clone(&opened);
            core.register_open_handler(Arc::new(move || {
                opened.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let core = Arc::clone(&core);
            tasks.push(tokio::spawn(async move { core.record_failure(false) }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(core.state(), CircuitState::Open);
        assert_eq!(opened.load(Ordering::SeqCst), 1, "open handlers must fire exactly once");
    }
}
