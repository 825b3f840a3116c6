//! Shared gating state deciding whether the pipe should be open.
//!
//! All fields live behind one mutex. Every mutation goes through
//! [`Gate::update`], which releases the lock and then bumps a wake
//! generation so the supervisor re-evaluates [`GatingState::necessary`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// An inbound wake (push arrival) that keeps the pipe necessary until a
/// message has been dispatched.
#[derive(Debug)]
pub struct PendingEvent {
    id: Uuid,
    ack: Option<oneshot::Sender<()>>,
}

impl PendingEvent {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            ack: None,
        }
    }

    /// Event paired with a receiver that resolves once the event has been
    /// retired by a dispatch.
    pub fn with_ack() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id: Uuid::new_v4(),
                ack: Some(tx),
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn complete(self) {
        if let Some(ack) = self.ack {
            let _ = ack.send(());
        }
    }
}

impl Default for PendingEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct GatingState {
    pub active_foreground: u32,
    pub pending_events: VecDeque<PendingEvent>,
    pub push_channel_disabled: bool,
    pub network_reachable: bool,
    pub registered: bool,
    pub websocket_enabled: bool,
}

impl GatingState {
    pub fn necessary(&self) -> bool {
        self.registered
            && self.websocket_enabled
            && (self.active_foreground > 0
                || !self.pending_events.is_empty()
                || self.push_channel_disabled)
            && self.network_reachable
    }
}

/// Counters copied out of the gating state in one lock acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateSnapshot {
    pub necessary: bool,
    pub active_foreground: u32,
    pub pending_events: usize,
    pub push_channel_disabled: bool,
    pub network_reachable: bool,
    pub registered: bool,
    pub websocket_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

#[derive(Debug)]
struct GateInner {
    state: Mutex<GatingState>,
    wake: watch::Sender<u64>,
}

impl Gate {
    pub fn new(initial: GatingState) -> Self {
        let (wake, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(initial),
                wake,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GatingState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.inner.wake.send_modify(|gen| *gen = gen.wrapping_add(1));
    }

    /// Mutates the state under the lock, then wakes every waiter.
    pub fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut GatingState) -> R,
    {
        let out = {
            let mut state = self.lock();
            f(&mut state)
        };
        self.wake();
        out
    }

    pub fn necessary(&self) -> bool {
        self.lock().necessary()
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let state = self.lock();
        GateSnapshot {
            necessary: state.necessary(),
            active_foreground: state.active_foreground,
            pending_events: state.pending_events.len(),
            push_channel_disabled: state.push_channel_disabled,
            network_reachable: state.network_reachable,
            registered: state.registered,
            websocket_enabled: state.websocket_enabled,
        }
    }

    /// Receiver that observes a change on every mutation. The current
    /// generation is already marked seen.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.wake.subscribe()
    }

    pub fn foreground_started(&self) -> u32 {
        let count = self.update(|s| {
            s.active_foreground = s.active_foreground.saturating_add(1);
            s.active_foreground
        });
        tracing::debug!(active_count = count, "foreground started");
        count
    }

    pub fn foreground_stopped(&self) -> u32 {
        let (count, clamped) = self.update(|s| match s.active_foreground.checked_sub(1) {
            Some(next) => {
                s.active_foreground = next;
                (next, false)
            }
            None => (0, true),
        });
        if clamped {
            tracing::warn!("foreground stop without matching start; count stays at 0");
        } else {
            tracing::debug!(active_count = count, "foreground stopped");
        }
        count
    }

    pub fn event_pending(&self, event: PendingEvent) -> usize {
        let id = event.id();
        let pending = self.update(|s| {
            s.pending_events.push_back(event);
            s.pending_events.len()
        });
        tracing::debug!(event_id = %id, pending, "event pending");
        pending
    }

    /// Retires the oldest pending event and fires its acknowledgement.
    /// Waiters are only woken when something was removed.
    pub fn complete_oldest_event(&self) -> Option<Uuid> {
        let event = self.lock().pending_events.pop_front()?;
        self.wake();
        let id = event.id();
        event.complete();
        Some(id)
    }

    pub fn set_registered(&self, registered: bool) {
        self.update(|s| s.registered = registered);
    }

    pub fn set_websocket_enabled(&self, enabled: bool) {
        self.update(|s| s.websocket_enabled = enabled);
    }

    pub fn set_push_channel_disabled(&self, disabled: bool) {
        self.update(|s| s.push_channel_disabled = disabled);
    }

    pub fn set_network_reachable(&self, reachable: bool) {
        self.update(|s| s.network_reachable = reachable);
    }

    /// Blocks until the pipe is necessary. Returns `false` when shutdown
    /// is observed first. Wakes that leave the predicate false just loop.
    pub async fn wait_until_necessary(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut wake = self.subscribe();
        loop {
            if *shutdown.borrow_and_update() {
                return false;
            }
            let snap = self.snapshot();
            tracing::debug!(
                network_reachable = snap.network_reachable,
                active_count = snap.active_foreground,
                pending = snap.pending_events,
                push_disabled = snap.push_channel_disabled,
                registered = snap.registered,
                websocket_enabled = snap.websocket_enabled,
                "evaluating connection necessity"
            );
            if snap.necessary {
                return true;
            }
            tokio::select! {
                _ = wake.changed() => {}
                res = shutdown.changed() => {
                    if res.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new(GatingState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ready_state() -> GatingState {
        GatingState {
            network_reachable: true,
            registered: true,
            websocket_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn necessary_matches_gate_formula_for_every_input() {
        for bits in 0u8..64 {
            let mut state = GatingState {
                active_foreground: u32::from(bits & 1),
                push_channel_disabled: bits & 2 != 0,
                network_reachable: bits & 4 != 0,
                registered: bits & 8 != 0,
                websocket_enabled: bits & 16 != 0,
                ..Default::default()
            };
            if bits & 32 != 0 {
                state.pending_events.push_back(PendingEvent::new());
            }
            let expected = state.registered
                && state.websocket_enabled
                && (state.active_foreground > 0
                    || !state.pending_events.is_empty()
                    || state.push_channel_disabled)
                && state.network_reachable;
            assert_eq!(state.necessary(), expected, "inputs {bits:06b}");
            assert_eq!(state.necessary(), state.necessary());
        }
    }

    #[test]
    fn pending_event_alone_makes_connection_necessary() {
        let gate = Gate::new(ready_state());
        assert!(!gate.necessary());
        gate.event_pending(PendingEvent::new());
        assert!(gate.necessary());
        assert!(gate.complete_oldest_event().is_some());
        assert!(!gate.necessary());
    }

    #[test]
    fn push_disabled_keeps_connection_necessary_without_events() {
        let gate = Gate::new(ready_state());
        gate.set_push_channel_disabled(true);
        let snap = gate.snapshot();
        assert_eq!(snap.active_foreground, 0);
        assert_eq!(snap.pending_events, 0);
        assert!(snap.necessary);
    }

    #[test]
    fn foreground_stop_never_goes_negative() {
        let gate = Gate::new(ready_state());
        assert_eq!(gate.foreground_stopped(), 0);
        assert_eq!(gate.foreground_stopped(), 0);
        assert_eq!(gate.foreground_started(), 1);
        assert!(gate.necessary());
        assert_eq!(gate.foreground_stopped(), 0);
        assert!(!gate.necessary());
    }

    #[test]
    fn unreachable_network_or_missing_registration_blocks() {
        let gate = Gate::new(ready_state());
        gate.foreground_started();
        assert!(gate.necessary());
        gate.set_network_reachable(false);
        assert!(!gate.necessary());
        gate.set_network_reachable(true);
        gate.set_registered(false);
        assert!(!gate.necessary());
        gate.set_registered(true);
        gate.set_websocket_enabled(false);
        assert!(!gate.necessary());
    }

    #[tokio::test]
    async fn completion_is_fifo_and_fires_acks() {
        let gate = Gate::new(ready_state());
        let (first, first_ack) = PendingEvent::with_ack();
        let (second, mut second_ack) = PendingEvent::with_ack();
        let first_id = first.id();
        gate.event_pending(first);
        gate.event_pending(second);

        assert_eq!(gate.complete_oldest_event(), Some(first_id));
        first_ack.await.unwrap();
        assert!(second_ack.try_recv().is_err());
        assert_eq!(gate.snapshot().pending_events, 1);
    }

    #[test]
    fn completing_with_empty_queue_is_a_noop() {
        let gate = Gate::new(ready_state());
        let mut wake = gate.subscribe();
        assert!(gate.complete_oldest_event().is_none());
        assert!(!wake.has_changed().unwrap());
        gate.foreground_started();
        assert!(wake.has_changed().unwrap());
        wake.borrow_and_update();
    }

    #[tokio::test]
    async fn wait_returns_once_a_mutation_makes_it_necessary() {
        let gate = Gate::new(ready_state());
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_necessary(&mut shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.set_push_channel_disabled(true);
        let necessary = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(necessary);
    }

    #[tokio::test]
    async fn wait_returns_false_on_shutdown() {
        let gate = Gate::new(ready_state());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_until_necessary(&mut shutdown_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        let necessary = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should observe shutdown")
            .unwrap();
        assert!(!necessary);
    }
}
