//! The connection supervisor: one long-lived worker that waits until the
//! pipe is necessary, opens it, reads and dispatches until it no longer is
//! (or fails, or is interrupted), closes it, and repeats until stopped.

use crate::gating::Gate;
use crate::model::{now_unix_ms, Lifecycle, SupervisorStatus};
use crate::network::{NetworkId, NetworkMonitor};
use crate::transport::{Connection, Dispatch, ReadError, Transport};
use futures_util::FutureExt;
use rand::Rng;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

type Conn<T> = <T as Transport>::Connection;
type Msg<T> = <Conn<T> as Connection>::Message;
pub type PipeHandle<T> = <Conn<T> as Connection>::Handle;
pub type StatusHandle = Arc<watch::Sender<SupervisorStatus>>;
pub type NetworkHandle = Arc<Mutex<NetworkMonitor>>;

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub read_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            backoff_initial: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
        }
    }
}

/// Receivers the worker listens on besides the gate.
#[derive(Debug, Clone)]
pub struct Signals {
    pub shutdown: watch::Receiver<bool>,
    /// Bumped on every network-change recycle request.
    pub interrupt: watch::Receiver<u64>,
}

/// Write side of the single published pipe slot. Only the supervisor holds it.
#[derive(Debug)]
pub struct PipeSlot<H> {
    tx: watch::Sender<Option<H>>,
}

impl<H> PipeSlot<H> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    fn publish(&self, handle: H) {
        self.tx.send_replace(Some(handle));
    }

    fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn reader(&self) -> CurrentPipe<H> {
        CurrentPipe {
            rx: self.tx.subscribe(),
        }
    }
}

impl<H> Default for PipeSlot<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the pipe that is currently open, if any.
#[derive(Debug, Clone)]
pub struct CurrentPipe<H> {
    rx: watch::Receiver<Option<H>>,
}

impl<H: Clone> CurrentPipe<H> {
    pub fn get(&self) -> Option<H> {
        self.rx.borrow().clone()
    }

    /// Resolves with the next published pipe, or `None` if the supervisor
    /// is gone.
    pub async fn wait_for_pipe(&mut self) -> Option<H> {
        self.rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|pipe| pipe.clone())
    }
}

pub fn new_status_handle() -> StatusHandle {
    let (tx, _) = watch::channel(SupervisorStatus::default());
    Arc::new(tx)
}

pub fn update_status<F>(status: &StatusHandle, f: F)
where
    F: FnOnce(&mut SupervisorStatus),
{
    status.send_modify(|s| {
        f(s);
        s.updated_ts_unix_ms = Some(now_unix_ms());
    });
}

/// Why a connection cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleExit {
    Stopped,
    Interrupted,
    NoLongerNecessary,
    Failed(String),
    Fault(String),
}

#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Current delay plus up to 20% jitter; doubles the next one.
    fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 5);
        base + Duration::from_millis(jitter_ms)
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Never resolves once the sender is gone.
async fn changed_or_pending<T>(rx: &mut watch::Receiver<T>) {
    if rx.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn panic_detail(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct Supervisor<T: Transport, D> {
    transport: Arc<T>,
    dispatch: Arc<D>,
    gate: Gate,
    network: NetworkHandle,
    pipe: Arc<PipeSlot<PipeHandle<T>>>,
    status: StatusHandle,
    timing: Timing,
}

impl<T: Transport, D> Clone for Supervisor<T, D> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            dispatch: self.dispatch.clone(),
            gate: self.gate.clone(),
            network: self.network.clone(),
            pipe: self.pipe.clone(),
            status: self.status.clone(),
            timing: self.timing,
        }
    }
}

impl<T, D> Supervisor<T, D>
where
    T: Transport,
    D: Dispatch<Msg<T>>,
{
    pub fn new(
        transport: T,
        dispatch: D,
        gate: Gate,
        network: NetworkHandle,
        status: StatusHandle,
        timing: Timing,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            dispatch: Arc::new(dispatch),
            gate,
            network,
            pipe: Arc::new(PipeSlot::new()),
            status,
            timing,
        }
    }

    pub fn current_pipe(&self) -> CurrentPipe<PipeHandle<T>> {
        self.pipe.reader()
    }

    /// Drops any published handle. Used when a worker died without closing.
    pub(crate) fn clear_pipe(&self) {
        self.pipe.clear();
    }

    fn current_network(&self) -> Option<NetworkId> {
        self.network
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current()
            .cloned()
    }

    fn publish<F>(&self, f: F)
    where
        F: FnOnce(&mut SupervisorStatus),
    {
        let gate = self.gate.snapshot();
        update_status(&self.status, |s| {
            s.necessary = gate.necessary;
            s.active_foreground = gate.active_foreground;
            s.pending_events = gate.pending_events;
            s.push_channel_disabled = gate.push_channel_disabled;
            f(s);
        });
    }

    fn set_state(&self, state: Lifecycle) {
        self.publish(|s| s.state = state);
    }

    /// Runs until shutdown is observed.
    pub async fn run(self, mut signals: Signals) {
        let mut backoff = Backoff::new(self.timing.backoff_initial, self.timing.backoff_max);
        loop {
            if *signals.shutdown.borrow() {
                break;
            }

            self.set_state(Lifecycle::Idle);
            tracing::info!("waiting for connection to become necessary");
            if !self.gate.wait_until_necessary(&mut signals.shutdown).await {
                break;
            }

            self.set_state(Lifecycle::Connecting);
            // interrupts raised before this point refer to an older path
            signals.interrupt.borrow_and_update();
            let network = self.current_network();
            tracing::info!(network = ?network, "making pipe connection");

            let opened = tokio::select! {
                res = self.transport.open() => res,
                _ = stopped(&mut signals.shutdown) => break,
            };
            let conn = match opened {
                Ok(conn) => {
                    backoff.reset();
                    conn
                }
                Err(err) => {
                    tracing::warn!(error = %err, "pipe connection failed");
                    self.publish(|s| {
                        s.connect_failures += 1;
                        s.last_failure = Some(err.to_string());
                    });
                    let delay = backoff.next_delay();
                    if !self.back_off(delay, &mut signals).await {
                        break;
                    }
                    continue;
                }
            };

            let exit = self.drive(conn, network, &mut signals).await;
            tracing::info!(exit = ?exit, "looping");
        }

        self.pipe.clear();
        self.publish(|s| {
            s.state = Lifecycle::Stopped;
            s.connected = false;
        });
        tracing::info!("retrieval worker exiting");
    }

    /// Sleeps before the next open attempt. Returns `false` on shutdown.
    async fn back_off(&self, delay: Duration, signals: &mut Signals) -> bool {
        tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off before reconnect");
        let mut wake = self.gate.subscribe();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut signals.shutdown) => return false,
                _ = changed_or_pending(&mut signals.interrupt) => return true,
                _ = changed_or_pending(&mut wake) => {
                    if !self.gate.necessary() {
                        return true;
                    }
                }
                _ = &mut sleep => return true,
            }
        }
    }

    /// One open connection: publish, read until exit, always close.
    async fn drive(
        &self,
        mut conn: Conn<T>,
        network: Option<NetworkId>,
        signals: &mut Signals,
    ) -> CycleExit {
        self.publish(|s| {
            s.connected = true;
            s.connections_opened += 1;
        });
        let cycle = async {
            self.pipe.publish(conn.handle());
            self.publish(|s| {
                s.state = Lifecycle::Reading;
                s.network = network;
            });
            self.read_loop(&mut conn, signals).await
        };

        let exit = AssertUnwindSafe(cycle)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let detail = panic_detail(panic.as_ref());
                tracing::error!(panic = %detail, "*** uncaught fault in connection cycle");
                CycleExit::Fault(detail)
            });

        self.set_state(Lifecycle::Closing);
        self.pipe.clear();
        tracing::info!("shutting down pipe");
        if let Err(err) = conn.close().await {
            tracing::warn!(error = %err, "pipe shutdown failed; ignoring");
        }
        self.publish(|s| {
            s.connected = false;
            s.connections_closed += 1;
            match &exit {
                CycleExit::Failed(detail) | CycleExit::Fault(detail) => {
                    s.last_failure = Some(detail.clone());
                }
                _ => {}
            }
        });
        exit
    }

    async fn read_loop(&self, conn: &mut Conn<T>, signals: &mut Signals) -> CycleExit {
        let mut wake = self.gate.subscribe();
        loop {
            if *signals.shutdown.borrow() {
                return CycleExit::Stopped;
            }
            if !self.gate.necessary() {
                return CycleExit::NoLongerNecessary;
            }

            tracing::debug!("reading message");
            let mut read = conn.read(self.timing.read_timeout);
            let outcome = loop {
                tokio::select! {
                    biased;
                    _ = stopped(&mut signals.shutdown) => return CycleExit::Stopped,
                    _ = changed_or_pending(&mut signals.interrupt) => {
                        tracing::debug!("retrieval worker interrupted");
                        return CycleExit::Interrupted;
                    }
                    _ = changed_or_pending(&mut wake) => {
                        if !self.gate.necessary() {
                            return CycleExit::NoLongerNecessary;
                        }
                    }
                    res = &mut read => break res,
                }
            };

            match outcome {
                Ok(message) => self.dispatch(message).await,
                Err(ReadError::Timeout(after)) => {
                    tracing::warn!(timeout_ms = after.as_millis() as u64, "application level read timeout");
                }
                Err(ReadError::Protocol(detail)) => {
                    tracing::warn!(error = %detail, "undecodable message skipped");
                    self.publish(|s| s.decode_errors += 1);
                }
                Err(err) => {
                    tracing::debug!(error = %err, "message pipe failed");
                    return CycleExit::Failed(err.to_string());
                }
            }
        }
    }

    /// Any successful dispatch retires the oldest pending event, whether or
    /// not the message belongs to it.
    async fn dispatch(&self, message: Msg<T>) {
        tracing::info!("retrieved message");
        match self.dispatch.handle(message).await {
            Ok(()) => {
                let retired = self.gate.complete_oldest_event();
                if let Some(id) = retired {
                    tracing::debug!(event_id = %id, "pending event completed");
                }
                self.publish(|s| s.messages_dispatched += 1);
            }
            Err(err) => {
                tracing::warn!(error = %err, "message dispatch failed");
                self.publish(|s| s.dispatch_errors += 1);
            }
        }
    }
}
