//! Control surface for the host: lifecycle (`start` / `stop`), gating
//! notifications and read-only views of status and the current pipe.

use crate::config::Config;
use crate::gating::{Gate, GateSnapshot, PendingEvent};
use crate::model::{Lifecycle, SupervisorStatus};
use crate::network::{spawn_route_probe, MonitorMode, NetworkId, NetworkMonitor, NetworkTransition};
use crate::supervisor::{
    self, CurrentPipe, NetworkHandle, PipeHandle, Signals, StatusHandle, Supervisor, Timing,
};
use crate::transport::{Connection, Dispatch, Transport};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

type Msg<T> = <<T as Transport>::Connection as Connection>::Message;

pub struct RetrievalService<T: Transport, D> {
    supervisor: Supervisor<T, D>,
    gate: Gate,
    network: NetworkHandle,
    monitor_mode: MonitorMode,
    status: StatusHandle,
    shutdown_tx: Arc<watch::Sender<bool>>,
    interrupt_tx: Arc<watch::Sender<u64>>,
    watchdog: Arc<Mutex<Option<JoinHandle<()>>>>,
    restart_delay: Duration,
}

impl<T: Transport, D> Clone for RetrievalService<T, D> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            gate: self.gate.clone(),
            network: self.network.clone(),
            monitor_mode: self.monitor_mode,
            status: self.status.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
            interrupt_tx: self.interrupt_tx.clone(),
            watchdog: self.watchdog.clone(),
            restart_delay: self.restart_delay,
        }
    }
}

impl<T, D> RetrievalService<T, D>
where
    T: Transport,
    D: Dispatch<Msg<T>>,
{
    pub fn new(transport: T, dispatch: D, config: &Config) -> Self {
        Self::with_parts(
            transport,
            dispatch,
            Gate::new(config.initial_gating_state()),
            config.network.monitor,
            config.timing(),
        )
    }

    pub fn with_parts(
        transport: T,
        dispatch: D,
        gate: Gate,
        monitor_mode: MonitorMode,
        timing: Timing,
    ) -> Self {
        let network: NetworkHandle = Arc::new(Mutex::new(NetworkMonitor::new()));
        let status = supervisor::new_status_handle();
        let (shutdown_tx, _) = watch::channel(false);
        let (interrupt_tx, _) = watch::channel(0u64);
        let supervisor = Supervisor::new(
            transport,
            dispatch,
            gate.clone(),
            network.clone(),
            status.clone(),
            timing,
        );
        Self {
            supervisor,
            gate,
            network,
            monitor_mode,
            status,
            shutdown_tx: Arc::new(shutdown_tx),
            interrupt_tx: Arc::new(interrupt_tx),
            watchdog: Arc::new(Mutex::new(None)),
            restart_delay: timing.backoff_initial,
        }
    }

    /// Spawns the worker under a watchdog. Calling it again while running
    /// does nothing; a stopped service stays stopped.
    pub fn start(&self) {
        let mut slot = self.watchdog.lock().unwrap_or_else(PoisonError::into_inner);
        if *self.shutdown_tx.borrow() {
            tracing::warn!("start ignored: retrieval service already stopped");
            return;
        }
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("start ignored: retrieval worker already running");
            return;
        }
        tracing::info!("starting retrieval service");
        *slot = Some(tokio::spawn(watchdog(
            self.supervisor.clone(),
            self.status.clone(),
            self.shutdown_tx.clone(),
            self.interrupt_tx.clone(),
            self.restart_delay,
        )));
    }

    /// Requests shutdown. The worker closes any open pipe and exits.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            tracing::info!("stopping retrieval service");
        }
    }

    /// Stops and waits for the worker to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let task = self
            .watchdog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "retrieval watchdog ended abnormally");
            }
        }
    }

    pub fn notify_foreground_started(&self) -> u32 {
        let count = self.gate.foreground_started();
        self.refresh_status();
        count
    }

    pub fn notify_foreground_stopped(&self) -> u32 {
        let count = self.gate.foreground_stopped();
        self.refresh_status();
        count
    }

    pub fn notify_event_pending(&self, event: PendingEvent) -> usize {
        let pending = self.gate.event_pending(event);
        self.refresh_status();
        pending
    }

    /// Feeds the active network identity (`None` when offline). Also drives
    /// reachability. When monitoring is active and a previously seen
    /// network went away or was replaced, the worker is interrupted so the
    /// pipe is reopened on the new path.
    pub fn notify_connectivity_changed(&self, network: Option<NetworkId>) {
        let reachable = network.is_some();
        // monitor and reachability change together under the monitor lock
        let transition = {
            let mut monitor = self.network.lock().unwrap_or_else(PoisonError::into_inner);
            let transition = monitor.observe(network);
            self.gate.set_network_reachable(reachable);
            transition
        };

        if let NetworkTransition::Acquired(current) = &transition {
            tracing::info!(network = %current, "network acquired");
        }
        if transition.requires_recycle() {
            let push_disabled = self.gate.snapshot().push_channel_disabled;
            if self.monitor_mode.is_active(push_disabled) {
                tracing::info!(transition = ?transition, "active network changed; recycling pipe");
                self.interrupt_tx.send_modify(|gen| *gen = gen.wrapping_add(1));
            } else {
                tracing::debug!(transition = ?transition, "active network changed; monitor inactive");
            }
        }
        self.refresh_status();
    }

    pub fn set_network_reachable(&self, reachable: bool) {
        self.gate.set_network_reachable(reachable);
        self.refresh_status();
    }

    pub fn set_registered(&self, registered: bool) {
        self.gate.set_registered(registered);
        self.refresh_status();
    }

    pub fn set_websocket_enabled(&self, enabled: bool) {
        self.gate.set_websocket_enabled(enabled);
        self.refresh_status();
    }

    pub fn set_push_channel_disabled(&self, disabled: bool) {
        self.gate.set_push_channel_disabled(disabled);
        self.refresh_status();
    }

    /// Polls the route to `target` and feeds every change into
    /// [`Self::notify_connectivity_changed`]. Ends with the service.
    pub fn spawn_route_probe(&self, target: SocketAddr, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        spawn_route_probe(target, interval, self.shutdown_tx.subscribe(), move |network| {
            service.notify_connectivity_changed(network)
        })
    }

    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    pub fn gate_snapshot(&self) -> GateSnapshot {
        self.gate.snapshot()
    }

    pub fn current_pipe(&self) -> CurrentPipe<PipeHandle<T>> {
        self.supervisor.current_pipe()
    }

    fn refresh_status(&self) {
        let gate = self.gate.snapshot();
        supervisor::update_status(&self.status, |s| {
            s.necessary = gate.necessary;
            s.active_foreground = gate.active_foreground;
            s.pending_events = gate.pending_events;
            s.push_channel_disabled = gate.push_channel_disabled;
        });
    }
}

/// Runs the worker and respawns it if it dies from a panic, until stop.
async fn watchdog<T, D>(
    supervisor: Supervisor<T, D>,
    status: StatusHandle,
    shutdown_tx: Arc<watch::Sender<bool>>,
    interrupt_tx: Arc<watch::Sender<u64>>,
    restart_delay: Duration,
) where
    T: Transport,
    D: Dispatch<Msg<T>>,
{
    loop {
        let signals = Signals {
            shutdown: shutdown_tx.subscribe(),
            interrupt: interrupt_tx.subscribe(),
        };
        let worker = tokio::spawn(supervisor.clone().run(signals));
        match worker.await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                tracing::error!(error = %err, "*** uncaught fault in retrieval worker");
                supervisor.clear_pipe();
                supervisor::update_status(&status, |s| {
                    s.worker_restarts += 1;
                    s.connected = false;
                    s.last_failure = Some(err.to_string());
                });
                if *shutdown_tx.borrow() {
                    break;
                }
                tokio::time::sleep(restart_delay).await;
                if *shutdown_tx.borrow() {
                    break;
                }
                tracing::warn!("restarting retrieval worker");
            }
            Err(err) => {
                tracing::warn!(error = %err, "retrieval worker cancelled");
                break;
            }
        }
    }
    supervisor::update_status(&status, |s| {
        s.state = Lifecycle::Stopped;
        s.connected = false;
    });
}
