use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Opaque identity of the active network path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(String);

impl NetworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<IpAddr> for NetworkId {
    fn from(ip: IpAddr) -> Self {
        Self(ip.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    /// Monitor only while the push channel is disabled and the pipe is the
    /// sole delivery path.
    #[default]
    Auto,
    Always,
    Never,
}

impl MonitorMode {
    pub fn is_active(self, push_channel_disabled: bool) -> bool {
        match self {
            Self::Auto => push_channel_disabled,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

impl FromStr for MonitorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            other => Err(format!("unknown network monitor mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkTransition {
    Unchanged,
    /// First network seen since start or since losing the previous one.
    Acquired(NetworkId),
    /// The path a live pipe may be bound to is gone.
    Changed {
        previous: NetworkId,
        current: Option<NetworkId>,
    },
}

impl NetworkTransition {
    pub fn requires_recycle(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

#[derive(Debug, Default)]
pub struct NetworkMonitor {
    current: Option<NetworkId>,
}

impl NetworkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&NetworkId> {
        self.current.as_ref()
    }

    pub fn observe(&mut self, network: Option<NetworkId>) -> NetworkTransition {
        let previous = std::mem::replace(&mut self.current, network.clone());
        match (previous, network) {
            (Some(previous), current) if current.as_ref() != Some(&previous) => {
                NetworkTransition::Changed { previous, current }
            }
            (None, Some(current)) => NetworkTransition::Acquired(current),
            _ => NetworkTransition::Unchanged,
        }
    }
}

/// Asks the OS which local address it would route `target` through. The
/// UDP socket is only connected, nothing is sent.
pub async fn probe_active_network(target: SocketAddr) -> Option<NetworkId> {
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(target).await.ok()?;
    let local = socket.local_addr().ok()?;
    if local.ip().is_unspecified() {
        return None;
    }
    Some(NetworkId::from(local.ip()))
}

/// Polls the route to `target` and reports the first observation and every
/// change after it until shutdown.
pub fn spawn_route_probe<F>(
    target: SocketAddr,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    on_change: F,
) -> JoinHandle<()>
where
    F: Fn(Option<NetworkId>) + Send + 'static,
{
    tokio::spawn(async move {
        tracing::info!(probe_target = %target, interval_ms = interval.as_millis() as u64, "route probe started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<Option<NetworkId>> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
            let observed = probe_active_network(target).await;
            if last.as_ref() != Some(&observed) {
                on_change(observed.clone());
                last = Some(observed);
            }
        }
        tracing::info!("route probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn id(s: &str) -> NetworkId {
        NetworkId::new(s)
    }

    #[test]
    fn first_network_is_acquired_without_recycle() {
        let mut monitor = NetworkMonitor::new();
        let t = monitor.observe(Some(id("wifi")));
        assert_eq!(t, NetworkTransition::Acquired(id("wifi")));
        assert!(!t.requires_recycle());
        assert_eq!(monitor.current(), Some(&id("wifi")));
    }

    #[test]
    fn same_network_is_unchanged() {
        let mut monitor = NetworkMonitor::new();
        monitor.observe(Some(id("wifi")));
        assert_eq!(monitor.observe(Some(id("wifi"))), NetworkTransition::Unchanged);
        assert_eq!(NetworkMonitor::new().observe(None), NetworkTransition::Unchanged);
    }

    #[test]
    fn switching_or_losing_network_requires_recycle() {
        let mut monitor = NetworkMonitor::new();
        monitor.observe(Some(id("wifi")));

        let t = monitor.observe(Some(id("cell")));
        assert!(t.requires_recycle());
        assert_eq!(
            t,
            NetworkTransition::Changed {
                previous: id("wifi"),
                current: Some(id("cell")),
            }
        );

        let t = monitor.observe(None);
        assert!(t.requires_recycle());
        assert_eq!(monitor.current(), None);

        // coming back after a loss is a fresh acquisition
        assert!(!monitor.observe(Some(id("cell"))).requires_recycle());
    }

    #[test]
    fn auto_mode_follows_push_channel() {
        assert!(MonitorMode::Auto.is_active(true));
        assert!(!MonitorMode::Auto.is_active(false));
        assert!(MonitorMode::Always.is_active(false));
        assert!(!MonitorMode::Never.is_active(true));
        assert_eq!("ALWAYS".parse::<MonitorMode>().unwrap(), MonitorMode::Always);
        assert!("sometimes".parse::<MonitorMode>().is_err());
    }

    #[tokio::test]
    async fn loopback_probe_reports_loopback_address() {
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let network = probe_active_network(target).await;
        assert_eq!(network, Some(id("127.0.0.1")));
    }

    #[tokio::test]
    async fn route_probe_reports_once_until_change_and_stops() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sink = seen.clone();
        let task = spawn_route_probe(
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(10),
            shutdown_rx,
            move |network| sink.lock().unwrap().push(network),
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(id("127.0.0.1"))]);
    }
}
