//! In-process transport. Inbound traffic is injected through a
//! [`LoopbackFeed`]; at most one connection can hold the feed at a time.

use super::{CloseError, ConnectError, Connection, ReadError, Transport};
use async_trait::async_trait;
use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

#[derive(Debug)]
pub enum Inbound<M> {
    Message(M),
    ProtocolError(String),
    Fail(io::ErrorKind),
}

type InboundRx<M> = mpsc::UnboundedReceiver<Inbound<M>>;

#[derive(Debug)]
struct Shared<M> {
    inbound: Arc<Mutex<InboundRx<M>>>,
    fail_opens: AtomicU32,
    fail_closes: AtomicU32,
    next_id: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub opens: u64,
    pub closes: u64,
    pub live: usize,
    pub max_live: usize,
}

#[derive(Debug)]
pub struct LoopbackTransport<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for LoopbackTransport<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

#[derive(Debug)]
pub struct LoopbackFeed<M> {
    tx: mpsc::UnboundedSender<Inbound<M>>,
}

impl<M> Clone for LoopbackFeed<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pub fn loopback<M>() -> (LoopbackTransport<M>, LoopbackFeed<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Shared {
        inbound: Arc::new(Mutex::new(rx)),
        fail_opens: AtomicU32::new(0),
        fail_closes: AtomicU32::new(0),
        next_id: AtomicU64::new(1),
        opens: AtomicU64::new(0),
        closes: AtomicU64::new(0),
        live: AtomicUsize::new(0),
        max_live: AtomicUsize::new(0),
    };
    (
        LoopbackTransport {
            shared: Arc::new(shared),
        },
        LoopbackFeed { tx },
    )
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl<M> LoopbackTransport<M> {
    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            opens: self.shared.opens.load(Ordering::SeqCst),
            closes: self.shared.closes.load(Ordering::SeqCst),
            live: self.shared.live.load(Ordering::SeqCst),
            max_live: self.shared.max_live.load(Ordering::SeqCst),
        }
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.shared.fail_opens.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_closes(&self, count: u32) {
        self.shared.fail_closes.store(count, Ordering::SeqCst);
    }
}

impl<M> LoopbackFeed<M> {
    /// Returns `false` once every transport clone is gone.
    pub fn send(&self, message: M) -> bool {
        self.tx.send(Inbound::Message(message)).is_ok()
    }

    pub fn protocol_error(&self, detail: impl Into<String>) -> bool {
        self.tx.send(Inbound::ProtocolError(detail.into())).is_ok()
    }

    pub fn fail(&self, kind: io::ErrorKind) -> bool {
        self.tx.send(Inbound::Fail(kind)).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackHandle {
    pub connection_id: u64,
}

#[derive(Debug)]
pub struct LoopbackConnection<M> {
    id: u64,
    inbound: OwnedMutexGuard<InboundRx<M>>,
    shared: Arc<Shared<M>>,
}

#[async_trait]
impl<M> Transport for LoopbackTransport<M>
where
    M: Debug + Send + 'static,
{
    type Connection = LoopbackConnection<M>;

    async fn open(&self) -> Result<Self::Connection, ConnectError> {
        if take_one(&self.shared.fail_opens) {
            return Err(ConnectError::Unreachable("injected loopback open failure".to_string()));
        }
        let inbound = self
            .shared
            .inbound
            .clone()
            .try_lock_owned()
            .map_err(|_| ConnectError::Unreachable("loopback pipe already open".to_string()))?;
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(LoopbackConnection {
            id,
            inbound,
            shared: self.shared.clone(),
        })
    }
}

#[async_trait]
impl<M> Connection for LoopbackConnection<M>
where
    M: Debug + Send + 'static,
{
    type Message = M;
    type Handle = LoopbackHandle;

    fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            connection_id: self.id,
        }
    }

    async fn read(&mut self, timeout: Duration) -> Result<M, ReadError> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Err(_) => Err(ReadError::Timeout(timeout)),
            Ok(None) => Err(ReadError::Closed),
            Ok(Some(Inbound::Message(message))) => Ok(message),
            Ok(Some(Inbound::ProtocolError(detail))) => Err(ReadError::Protocol(detail)),
            Ok(Some(Inbound::Fail(kind))) => Err(ReadError::Io(io::Error::new(
                kind,
                "injected loopback failure",
            ))),
        }
    }

    async fn close(self) -> Result<(), CloseError> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
        if take_one(&self.shared.fail_closes) {
            return Err(CloseError("injected loopback close failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn only_one_connection_can_hold_the_feed() {
        let (transport, _feed) = loopback::<String>();
        let first = transport.open().await.unwrap();
        assert!(matches!(
            transport.open().await,
            Err(ConnectError::Unreachable(_))
        ));
        first.close().await.unwrap();

        let second = transport.open().await.unwrap();
        assert_eq!(second.handle().connection_id, 2);
        second.close().await.unwrap();

        let stats = transport.stats();
        assert_eq!(stats.opens, 2);
        assert_eq!(stats.closes, 2);
        assert_eq!(stats.live, 0);
        assert_eq!(stats.max_live, 1);
    }

    #[tokio::test]
    async fn read_maps_injected_traffic() {
        let (transport, feed) = loopback::<String>();
        let mut conn = transport.open().await.unwrap();
        let timeout = Duration::from_millis(50);

        feed.send("hello".to_string());
        feed.protocol_error("bad version");
        feed.fail(io::ErrorKind::ConnectionReset);

        assert_eq!(conn.read(timeout).await.unwrap(), "hello");
        assert!(matches!(conn.read(timeout).await, Err(ReadError::Protocol(_))));
        assert!(matches!(conn.read(timeout).await, Err(ReadError::Io(_))));
        assert!(matches!(conn.read(timeout).await, Err(ReadError::Timeout(_))));

        drop(feed);
        assert!(matches!(conn.read(timeout).await, Err(ReadError::Closed)));
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_at_a_time() {
        let (transport, _feed) = loopback::<String>();
        transport.fail_next_opens(1);
        transport.fail_next_closes(1);
        assert!(transport.open().await.is_err());

        let conn = transport.open().await.unwrap();
        assert!(conn.close().await.is_err());
        let conn = transport.open().await.unwrap();
        assert!(conn.close().await.is_ok());
        assert_eq!(transport.stats().live, 0);
    }
}
