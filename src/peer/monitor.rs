//! Peer Monitor
//!
//! Registers with one stripe server and heartbeats it on a fixed period,
//! handing every election signal (or loss of the server) to the
//! session's arbitration.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::PeerClient;
use crate::error::{Error, Result};

/// Callback receiving the peer an election event was raised for
pub type ElectionHandler = Arc<dyn Fn(Arc<dyn PeerClient>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Heartbeat driver for one peer
pub struct PeerMonitor {
    client: Arc<dyn PeerClient>,
    voter_id: String,
    period: Duration,
    cancel: CancellationToken,
    tracker: TaskTracker,
    operational: watch::Sender<bool>,
}

impl PeerMonitor {
    /// Create a monitor whose task is cancelled with `parent` and spawned on `tracker`
    pub fn new(
        client: Arc<dyn PeerClient>,
        voter_id: String,
        period: Duration,
        parent: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let (operational, _) = watch::channel(false);
        Self {
            client,
            voter_id,
            period,
            cancel: parent.child_token(),
            tracker: tracker.clone(),
            operational,
        }
    }

    pub fn client(&self) -> &Arc<dyn PeerClient> {
        &self.client
    }

    pub fn address(&self) -> &str {
        self.client.address()
    }

    /// Register with the peer and start heartbeating.
    ///
    /// Fails fast without scheduling any heartbeat when registration is
    /// refused or errors.
    pub async fn start(&self, handler: ElectionHandler) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if !self.client.register(&self.voter_id).await? {
            return Err(Error::RegistrationRejected {
                address: self.address().to_string(),
                reason: "server refused registration".into(),
            });
        }

        self.operational.send_replace(true);
        tracing::info!("Registered with {}, heartbeating every {:?}", self.address(), self.period);

        self.tracker.spawn(heartbeat_loop(
            Arc::clone(&self.client),
            self.voter_id.clone(),
            self.period,
            self.cancel.clone(),
            handler,
        ));
        Ok(())
    }

    /// Whether registration succeeded and heartbeats were scheduled
    pub fn is_operational(&self) -> bool {
        *self.operational.borrow()
    }

    /// Wait until the monitor is operational; fails if it is closed first
    pub async fn operational(&self) -> Result<()> {
        let mut rx = self.operational.subscribe();
        tokio::select! {
            result = rx.wait_for(|ready| *ready) => {
                result.map(|_| ()).map_err(|_| Error::Cancelled)
            }
            _ = self.cancel.cancelled() => {
                if self.is_operational() {
                    Ok(())
                } else {
                    Err(Error::Cancelled)
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the heartbeat task and close the connection.
    ///
    /// Does not wait for an in-flight heartbeat; safe to call repeatedly.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.client.close().await;
    }
}

impl std::fmt::Debug for PeerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerMonitor")
            .field("address", &self.address())
            .field("operational", &self.is_operational())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn heartbeat_loop(
    client: Arc<dyn PeerClient>,
    voter_id: String,
    period: Duration,
    cancel: CancellationToken,
    handler: ElectionHandler,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = client.heartbeat(&voter_id) => result,
        };

        match result {
            Ok(0) => {
                tracing::trace!("Heartbeat to {} ok", client.address());
            }
            Ok(term) => {
                tracing::debug!("{} requests a vote for term {}", client.address(), term);
                handler(Arc::clone(&client)).await;
            }
            Err(e) => {
                match &e {
                    Error::ProtocolViolation { .. } => {
                        tracing::error!("Unexpected heartbeat state from {}: {}", client.address(), e);
                    }
                    Error::NotRegistered(_) => {
                        tracing::warn!("{} no longer recognises this voter", client.address());
                    }
                    e if e.is_disconnect() => {
                        tracing::warn!("Heartbeat to {} failed: {}", client.address(), e);
                    }
                    _ => {
                        tracing::error!("Unexpected heartbeat failure from {}: {}", client.address(), e);
                    }
                }
                client.close().await;
                if !cancel.is_cancelled() {
                    handler(Arc::clone(&client)).await;
                }
                break;
            }
        }
    }

    tracing::debug!("Heartbeat loop for {} stopped", client.address());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePeer;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn recording_handler() -> (ElectionHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: ElectionHandler =
            Arc::new(move |peer: Arc<dyn PeerClient>| -> BoxFuture<'static, ()> {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(peer.address().to_string());
                })
            });
        (handler, rx)
    }

    fn monitor(peer: &Arc<FakePeer>, root: &CancellationToken, tracker: &TaskTracker) -> PeerMonitor {
        PeerMonitor::new(
            peer.clone(),
            "voter".to_string(),
            Duration::from_millis(10),
            root,
            tracker,
        )
    }

    #[tokio::test]
    async fn test_registration_failure_fails_fast() {
        let peer = FakePeer::active("localhost:1111");
        peer.set_accept_registration(false);
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();

        let m = monitor(&peer, &root, &tracker);
        let (handler, _rx) = recording_handler();

        assert!(m.start(handler).await.is_err());
        assert!(!m.is_operational());
        assert!(tracker.is_empty());
        assert_eq!(peer.heartbeat_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_heartbeats_raise_no_event() {
        let peer = FakePeer::active("localhost:1111");
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();

        let m = monitor(&peer, &root, &tracker);
        let (handler, mut rx) = recording_handler();
        m.start(handler).await.unwrap();
        assert!(m.is_operational());
        m.operational().await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(peer.heartbeat_count() >= 2);
        assert!(rx.try_recv().is_err());
        m.close().await;
    }

    #[tokio::test]
    async fn test_election_raises_event() {
        let peer = FakePeer::active("localhost:1111");
        peer.set_heartbeat(4);
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();

        let m = monitor(&peer, &root, &tracker);
        let (handler, mut rx) = recording_handler();
        m.start(handler).await.unwrap();

        let address = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(address, "localhost:1111");
        assert!(peer.is_voting());
        m.close().await;
    }

    #[tokio::test]
    async fn test_failure_closes_and_raises_event() {
        let peer = FakePeer::active("localhost:1111");
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();

        let m = monitor(&peer, &root, &tracker);
        let (handler, mut rx) = recording_handler();
        m.start(handler).await.unwrap();

        peer.fail_heartbeats();
        let address = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(address, "localhost:1111");
        assert!(!peer.is_connected());

        // The loop stops after a failure
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_heartbeats() {
        let peer = FakePeer::active("localhost:1111");
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();
        let events = Arc::new(Mutex::new(0usize));

        let m = monitor(&peer, &root, &tracker);
        let counter = events.clone();
        let handler: ElectionHandler =
            Arc::new(move |_peer: Arc<dyn PeerClient>| -> BoxFuture<'static, ()> {
                let counter = counter.clone();
                Box::pin(async move {
                    *counter.lock().unwrap() += 1;
                })
            });
        m.start(handler).await.unwrap();

        m.close().await;
        m.close().await;
        assert!(m.is_closed());
        assert!(!peer.is_connected());

        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
        assert_eq!(*events.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_before_registration_is_not_operational() {
        let peer = FakePeer::passive("localhost:2222");
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();

        let m = monitor(&peer, &root, &tracker);
        m.close().await;
        assert!(matches!(m.operational().await, Err(Error::Cancelled)));

        let (handler, _rx) = recording_handler();
        assert!(matches!(m.start(handler).await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_loop() {
        let peer = FakePeer::active("localhost:1111");
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();

        let m = monitor(&peer, &root, &tracker);
        let (handler, _rx) = recording_handler();
        m.start(handler).await.unwrap();

        root.cancel();
        assert!(m.is_closed());
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
    }
}
