//! Push channel transport.
//!
//! One long-lived connection per process, owned by a background worker.
//! The worker reconnects with exponential backoff, and on every fresh
//! connection re-joins all active rooms *before* announcing `Ready` or
//! reading any frame: the server does not replay events a client missed.
//!
//! Consumers see only `Ready`/`Disconnected` transitions and messages;
//! transport errors are logged here and never surface.

pub mod connector;
pub mod error;
pub mod frame;
pub mod rooms;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub use connector::{Connector, Link, RemoteEnd, WsConnector};
pub use error::TransportError;
pub use frame::{Frame, JOIN_AGENCY, LEAVE_AGENCY};
pub use rooms::RoomRegistry;

/// Buffer size for transport events delivered to the synchronizer.
const EVENT_BUFFER_SIZE: usize = 256;

/// Reconnect delay policy.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (0-based): base doubled per
    /// attempt, capped at `max`, plus random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exponential.min(self.max);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// What the transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connected and every room in `rooms` re-joined. `reconnect` is false
    /// only for the first connection of the process.
    Ready { rooms: Vec<String>, reconnect: bool },
    /// The connection dropped; a reconnect is already scheduled.
    Disconnected,
    /// A named server event.
    Message { name: String, payload: Value },
}

#[derive(Debug)]
enum Command {
    Join(String),
    Leave(String),
    Close,
}

/// Handle to the push channel worker.
pub struct PushTransport {
    commands: mpsc::UnboundedSender<Command>,
    rooms: RoomRegistry,
    connected: watch::Receiver<bool>,
}

impl PushTransport {
    /// Spawn the connection worker. Events arrive on the returned receiver.
    pub fn connect(
        connector: Arc<dyn Connector>,
        backoff: Backoff,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (connected_tx, connected_rx) = watch::channel(false);

        let worker = Worker {
            connector,
            backoff,
            commands: command_rx,
            events: event_tx,
            connected: connected_tx,
            rooms: RoomRegistry::default(),
            sessions: 0,
        };
        tokio::spawn(worker.run());

        (
            Self {
                commands: command_tx,
                rooms: RoomRegistry::default(),
                connected: connected_rx,
            },
            event_rx,
        )
    }

    /// Join a room. No-op if already joined.
    pub fn join_scope(&mut self, scope_id: &str) -> bool {
        if !self.rooms.join(scope_id) {
            return false;
        }
        self.send(Command::Join(scope_id.to_string()));
        true
    }

    /// Leave a room. No-op if not joined.
    pub fn leave_scope(&mut self, scope_id: &str) -> bool {
        if !self.rooms.leave(scope_id) {
            return false;
        }
        self.send(Command::Leave(scope_id.to_string()));
        true
    }

    pub fn joined_scopes(&self) -> Vec<String> {
        self.rooms.to_vec()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch connection state transitions.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    /// Stop the worker and drop the connection.
    pub fn close(&self) {
        self.send(Command::Close);
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Push transport worker already stopped");
        }
    }
}

enum SessionEnd {
    Closed,
    Lost,
}

struct Worker {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<TransportEvent>,
    connected: watch::Sender<bool>,
    rooms: RoomRegistry,
    sessions: u64,
}

impl Worker {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            let connector = Arc::clone(&self.connector);
            let result = tokio::select! {
                result = connector.connect() => result,
                _ = self.idle(None) => break,
            };

            match result {
                Ok(link) => {
                    attempt = 0;
                    match self.session(link).await {
                        SessionEnd::Closed => break,
                        SessionEnd::Lost => {
                            self.connected.send_replace(false);
                            warn!("Push channel lost, reconnecting");
                            if self.events.send(TransportEvent::Disconnected).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Push channel connect failed");
                }
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
            if self.idle(Some(delay)).await {
                break;
            }
        }

        self.connected.send_replace(false);
        info!("Push transport stopped");
    }

    /// Track room commands while not connected. Returns `true` once closed;
    /// with a `wait` it also returns `false` when the wait elapses.
    async fn idle(&mut self, wait: Option<Duration>) -> bool {
        let timer = async {
            match wait {
                Some(wait) => tokio::time::sleep(wait).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return false,
                command = self.commands.recv() => match command {
                    Some(Command::Join(room)) => {
                        self.rooms.join(&room);
                    }
                    Some(Command::Leave(room)) => {
                        self.rooms.leave(&room);
                    }
                    Some(Command::Close) | None => return true,
                },
            }
        }
    }

    async fn session(&mut self, mut link: Link) -> SessionEnd {
        let rooms = self.rooms.to_vec();
        for room in &rooms {
            if link.outgoing.send(Frame::join(room)).await.is_err() {
                return SessionEnd::Lost;
            }
        }

        self.sessions += 1;
        self.connected.send_replace(true);
        info!(rooms = rooms.len(), session = self.sessions, "Push channel ready");
        let ready = TransportEvent::Ready {
            rooms,
            reconnect: self.sessions > 1,
        };
        if self.events.send(ready).await.is_err() {
            return SessionEnd::Closed;
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let frame = match command {
                        Some(Command::Join(room)) => self.rooms.join(&room).then(|| Frame::join(&room)),
                        Some(Command::Leave(room)) => self.rooms.leave(&room).then(|| Frame::leave(&room)),
                        Some(Command::Close) | None => return SessionEnd::Closed,
                    };
                    if let Some(frame) = frame {
                        if link.outgoing.send(frame).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                }
                frame = link.incoming.recv() => match frame {
                    Some(frame) => {
                        let event = TransportEvent::Message {
                            name: frame.event,
                            payload: frame.data,
                        };
                        if self.events.send(event).await.is_err() {
                            return SessionEnd::Closed;
                        }
                    }
                    None => return SessionEnd::Lost,
                },
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryConnector;
    use super::*;
    use serde_json::json;

    fn no_jitter() -> Backoff {
        Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
            jitter: Duration::ZERO,
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        events.recv().await.expect("transport event")
    }

    async fn joined_rooms(remote: &mut RemoteEnd, count: usize) -> Vec<String> {
        let mut rooms = Vec::new();
        while rooms.len() < count {
            let frame = remote.from_client.recv().await.expect("frame from client");
            assert_eq!(frame.event, JOIN_AGENCY);
            rooms.push(frame.room().expect("room").to_string());
        }
        rooms.sort();
        rooms
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = no_jitter();
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(10), Duration::from_secs(2));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..50 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_rooms_joined_and_messages_delivered() {
        let (connector, mut servers) = MemoryConnector::new(0);
        let (mut transport, mut events) = PushTransport::connect(Arc::new(connector), no_jitter());
        assert!(transport.join_scope("s1"));
        assert!(!transport.join_scope("s1"));

        let mut remote = servers.recv().await.expect("connection");
        assert_eq!(joined_rooms(&mut remote, 1).await, vec!["s1".to_string()]);

        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Ready { reconnect: false, .. }
        ));
        assert!(transport.is_connected());

        remote
            .to_client
            .send(Frame::new("product:availability-changed", json!({"entityId": "p1"})))
            .await
            .expect("server send");
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Message {
                name: "product:availability-changed".to_string(),
                payload: json!({"entityId": "p1"}),
            }
        );
    }

    #[tokio::test]
    async fn test_leave_sends_frame_once() {
        let (connector, mut servers) = MemoryConnector::new(0);
        let (mut transport, mut events) = PushTransport::connect(Arc::new(connector), no_jitter());
        let mut remote = servers.recv().await.expect("connection");
        assert!(matches!(next_event(&mut events).await, TransportEvent::Ready { .. }));

        transport.join_scope("a1");
        assert!(transport.leave_scope("a1"));
        assert!(!transport.leave_scope("a1"));
        assert!(!transport.leave_scope("never"));

        let join = remote.from_client.recv().await.expect("join");
        assert_eq!(join, Frame::join("a1"));
        let leave = remote.from_client.recv().await.expect("leave");
        assert_eq!(leave, Frame::leave("a1"));
        assert!(transport.joined_scopes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rejoins_every_room_before_ready() {
        let (connector, mut servers) = MemoryConnector::new(0);
        let (mut transport, mut events) = PushTransport::connect(Arc::new(connector), no_jitter());
        transport.join_scope("s1");
        transport.join_scope("s2");

        let mut first = servers.recv().await.expect("first connection");
        assert_eq!(
            joined_rooms(&mut first, 2).await,
            vec!["s1".to_string(), "s2".to_string()]
        );
        assert!(matches!(next_event(&mut events).await, TransportEvent::Ready { .. }));

        // Server drops the connection.
        drop(first);
        assert_eq!(next_event(&mut events).await, TransportEvent::Disconnected);

        let mut second = servers.recv().await.expect("second connection");
        match next_event(&mut events).await {
            TransportEvent::Ready { rooms, reconnect } => {
                assert!(reconnect);
                assert_eq!(rooms, vec!["s1".to_string(), "s2".to_string()]);
            }
            other => panic!("expected Ready, got {:?}", other),
        }
        // Both joins were written before Ready was announced.
        let mut rejoined = Vec::new();
        while let Ok(frame) = second.from_client.try_recv() {
            rejoined.push(frame.room().expect("room").to_string());
        }
        assert_eq!(rejoined, vec!["s1".to_string(), "s2".to_string()]);

        second
            .to_client
            .send(Frame::new("agency:status-changed", json!({"entityId": "s2"})))
            .await
            .expect("server send");
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Message { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_are_retried_silently() {
        let (connector, mut servers) = MemoryConnector::new(3);
        let (transport, mut events) = PushTransport::connect(Arc::new(connector), no_jitter());

        let _remote = servers.recv().await.expect("eventual connection");
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Ready { reconnect: false, .. }
        ));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_close_stops_worker() {
        let (connector, mut servers) = MemoryConnector::new(0);
        let (transport, mut events) = PushTransport::connect(Arc::new(connector), no_jitter());
        let _remote = servers.recv().await.expect("connection");
        assert!(matches!(next_event(&mut events).await, TransportEvent::Ready { .. }));

        transport.close();
        assert_eq!(events.recv().await, None);
        assert!(!transport.is_connected());
    }
}
