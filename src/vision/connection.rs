//! Vision Connection Manager
//!
//! Owns the persistent WebSocket to the inference server. At most one socket is
//! live at a time; when it closes, a single reconnection attempt is scheduled
//! after a fixed delay. Dropping the manager closes the socket and cancels any
//! pending reconnection.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::protocol::{Command, RawUnit};

/// Lifecycle of the underlying socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events emitted by the connection, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    /// Raw unit, handed off without interpretation
    Message(RawUnit),
    Error(String),
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket not connected")]
    NotConnected,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The streaming link as seen by the session
pub trait StreamLink {
    /// Open a connection unless one is already open or connecting.
    /// Returns whether a new attempt was started.
    fn connect(&self) -> bool;

    fn is_open(&self) -> bool;

    /// Enqueue a command for transmission. Success does not mean delivery.
    fn send(&self, command: &Command) -> Result<(), ConnectionError>;

    /// Close the link for good
    fn shutdown(&self);
}

pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    reconnect_delay: Duration,
    events: mpsc::Sender<ConnectionEvent>,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    /// Bumped on every connect; stale socket tasks compare against it
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    socket_task: Option<AbortHandle>,
    reconnect_task: Option<AbortHandle>,
    connect_attempts: u64,
    shut_down: bool,
}

impl ConnectionManager {
    /// Create a manager and the receiver for its events. Nothing is opened
    /// until [`connect`](Self::connect) is called.
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, event_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            url: url.into(),
            reconnect_delay,
            events,
            shared: Mutex::new(Shared {
                state: ConnectionState::Closed,
                generation: 0,
                outgoing: None,
                socket_task: None,
                reconnect_task: None,
                connect_attempts: 0,
                shut_down: false,
            }),
        });
        (Self { inner }, event_rx)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().state
    }

    /// Number of connection attempts issued so far (initial + reconnects)
    pub fn connect_attempts(&self) -> u64 {
        self.inner.shared.lock().connect_attempts
    }

    #[cfg(test)]
    pub fn has_pending_reconnect(&self) -> bool {
        self.inner.shared.lock().reconnect_task.is_some()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StreamLink for ConnectionManager {
    /// Open a connection unless one is already open or connecting.
    ///
    /// A pending scheduled reconnection is cancelled and superseded by this
    /// call. Returns whether a new attempt was started. Must be called from
    /// within a Tokio runtime.
    fn connect(&self) -> bool {
        self.inner.connect()
    }

    /// Close the socket and cancel any pending reconnection. Idempotent; no
    /// further connections are made afterwards.
    fn shutdown(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.shut_down {
            return;
        }
        shared.shut_down = true;

        if let Some(pending) = shared.reconnect_task.take() {
            pending.abort();
        }

        match shared.state {
            ConnectionState::Open => {
                // Dropping the sender makes the socket task send a close frame
                shared.state = ConnectionState::Closing;
                shared.outgoing = None;
            }
            ConnectionState::Connecting => {
                if let Some(task) = shared.socket_task.take() {
                    task.abort();
                }
                shared.state = ConnectionState::Closed;
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }

        info!("Vision connection shut down");
    }

    fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn send(&self, command: &Command) -> Result<(), ConnectionError> {
        let json = command.to_json()?;
        let shared = self.inner.shared.lock();
        match (shared.state, shared.outgoing.as_ref()) {
            (ConnectionState::Open, Some(tx)) => {
                debug!("Sending command: {}", json);
                tx.send(Message::Text(json))
                    .map_err(|_| ConnectionError::NotConnected)
            }
            _ => Err(ConnectionError::NotConnected),
        }
    }
}

impl Inner {
    fn connect(self: &Arc<Self>) -> bool {
        let mut shared = self.shared.lock();
        if shared.shut_down {
            return false;
        }
        if matches!(
            shared.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            debug!("Connect ignored: connection is {:?}", shared.state);
            return false;
        }

        if let Some(pending) = shared.reconnect_task.take() {
            pending.abort();
        }

        shared.state = ConnectionState::Connecting;
        shared.generation += 1;
        shared.connect_attempts += 1;
        let generation = shared.generation;

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move { inner.run_socket(generation).await });
        shared.socket_task = Some(task.abort_handle());
        true
    }

    async fn run_socket(self: Arc<Self>, generation: u64) {
        info!("Connecting to vision server: {}", self.url);

        match connect_async(self.url.as_str()).await {
            Ok((ws_stream, _)) => {
                let (mut write, mut read) = ws_stream.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

                {
                    let mut shared = self.shared.lock();
                    if shared.generation != generation || shared.shut_down {
                        return;
                    }
                    shared.state = ConnectionState::Open;
                    shared.outgoing = Some(out_tx);
                }

                info!("Connected to vision server");
                self.emit(ConnectionEvent::Opened).await;

                loop {
                    tokio::select! {
                        outgoing = out_rx.recv() => match outgoing {
                            Some(msg) => {
                                if let Err(e) = write.send(msg).await {
                                    error!("WebSocket send failed: {}", e);
                                    self.emit(ConnectionEvent::Error(e.to_string())).await;
                                    break;
                                }
                            }
                            None => {
                                let _ = write.send(Message::Close(None)).await;
                                break;
                            }
                        },
                        incoming = read.next() => match incoming {
                            Some(Ok(Message::Binary(data))) => {
                                self.emit(ConnectionEvent::Message(RawUnit::Binary(Bytes::from(data))))
                                    .await;
                            }
                            Some(Ok(Message::Text(text))) => {
                                self.emit(ConnectionEvent::Message(RawUnit::Text(text))).await;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!("Vision server closed connection: {:?}", frame);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("WebSocket error: {}", e);
                                self.emit(ConnectionEvent::Error(e.to_string())).await;
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", self.url, e);
                self.emit(ConnectionEvent::Error(e.to_string())).await;
            }
        }

        self.handle_closed(generation).await;
    }

    async fn handle_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut shared = self.shared.lock();
            if shared.generation != generation {
                return;
            }
            shared.state = ConnectionState::Closed;
            shared.outgoing = None;
            shared.socket_task = None;
            if !shared.shut_down {
                self.schedule_reconnect(&mut shared);
            }
        }

        info!("Vision connection closed");
        self.emit(ConnectionEvent::Closed).await;
    }

    fn schedule_reconnect(self: &Arc<Self>, shared: &mut Shared) {
        if shared.reconnect_task.is_some() {
            debug!("Reconnect already scheduled");
            return;
        }

        let delay = self.reconnect_delay;
        info!("Reconnecting in {:?}", delay);

        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.shared.lock().reconnect_task = None;
            info!("Attempting to reconnect...");
            inner.connect();
        });
        shared.reconnect_task = Some(task.abort_handle());
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Connection event receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;

    type ServerSocket = WebSocketStream<TcpStream>;

    /// Loopback WebSocket server. `on_accept` receives the zero-based index of
    /// each accepted connection.
    async fn start_server<F, Fut>(on_accept: F) -> (String, Arc<AtomicUsize>)
    where
        F: Fn(usize, ServerSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    tokio::spawn(on_accept(index, ws));
                }
            }
        });

        (url, accepted)
    }

    async fn hold(mut ws: ServerSocket) {
        while let Some(Ok(_)) = ws.next().await {}
    }

    async fn next_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let (url, accepted) = start_server(|_, ws| hold(ws)).await;
        let (manager, mut events) = ConnectionManager::new(url, Duration::from_secs(3));

        assert!(manager.connect());
        assert!(!manager.connect());
        assert!(!manager.connect());
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(!manager.connect());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_open_connection() {
        let (received_tx, mut received_rx) = mpsc::unbounded_channel::<String>();
        let (url, _) = start_server(move |_, mut ws| {
            let received_tx = received_tx.clone();
            async move {
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        let _ = received_tx.send(text);
                    }
                }
            }
        })
        .await;

        let (manager, mut events) = ConnectionManager::new(url, Duration::from_secs(3));
        assert!(!manager.is_open());
        assert!(matches!(
            manager.send(&Command::Stats),
            Err(ConnectionError::NotConnected)
        ));

        manager.connect();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
        manager.send(&Command::Stats).unwrap();

        let text = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, r#"{"action":"stats"}"#);
    }

    #[tokio::test]
    async fn test_units_delivered_in_order() {
        let (url, _) = start_server(|_, mut ws| async move {
            ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
            ws.send(Message::Text(r#"{"type":"stats"}"#.to_string()))
                .await
                .unwrap();
            ws.send(Message::Binary(vec![4])).await.unwrap();
            hold(ws).await;
        })
        .await;

        let (manager, mut events) = ConnectionManager::new(url, Duration::from_secs(3));
        manager.connect();

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Message(RawUnit::Binary(Bytes::from_static(&[1, 2, 3])))
        );
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Message(RawUnit::Text(r#"{"type":"stats"}"#.to_string()))
        );
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Message(RawUnit::Binary(Bytes::from_static(&[4])))
        );
    }

    #[tokio::test]
    async fn test_reconnect_scheduled_once_after_close() {
        // First connection is closed by the server, later ones are held open
        let (url, accepted) = start_server(|index, mut ws| async move {
            if index == 0 {
                let _ = ws.close(None).await;
            } else {
                hold(ws).await;
            }
        })
        .await;

        let delay = Duration::from_millis(300);
        let (manager, mut events) = ConnectionManager::new(url, delay);
        manager.connect();

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(manager.has_pending_reconnect());

        // Nothing reconnects before the delay has elapsed
        tokio::time::sleep(delay / 3).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connect_attempts(), 1);

        // A second close notification for the same socket must not add a timer
        let generation = manager.inner.shared.lock().generation;
        manager.inner.handle_closed(generation).await;
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed);
        assert_eq!(manager.connect_attempts(), 1);

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);
        assert_eq!(manager.connect_attempts(), 2);
        assert!(!manager.has_pending_reconnect());

        tokio::time::sleep(delay * 2).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(manager.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_then_shutdown_cancels_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let delay = Duration::from_millis(200);
        let (manager, mut events) = ConnectionManager::new(url, delay);
        manager.connect();

        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Error(_)
        ));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed);
        assert!(manager.has_pending_reconnect());

        manager.shutdown();
        assert!(!manager.has_pending_reconnect());

        tokio::time::sleep(delay * 2).await;
        assert_eq!(manager.connect_attempts(), 1);
        assert!(!manager.connect());
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_socket() {
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel::<()>();
        let (url, accepted) = start_server(move |_, ws| {
            let closed_tx = closed_tx.clone();
            async move {
                hold(ws).await;
                let _ = closed_tx.send(());
            }
        })
        .await;

        let delay = Duration::from_millis(100);
        let (manager, mut events) = ConnectionManager::new(url, delay);
        manager.connect();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Opened);

        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
            .await
            .expect("server never saw the socket close");

        assert_eq!(next_event(&mut events).await, ConnectionEvent::Closed);
        tokio::time::sleep(delay * 3).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }
}
