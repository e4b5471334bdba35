//! [`CockpitServer`] – the WebSocket endpoint the head-unit UI connects to.
//!
//! Listens on `0.0.0.0:8000` (configurable via [`CockpitServer::with_port`]).
//! Every accepted connection:
//!
//! 1. triggers the refresh broadcast, so the UI receives every Service's
//!    current state before any of its commands is dispatched;
//! 2. runs a *producer* that polls the Event Queue and writes one text frame
//!    per event, and a *consumer* that routes inbound command frames through
//!    the [`CommandDispatch`] table;
//! 3. ends as soon as either side sees the socket close.  Services are not
//!    affected and keep queueing for the next connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pilot_middleware::{CommandDispatch, EventReceiver, Refresh};
use pilot_types::PilotError;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default TCP port for the UI WebSocket.
pub const DEFAULT_PORT: u16 = 8000;

/// How long the producer sleeps when the queue is empty.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

struct Shared {
    events: EventReceiver,
    dispatch: Arc<CommandDispatch>,
    refresh: Arc<dyn Refresh>,
    poll_interval: Duration,
}

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

/// Bridges the Event Queue and the Command Dispatch Table to UI clients.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use pilot_middleware::{CommandDispatch, EventQueue, Refresh};
/// use pilot_cockpit::CockpitServer;
///
/// struct Nothing;
/// impl Refresh for Nothing {
///     fn refresh_all(&self) {}
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let (_tx, rx) = EventQueue::new().split();
///     CockpitServer::new(rx, CommandDispatch::new(), Arc::new(Nothing))
///         .run()
///         .await
///         .expect("cockpit server failed");
/// }
/// ```
pub struct CockpitServer {
    shared: Shared,
    port: u16,
}

impl CockpitServer {
    pub fn new(events: EventReceiver, dispatch: CommandDispatch, refresh: Arc<dyn Refresh>) -> Self {
        Self {
            shared: Shared {
                events,
                dispatch: Arc::new(dispatch),
                refresh,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Override the producer's empty-queue sleep (builder-style).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.shared.poll_interval = interval;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:<port>` and serve forever.
    ///
    /// # Errors
    ///
    /// [`PilotError::Io`] if the listener cannot bind.
    pub async fn run(self) -> Result<(), PilotError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PilotError::Io(format!("websocket bind error on {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), PilotError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "UI websocket listening");
        }
        let shared = Arc::new(self.shared);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, shared).await {
                            warn!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept error"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) -> Result<(), PilotError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| PilotError::Io(format!("websocket handshake from {peer}: {e}")))?;
    let session = Uuid::new_v4();
    info!(%peer, %session, "UI connected");

    // Control messages to workers may block briefly on a pipe write.
    let refresh = Arc::clone(&shared.refresh);
    if let Err(e) = tokio::task::spawn_blocking(move || refresh.refresh_all()).await {
        error!(%session, error = %e, "refresh broadcast failed");
    }

    let (sink, source) = ws.split();
    tokio::select! {
        () = produce(sink, &shared, session) => debug!(%session, "producer finished"),
        () = consume(source, &shared, session) => debug!(%session, "consumer finished"),
    }
    info!(%peer, %session, "UI disconnected");
    Ok(())
}

/// Event Queue → socket.
async fn produce(mut sink: WsSink, shared: &Shared, session: Uuid) {
    loop {
        if !shared.events.has_pending() {
            tokio::time::sleep(shared.poll_interval).await;
            continue;
        }
        let Some(event) = shared.events.pop() else {
            continue;
        };
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(%session, tag = %event.tag, error = %e, "event not serialisable");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            warn!(%session, tag = %event.tag, error = %e, "socket closed, event lost");
            break;
        }
    }
}

/// Socket → Command Dispatch Table.
async fn consume(mut source: WsSource, shared: &Shared, session: Uuid) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // Handlers write to worker pipes; frames stay in arrival order.
                let dispatch = Arc::clone(&shared.dispatch);
                let routed = tokio::task::spawn_blocking(move || handle_command_frame(&dispatch, text.as_str()));
                if let Err(e) = routed.await {
                    error!(%session, error = %e, "command dispatch panicked");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%session, error = %e, "socket read failed");
                break;
            }
        }
    }
}

/// Route one inbound frame.  Failures are logged and the frame dropped; the
/// connection always stays open.
pub(crate) fn handle_command_frame(dispatch: &CommandDispatch, text: &str) {
    match dispatch.dispatch_frame(text) {
        Ok(tag) => debug!(%tag, "command dispatched"),
        Err(e) => warn!(error = %e, frame = %text, "command dropped"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
