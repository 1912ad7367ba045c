//! In-memory STOMP broker and its connector.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::{SinkExt, StreamExt};
use platforma_shared::stomp::headers;
use platforma_shared::{Command, Frame, FrameDecoder, Incoming};

use crate::transport::{Connector, TransportConnection, TransportError};

struct ServerConnection {
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
    /// Subscription id -> destination.
    subscriptions: HashMap<String, String>,
    connected: bool,
}

impl ServerConnection {
    fn send(&self, frame: Frame) {
        let _ = self.to_client.unbounded_send(Ok(frame.encode()));
    }
}

#[derive(Default)]
struct BrokerState {
    refuse_transport: bool,
    withhold_connected: bool,
    connect_attempts: u32,
    connects: u32,
    next_connection: u64,
    next_message: u64,
    last_connect_headers: Option<Vec<(String, String)>>,
    disconnect_receipts: Vec<String>,
    connections: HashMap<u64, ServerConnection>,
}

impl BrokerState {
    fn route(&mut self, destination: &str, body: &str) -> usize {
        let mut delivered = 0;
        for connection in self.connections.values() {
            for (id, subscribed) in &connection.subscriptions {
                if subscribed != destination {
                    continue;
                }
                self.next_message += 1;
                connection.send(
                    Frame::new(Command::Message)
                        .with_header(headers::DESTINATION, destination)
                        .with_header(headers::SUBSCRIPTION, id.as_str())
                        .with_header(headers::MESSAGE_ID, self.next_message.to_string())
                        .with_header(headers::CONTENT_TYPE, "application/json")
                        .with_body(body),
                );
                delivered += 1;
            }
        }
        delivered
    }
}

/// A broker living in the test process. Every connection made through
/// [`FakeBroker::connector`] is served by it.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            state: Arc::clone(&self.state),
        })
    }

    /// When false, transport connects fail as if the server were down.
    pub fn set_accepting(&self, accepting: bool) {
        self.state().refuse_transport = !accepting;
    }

    /// When true, CONNECT frames are swallowed without a CONNECTED reply.
    pub fn set_withhold_connected(&self, withhold: bool) {
        self.state().withhold_connected = withhold;
    }

    /// Transport connects attempted, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// CONNECT frames answered with CONNECTED.
    pub fn connection_count(&self) -> u32 {
        self.state().connects
    }

    /// Currently open STOMP sessions.
    pub fn open_connections(&self) -> usize {
        self.state()
            .connections
            .values()
            .filter(|c| c.connected)
            .count()
    }

    pub fn last_connect_headers(&self) -> Option<Vec<(String, String)>> {
        self.state().last_connect_headers.clone()
    }

    /// Live subscriptions to `destination` across all connections.
    pub fn subscription_count(&self, destination: &str) -> usize {
        self.state()
            .connections
            .values()
            .flat_map(|c| c.subscriptions.values())
            .filter(|d| d.as_str() == destination)
            .count()
    }

    /// Deliver `body` to every subscriber of `destination`. Returns the
    /// number of MESSAGE frames sent.
    pub fn publish(&self, destination: &str, body: &str) -> usize {
        self.state().route(destination, body)
    }

    /// Send an ERROR frame on every open connection.
    pub fn send_error(&self, message: &str) {
        for connection in self.state().connections.values() {
            connection.send(Frame::new(Command::Error).with_header(headers::MESSAGE, message));
        }
    }

    /// Write `text` verbatim to every open connection.
    pub fn send_raw(&self, text: &str) {
        for connection in self.state().connections.values() {
            let _ = connection.to_client.unbounded_send(Ok(text.to_string()));
        }
    }

    /// Receipt ids of DISCONNECT frames acknowledged so far.
    pub fn disconnect_receipts(&self) -> Vec<String> {
        self.state().disconnect_receipts.clone()
    }

    /// Simulate the network dropping every open connection.
    pub fn drop_connections(&self) {
        let dropped: Vec<_> = self.state().connections.drain().collect();
        for (_, connection) in dropped {
            let _ = connection.to_client.unbounded_send(Err(TransportError::Closed {
                code: 1006,
                reason: "connection dropped".into(),
            }));
        }
    }
}

struct MemoryConnector {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<TransportConnection, TransportError> {
        let (client_tx, server_rx) = mpsc::unbounded::<String>();
        let (server_tx, client_rx) = mpsc::unbounded();

        let id = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.connect_attempts += 1;
            if state.refuse_transport {
                return Err(TransportError::ConnectFailed("connection refused".into()));
            }
            state.next_connection += 1;
            let id = state.next_connection;
            state.connections.insert(
                id,
                ServerConnection {
                    to_client: server_tx,
                    subscriptions: HashMap::new(),
                    connected: false,
                },
            );
            id
        };

        tokio::spawn(serve(Arc::clone(&self.state), id, server_rx));

        Ok(TransportConnection {
            url: format!("memory://broker/{id}"),
            sink: Box::pin(
                client_tx.sink_map_err(|e| TransportError::SendFailed(e.to_string())),
            ),
            stream: Box::pin(client_rx),
        })
    }
}

async fn serve(state: Arc<Mutex<BrokerState>>, id: u64, mut from_client: mpsc::UnboundedReceiver<String>) {
    let mut decoder = FrameDecoder::new();

    while let Some(text) = from_client.next().await {
        for incoming in decoder.push(&text) {
            let Ok(Incoming::Frame(frame)) = incoming else {
                continue;
            };

            let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
            let state = &mut *guard;
            let Some(connection) = state.connections.get_mut(&id) else {
                return;
            };

            match frame.command {
                Command::Connect | Command::Stomp => {
                    state.last_connect_headers = Some(frame.headers.clone());
                    if state.withhold_connected {
                        continue;
                    }
                    connection.connected = true;
                    state.connects += 1;
                    connection.send(
                        Frame::new(Command::Connected)
                            .with_header(headers::VERSION, "1.2")
                            .with_header(headers::HEART_BEAT, "0,0")
                            .with_header(headers::SERVER, "fake-broker"),
                    );
                }
                Command::Subscribe => {
                    if let (Some(sub), Some(destination)) = (
                        frame.header(headers::ID),
                        frame.header(headers::DESTINATION),
                    ) {
                        connection
                            .subscriptions
                            .insert(sub.to_string(), destination.to_string());
                    }
                }
                Command::Unsubscribe => {
                    if let Some(sub) = frame.header(headers::ID) {
                        connection.subscriptions.remove(sub);
                    }
                }
                Command::Send => {
                    if let Some(destination) = frame.header(headers::DESTINATION) {
                        state.route(destination, &frame.body);
                    }
                }
                Command::Disconnect => {
                    if let Some(receipt) = frame.header(headers::RECEIPT) {
                        connection.send(
                            Frame::new(Command::Receipt).with_header(headers::RECEIPT_ID, receipt),
                        );
                        state.disconnect_receipts.push(receipt.to_string());
                    }
                    state.connections.remove(&id);
                    return;
                }
                _ => {}
            }
        }
    }

    // Client closed its side.
    state
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .connections
        .remove(&id);
}
