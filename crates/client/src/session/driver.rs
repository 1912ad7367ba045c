//! Session driver task: connect, pump frames, reconnect.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use platforma_shared::stomp::headers;
use platforma_shared::{
    Command, Frame, FrameDecoder, FrameError, HeartBeat, Incoming, MAX_FRAME_SIZE,
};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, Interval, MissedTickBehavior};

use super::backoff::{ReconnectBackoff, ReconnectPolicy};
use super::{run_guarded, InboundFrame, Outbound, SessionInner, SessionState};
use crate::config::RealtimeConfig;
use crate::credential::Credential;
use crate::transport::{Connector, TextSink, TextStream};

pub(crate) type ConnectHook = Arc<dyn Fn() + Send + Sync>;

/// How long a graceful close waits for the broker's DISCONNECT receipt.
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Why a connection ended.
enum Exit {
    Cancelled,
    Lost(String),
}

pub(crate) struct SessionDriver {
    inner: Arc<SessionInner>,
    connector: Arc<dyn Connector>,
    credential: Credential,
    heartbeat: HeartBeat,
    connect_timeout: Option<Duration>,
    reconnect: ReconnectPolicy,
    on_connected: ConnectHook,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl SessionDriver {
    pub(crate) fn new(
        inner: Arc<SessionInner>,
        connector: Arc<dyn Connector>,
        credential: Credential,
        config: &RealtimeConfig,
        on_connected: ConnectHook,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        Self {
            inner,
            connector,
            credential,
            heartbeat: config.heartbeat,
            connect_timeout: config.connect_timeout,
            reconnect: config.reconnect,
            on_connected,
            outbound,
        }
    }

    pub(crate) async fn run(mut self) {
        let session = self.inner.id();
        let cancel = self.inner.cancel.clone();
        let mut backoff = ReconnectBackoff::new(self.reconnect);

        loop {
            self.inner.set_state(SessionState::Connecting);

            match self.connection(&mut backoff).await {
                Exit::Cancelled => break,
                Exit::Lost(reason) => {
                    let dropped = self.inner.connection_lost();
                    tracing::warn!(session, reason = %reason, subscriptions = dropped, "STOMP connection lost");
                }
            }

            let Some(delay) = backoff.next_delay_and_advance() else {
                tracing::error!(
                    session,
                    attempts = backoff.attempts(),
                    "Reconnect attempts exhausted, giving up"
                );
                self.inner.set_state(SessionState::Failed);
                return;
            };

            self.inner.set_state(SessionState::Reconnecting);
            tracing::info!(
                session,
                attempt = backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.inner.connection_lost();
        self.inner.set_state(SessionState::Disconnected);
        tracing::debug!(session, "Session driver stopped");
    }

    /// One connection, from opening the transport until it ends.
    async fn connection(&mut self, backoff: &mut ReconnectBackoff) -> Exit {
        let session = self.inner.id();
        let cancel = self.inner.cancel.clone();

        let opened = tokio::select! {
            _ = cancel.cancelled() => return Exit::Cancelled,
            result = self.connector.connect() => result,
        };
        let connection = match opened {
            Ok(connection) => connection,
            Err(e) => return Exit::Lost(e.to_string()),
        };
        let mut sink = connection.sink;
        let mut stream = connection.stream;
        tracing::debug!(session, url = %connection.url, "Transport open, sending CONNECT");

        let connect = Frame::connect(&self.heartbeat.header_value())
            .with_header(headers::AUTHORIZATION, self.credential.bearer());
        if let Err(e) = sink.send(connect.encode()).await {
            return Exit::Lost(e.to_string());
        }

        let mut decoder = FrameDecoder::new();
        let connect_timeout = self.connect_timeout;
        let handshake = async {
            match connect_timeout {
                Some(limit) => timeout(limit, await_connected(&mut stream, &mut decoder))
                    .await
                    .unwrap_or_else(|_| Err("timed out waiting for CONNECTED".to_string())),
                None => await_connected(&mut stream, &mut decoder).await,
            }
        };
        let handshake = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return Exit::Cancelled;
            }
            result = handshake => result,
        };
        let (connected, leftover) = match handshake {
            Ok(ok) => ok,
            Err(reason) => {
                let _ = sink.close().await;
                return Exit::Lost(reason);
            }
        };

        let server_heartbeat = match connected.header(headers::HEART_BEAT) {
            Some(value) => HeartBeat::parse(value).unwrap_or_else(|e| {
                tracing::warn!(session, error = %e, "Ignoring invalid heart-beat header");
                HeartBeat::DISABLED
            }),
            None => HeartBeat::DISABLED,
        };
        let (send_every, expect_within) = self.heartbeat.negotiate(&server_heartbeat);

        let generation = self.inner.connection_established();
        backoff.reset();
        tracing::info!(
            session,
            generation,
            version = connected.header(headers::VERSION).unwrap_or("1.0"),
            server = connected.header(headers::SERVER).unwrap_or("unknown"),
            "STOMP session connected"
        );

        if cancel.is_cancelled() {
            let _ = sink.close().await;
            return Exit::Cancelled;
        }
        let hook = Arc::clone(&self.on_connected);
        run_guarded("Connect hook", session, || hook());

        for item in leftover {
            self.handle_incoming(item);
        }

        let mut beats = send_every.map(|every| {
            let mut beats = interval_at(Instant::now() + every, every);
            beats.set_missed_tick_behavior(MissedTickBehavior::Delay);
            beats
        });
        // Silence longer than twice the negotiated interval means the broker is gone.
        let silence_limit = expect_within.map(|within| within * 2);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    close_gracefully(&mut sink, &mut stream, &mut decoder, session).await;
                    return Exit::Cancelled;
                }

                Some(out) = self.outbound.recv() => {
                    if out.generation != generation {
                        tracing::debug!(
                            session,
                            command = out.frame.command.as_str(),
                            "Discarding frame from a previous connection"
                        );
                        continue;
                    }
                    if let Err(e) = sink.send(out.frame.encode()).await {
                        return Exit::Lost(e.to_string());
                    }
                }

                _ = next_beat(&mut beats) => {
                    if let Err(e) = sink.send("\n".to_string()).await {
                        return Exit::Lost(e.to_string());
                    }
                }

                item = stream.next() => match item {
                    Some(Ok(text)) => {
                        last_inbound = Instant::now();
                        for incoming in decoder.push(&text) {
                            self.handle_incoming(incoming);
                        }
                        if decoder.is_oversized() {
                            let _ = sink.close().await;
                            return Exit::Lost(oversized(&decoder));
                        }
                    }
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("transport closed".to_string()),
                },

                _ = silence(silence_limit.map(|limit| last_inbound + limit)) => {
                    let _ = sink.close().await;
                    return Exit::Lost("no heart-beat from broker".to_string());
                }
            }
        }
    }

    fn handle_incoming(&self, incoming: Result<Incoming, FrameError>) {
        let session = self.inner.id();
        match incoming {
            Ok(Incoming::HeartBeat) => tracing::trace!(session, "Heart-beat received"),
            Ok(Incoming::Frame(frame)) => match frame.command {
                Command::Message => match InboundFrame::from_message(frame) {
                    Some(inbound) => self.inner.dispatch(inbound),
                    None => tracing::warn!(session, "MESSAGE without subscription header"),
                },
                Command::Error => tracing::warn!(
                    session,
                    message = frame.header(headers::MESSAGE).unwrap_or_default(),
                    body = %frame.body,
                    "Broker sent ERROR frame"
                ),
                Command::Receipt => tracing::debug!(
                    session,
                    receipt = frame.header(headers::RECEIPT_ID).unwrap_or_default(),
                    "Receipt"
                ),
                other => tracing::debug!(session, command = other.as_str(), "Ignoring frame"),
            },
            Err(e) => tracing::warn!(session, error = %e, "Skipping malformed frame"),
        }
    }
}

/// Read until CONNECTED. Returns the frame plus whatever was decoded after
/// it in the same payload.
async fn await_connected(
    stream: &mut TextStream,
    decoder: &mut FrameDecoder,
) -> Result<(Frame, Vec<Result<Incoming, FrameError>>), String> {
    while let Some(item) = stream.next().await {
        let text = item.map_err(|e| e.to_string())?;
        let mut decoded = decoder.push(&text).into_iter();
        if decoder.is_oversized() {
            return Err(oversized(decoder));
        }
        while let Some(incoming) = decoded.next() {
            match incoming {
                Ok(Incoming::Frame(frame)) if frame.command == Command::Connected => {
                    return Ok((frame, decoded.collect()));
                }
                Ok(Incoming::Frame(frame)) if frame.command == Command::Error => {
                    let message = frame.header(headers::MESSAGE).unwrap_or_default();
                    return Err(format!("broker refused connection: {message}"));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping malformed frame during handshake"),
            }
        }
    }
    Err("transport closed before CONNECTED".to_string())
}

async fn next_beat(beats: &mut Option<Interval>) {
    match beats {
        Some(beats) => {
            beats.tick().await;
        }
        None => pending().await,
    }
}

async fn silence(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn oversized(decoder: &FrameDecoder) -> String {
    format!(
        "frame exceeds {MAX_FRAME_SIZE} bytes ({} buffered)",
        decoder.buffered()
    )
}

/// Send DISCONNECT and wait (bounded) for its RECEIPT before closing.
/// Anything else the broker sends meanwhile is dropped.
async fn close_gracefully(
    sink: &mut TextSink,
    stream: &mut TextStream,
    decoder: &mut FrameDecoder,
    session: u64,
) {
    let receipt = format!("disconnect-{session}");
    if let Err(e) = sink.send(Frame::disconnect(&receipt).encode()).await {
        tracing::debug!(session, error = %e, "DISCONNECT not sent");
        let _ = sink.close().await;
        return;
    }

    match timeout(RECEIPT_TIMEOUT, await_receipt(stream, decoder, &receipt)).await {
        Ok(true) => tracing::debug!(session, receipt = %receipt, "DISCONNECT acknowledged"),
        Ok(false) => tracing::debug!(session, "Transport closed before DISCONNECT receipt"),
        Err(_) => tracing::debug!(session, "No DISCONNECT receipt, closing anyway"),
    }
    let _ = sink.close().await;
}

async fn await_receipt(stream: &mut TextStream, decoder: &mut FrameDecoder, receipt: &str) -> bool {
    while let Some(Ok(text)) = stream.next().await {
        let acknowledged = decoder.push(&text).into_iter().any(|incoming| {
            matches!(incoming, Ok(Incoming::Frame(frame))
                if frame.command == Command::Receipt
                    && frame.header(headers::RECEIPT_ID) == Some(receipt))
        });
        if acknowledged {
            return true;
        }
        if decoder.is_oversized() {
            return false;
        }
    }
    false
}
