//! WebSocket transports using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{future, stream, SinkExt, StreamExt};
use platforma_shared::sockjs::{self, SockJsFrame};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;
use url::Url;

use super::{Connector, TextSink, TextStream, TransportConnection, TransportError, TransportKind};
use crate::config::RealtimeConfig;

const SOCKJS_SESSION_ID_LEN: usize = 8;

/// Connects to the broker endpoint, falling back through the configured
/// transports until one opens.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: Url,
    transports: Vec<TransportKind>,
}

impl WebSocketConnector {
    pub fn new(endpoint: Url, transports: Vec<TransportKind>) -> Self {
        Self {
            endpoint,
            transports,
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(config.endpoint.clone(), config.transports.clone())
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// `http(s)://host/ws` becomes `ws(s)://host/ws`.
    fn websocket_base(&self) -> Result<Url, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            url: self.endpoint.to_string(),
            reason: reason.to_string(),
        };

        let scheme = match self.endpoint.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return Err(invalid("expected http, https, ws or wss")),
        };

        let mut base = self.endpoint.clone();
        base.set_scheme(scheme)
            .map_err(|_| invalid("cannot switch to a WebSocket scheme"))?;
        base.set_query(None);
        base.set_fragment(None);
        Ok(base)
    }

    pub(crate) fn transport_url(&self, kind: TransportKind) -> Result<Url, TransportError> {
        let suffix = match kind {
            TransportKind::SockJs => {
                let mut rng = rand::thread_rng();
                let session: String = (&mut rng)
                    .sample_iter(&Alphanumeric)
                    .take(SOCKJS_SESSION_ID_LEN)
                    .map(char::from)
                    .collect();
                sockjs::websocket_path(rng.gen_range(0..1000), &session)
            }
            TransportKind::WebSocket => "websocket".to_string(),
        };

        let mut url = self.websocket_base()?;
        let path = format!("{}/{}", url.path().trim_end_matches('/'), suffix);
        url.set_path(&path);
        Ok(url)
    }

    async fn open(&self, kind: TransportKind) -> Result<TransportConnection, TransportError> {
        let url = self.transport_url(kind)?;
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let (write, mut read) = ws.split();

        match kind {
            TransportKind::SockJs => {
                await_sockjs_open(&mut read).await?;

                let sink: TextSink = Box::pin(
                    write
                        .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
                        .with(|text: String| {
                            future::ready(Ok::<_, TransportError>(Message::Text(
                                sockjs::encode_messages(&[text]),
                            )))
                        }),
                );
                let stream: TextStream =
                    Box::pin(read.flat_map(|msg| stream::iter(sockjs_payloads(msg))));

                Ok(TransportConnection {
                    url: url.to_string(),
                    sink,
                    stream,
                })
            }
            TransportKind::WebSocket => {
                let sink: TextSink = Box::pin(
                    write
                        .sink_map_err(|e| TransportError::SendFailed(e.to_string()))
                        .with(|text: String| {
                            future::ready(Ok::<_, TransportError>(Message::Text(text)))
                        }),
                );
                let stream: TextStream =
                    Box::pin(read.flat_map(|msg| stream::iter(raw_payloads(msg))));

                Ok(TransportConnection {
                    url: url.to_string(),
                    sink,
                    stream,
                })
            }
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<TransportConnection, TransportError> {
        let mut last_error = None;

        for &kind in &self.transports {
            match self.open(kind).await {
                Ok(connection) => {
                    tracing::debug!(transport = %kind, url = %connection.url, "Transport opened");
                    return Ok(connection);
                }
                Err(e) => {
                    tracing::debug!(transport = %kind, error = %e, "Transport unavailable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::ConnectFailed("no transports configured".into())))
    }
}

/// Wait for the SockJS `o` frame that opens the session.
async fn await_sockjs_open<S>(read: &mut S) -> Result<(), TransportError>
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match SockJsFrame::parse(&text) {
                Ok(SockJsFrame::Open) => return Ok(()),
                Ok(SockJsFrame::HeartBeat) => continue,
                Ok(SockJsFrame::Close { code, reason }) => {
                    return Err(TransportError::Closed { code, reason })
                }
                Ok(SockJsFrame::Messages(_)) => {
                    return Err(TransportError::Handshake(
                        "messages received before open frame".into(),
                    ))
                }
                Err(e) => return Err(TransportError::Handshake(e.to_string())),
            },
            Ok(Message::Close(frame)) => return Err(closed(frame)),
            Ok(_) => continue,
            Err(e) => return Err(TransportError::ConnectFailed(e.to_string())),
        }
    }
    Err(TransportError::Handshake(
        "connection ended before open frame".into(),
    ))
}

fn sockjs_payloads(msg: Result<Message, WsError>) -> Vec<Result<String, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => match SockJsFrame::parse(&text) {
            Ok(SockJsFrame::Messages(messages)) => messages.into_iter().map(Ok).collect(),
            Ok(SockJsFrame::Open) | Ok(SockJsFrame::HeartBeat) => Vec::new(),
            Ok(SockJsFrame::Close { code, reason }) => {
                vec![Err(TransportError::Closed { code, reason })]
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed SockJS frame");
                Vec::new()
            }
        },
        Ok(Message::Close(frame)) => vec![Err(closed(frame))],
        Ok(_) => Vec::new(),
        Err(e) => vec![Err(TransportError::ReceiveFailed(e.to_string()))],
    }
}

fn raw_payloads(msg: Result<Message, WsError>) -> Vec<Result<String, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => vec![Ok(text)],
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => vec![Ok(text)],
            Err(_) => {
                tracing::warn!("Dropping non UTF-8 binary payload");
                Vec::new()
            }
        },
        Ok(Message::Close(frame)) => vec![Err(closed(frame))],
        Ok(_) => Vec::new(),
        Err(e) => vec![Err(TransportError::ReceiveFailed(e.to_string()))],
    }
}

fn closed(frame: Option<CloseFrame<'static>>) -> TransportError {
    match frame {
        Some(frame) => TransportError::Closed {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        },
        None => TransportError::Closed {
            code: 1005,
            reason: "no status".into(),
        },
    }
}
