//! WebSocket listener using tokio-tungstenite, optionally behind TLS.
//!
//! The HTTP upgrade request is captured into a [`Scope`]; after the upgrade
//! each connection is pumped between the socket and a pair of channels
//! ([`SocketEvent`] in, [`SocketAction`] out). Client frames are not read
//! until the application accepts.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use ahs_core::{AhsError, AhsResult};

use crate::demux::{SocketAction, SocketEvent, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_TOO_BIG};
use crate::scope::Scope;

/// Close code reported when the peer closes without one.
const CLOSE_NO_STATUS: u16 = 1005;

/// An upgraded connection, ready to hand to an application.
pub struct AcceptedSocket {
    pub scope: Scope,
    pub events: mpsc::Receiver<SocketEvent>,
    pub actions: mpsc::Sender<SocketAction>,
}

/// Start the WebSocket listener.
///
/// Returns the bound address and a receiver that yields upgraded
/// connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    max_frame_bytes: usize,
) -> AhsResult<(SocketAddr, mpsc::Receiver<AcceptedSocket>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| AhsError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, tls = tls.is_some(), "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<AcceptedSocket>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => serve(stream, addr, max_frame_bytes, tx).await,
                                Err(e) => Err(AhsError::Transport(format!("TLS handshake failed: {e}"))),
                            },
                            None => serve(stream, addr, max_frame_bytes, tx).await,
                        };
                        if let Err(e) = result {
                            warn!(remote = %addr, error = %e, "WebSocket connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

fn ws_config(max_frame_bytes: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_frame_bytes);
    config.max_frame_size = Some(max_frame_bytes);
    config
}

/// Upgrade one stream, hand it off, then pump it until either side closes.
async fn serve<S>(
    stream: S,
    remote: SocketAddr,
    max_frame_bytes: usize,
    conns: mpsc::Sender<AcceptedSocket>,
) -> AhsResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut scope: Option<Scope> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)));
        match Scope::from_parts(req.uri().path(), req.uri().query(), headers, Some(remote)) {
            Ok(s) => {
                scope = Some(s);
                Ok(resp)
            }
            Err(e) => {
                let mut rejection = ErrorResponse::new(Some(e.to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };

    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config(max_frame_bytes)))
        .await
        .map_err(|e| AhsError::Transport(format!("WS upgrade failed: {e}")))?;
    let scope = scope.ok_or_else(|| AhsError::Transport("upgrade produced no scope".into()))?;
    debug!(remote = %remote, path = %scope.path, "WebSocket connection upgraded");

    let (events_tx, events_rx) = mpsc::channel(64);
    let (actions_tx, actions_rx) = mpsc::channel(64);
    conns
        .send(AcceptedSocket {
            scope,
            events: events_rx,
            actions: actions_tx,
        })
        .await
        .map_err(|_| AhsError::Transport("WebSocket connection channel closed".into()))?;

    pump(ws, remote, events_tx, actions_rx).await;
    Ok(())
}

fn close_message(code: u16) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    }))
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    remote: SocketAddr,
    events: mpsc::Sender<SocketEvent>,
    mut actions: mpsc::Receiver<SocketAction>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    if events.send(SocketEvent::Connect).await.is_err() {
        return;
    }

    let mut accepted = false;
    loop {
        tokio::select! {
            action = actions.recv() => match action {
                Some(SocketAction::Accept) => {
                    accepted = true;
                    debug!(remote = %remote, "socket accepted");
                }
                Some(SocketAction::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!(remote = %remote, error = %e, "WS send failed");
                        let _ = events.send(SocketEvent::Disconnect { code: CLOSE_ABNORMAL }).await;
                        break;
                    }
                }
                Some(SocketAction::Close { code }) => {
                    debug!(remote = %remote, code, accepted, "closing socket");
                    let _ = sink.send(close_message(code)).await;
                    break;
                }
                None => {
                    let _ = sink.send(close_message(CLOSE_NORMAL)).await;
                    break;
                }
            },
            frame = stream.next(), if accepted => match frame {
                Some(Ok(Message::Text(text))) => {
                    if events.send(SocketEvent::Text(text.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if events.send(SocketEvent::Binary(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    // Respond to pings automatically
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS);
                    let _ = events.send(SocketEvent::Disconnect { code }).await;
                    break;
                }
                Some(Err(WsError::Capacity(e))) => {
                    warn!(remote = %remote, error = %e, "WS frame too large");
                    let _ = sink.send(close_message(CLOSE_TOO_BIG)).await;
                    let _ = events.send(SocketEvent::Disconnect { code: CLOSE_TOO_BIG }).await;
                    break;
                }
                Some(Err(e)) => {
                    debug!(remote = %remote, error = %e, "WS recv failed");
                    let _ = events.send(SocketEvent::Disconnect { code: CLOSE_ABNORMAL }).await;
                    break;
                }
                None => {
                    let _ = events.send(SocketEvent::Disconnect { code: CLOSE_ABNORMAL }).await;
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    debug!(remote = %remote, "WebSocket connection closed");
}
