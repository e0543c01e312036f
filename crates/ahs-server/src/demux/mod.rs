//! Socket-level event plumbing between the transport and stream
//! applications.
//!
//! The transport speaks [`SocketEvent`] in and [`SocketAction`] out. A
//! [`StreamApplication`] sees only its own logical stream: [`UpstreamEvent`]s
//! in, and a [`StreamSender`] for replies. [`Demultiplexer`] runs several
//! applications over one socket; [`run_single`] binds one application to the
//! socket directly.

mod multiplexer;

pub use multiplexer::Demultiplexer;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ahs_core::{AhsError, AhsResult};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::scope::Scope;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_TOO_BIG: u16 = 1009;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Application close code for connections refused for lack of credentials.
pub const CLOSE_FORBIDDEN: u16 = 4403;

/// Stream name reported by [`run_single`].
pub const SINGLE_STREAM: &str = "default";

/// Transport → connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Connect,
    Text(String),
    Binary(Vec<u8>),
    Disconnect { code: u16 },
}

/// Connection → transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAction {
    /// Complete the handshake; frames received so far are released.
    Accept,
    Text(String),
    Close { code: u16 },
}

/// Connection → one stream application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Connect,
    Receive { text: String },
    Disconnect { code: u16 },
}

/// One stream application → connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamEvent {
    Accept,
    Send(String),
    Close { code: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Downstream {
    pub stream: String,
    pub event: DownstreamEvent,
}

/// Reply handle given to a stream application.
#[derive(Debug, Clone)]
pub struct StreamSender {
    stream: String,
    tx: mpsc::Sender<Downstream>,
}

impl StreamSender {
    pub fn new(stream: impl Into<String>, tx: mpsc::Sender<Downstream>) -> Self {
        Self {
            stream: stream.into(),
            tx,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    async fn emit(&self, event: DownstreamEvent) -> AhsResult<()> {
        self.tx
            .send(Downstream {
                stream: self.stream.clone(),
                event,
            })
            .await
            .map_err(|_| AhsError::Channel(format!("stream '{}' is detached", self.stream)))
    }

    pub async fn accept(&self) -> AhsResult<()> {
        self.emit(DownstreamEvent::Accept).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> AhsResult<()> {
        self.emit(DownstreamEvent::Send(text.into())).await
    }

    pub async fn send_json<T: Serialize>(&self, value: &T) -> AhsResult<()> {
        let text = serde_json::to_string(value)?;
        self.send_text(text).await
    }

    pub async fn close(&self, code: u16) -> AhsResult<()> {
        self.emit(DownstreamEvent::Close { code }).await
    }
}

pub type AppFuture = Pin<Box<dyn Future<Output = AhsResult<()>> + Send + 'static>>;

/// An application bound to one logical stream of a socket.
///
/// `run` receives [`UpstreamEvent::Connect`] first and should return once it
/// sees [`UpstreamEvent::Disconnect`] or its inbound queue closes.
pub trait StreamApplication: Send + Sync {
    fn run(
        &self,
        scope: Arc<Scope>,
        inbound: mpsc::UnboundedReceiver<UpstreamEvent>,
        outbound: StreamSender,
    ) -> AppFuture;
}

/// Default bound of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Bind a single application directly to the socket, without stream framing.
pub async fn run_single(
    app: Arc<dyn StreamApplication>,
    scope: Arc<Scope>,
    mut events: mpsc::Receiver<SocketEvent>,
    actions: mpsc::Sender<SocketAction>,
    close_timeout: Duration,
    capacity: usize,
) -> AhsResult<()> {
    let (up_tx, up_rx) = mpsc::unbounded_channel();
    let (down_tx, mut down_rx) = mpsc::channel(capacity.max(1));
    let mut task = tokio::spawn(app.run(scope, up_rx, StreamSender::new(SINGLE_STREAM, down_tx)));

    let mut disconnect_code = CLOSE_NORMAL;
    loop {
        tokio::select! {
            biased;

            Some(down) = down_rx.recv() => match down.event {
                DownstreamEvent::Accept => {
                    let _ = actions.send(SocketAction::Accept).await;
                }
                DownstreamEvent::Send(text) => {
                    let _ = actions.send(SocketAction::Text(text)).await;
                }
                DownstreamEvent::Close { code } => {
                    let _ = actions.send(SocketAction::Close { code }).await;
                    disconnect_code = code;
                    break;
                }
            },
            event = events.recv() => match event {
                Some(SocketEvent::Connect) => {
                    let _ = up_tx.send(UpstreamEvent::Connect);
                }
                Some(SocketEvent::Text(text)) => {
                    let _ = up_tx.send(UpstreamEvent::Receive { text });
                }
                Some(SocketEvent::Binary(_)) => {
                    warn!("binary frame on text socket, closing");
                    let _ = actions.send(SocketAction::Close { code: CLOSE_UNSUPPORTED_DATA }).await;
                    disconnect_code = CLOSE_UNSUPPORTED_DATA;
                    break;
                }
                Some(SocketEvent::Disconnect { code }) => {
                    disconnect_code = code;
                    break;
                }
                None => {
                    disconnect_code = CLOSE_ABNORMAL;
                    break;
                }
            },
            joined = &mut task => {
                let code = match joined {
                    Ok(Ok(())) => CLOSE_NORMAL,
                    Ok(Err(e)) => {
                        warn!(error = %e, "application failed");
                        CLOSE_INTERNAL_ERROR
                    }
                    Err(e) => {
                        error!(error = %e, "application task panicked");
                        CLOSE_INTERNAL_ERROR
                    }
                };
                let _ = actions.send(SocketAction::Close { code }).await;
                return Ok(());
            }
        }
    }

    let _ = up_tx.send(UpstreamEvent::Disconnect {
        code: disconnect_code,
    });
    let drain = async {
        loop {
            tokio::select! {
                joined = &mut task => {
                    if let Err(e) = joined {
                        error!(error = %e, "application task panicked");
                    }
                    break;
                }
                Some(down) = down_rx.recv() => {
                    debug!(event = ?down.event, "dropping event after close");
                }
            }
        }
    };
    if tokio::time::timeout(close_timeout, drain).await.is_err() {
        warn!("application did not stop in time, aborting");
        task.abort();
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Small stream applications shared by the demux tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts on connect, echoes every payload, closes on `"close"`.
    pub struct Echo {
        pub disconnects: Arc<AtomicUsize>,
    }

    impl Echo {
        pub fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
            let disconnects = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self {
                    disconnects: disconnects.clone(),
                }),
                disconnects,
            )
        }
    }

    impl StreamApplication for Echo {
        fn run(
            &self,
            _scope: Arc<Scope>,
            mut inbound: mpsc::UnboundedReceiver<UpstreamEvent>,
            outbound: StreamSender,
        ) -> AppFuture {
            let disconnects = self.disconnects.clone();
            Box::pin(async move {
                while let Some(event) = inbound.recv().await {
                    match event {
                        UpstreamEvent::Connect => outbound.accept().await?,
                        UpstreamEvent::Receive { text } if text == "\"close\"" => {
                            outbound.close(CLOSE_NORMAL).await?;
                            return Ok(());
                        }
                        UpstreamEvent::Receive { text } if text == "\"panic\"" => {
                            panic!("stream asked to panic");
                        }
                        UpstreamEvent::Receive { text } => outbound.send_text(text).await?,
                        UpstreamEvent::Disconnect { .. } => {
                            disconnects.fetch_add(1, Ordering::SeqCst);
                            return Ok(());
                        }
                    }
                }
                Ok(())
            })
        }
    }

    /// Closes instead of accepting.
    pub struct Reject;

    impl StreamApplication for Reject {
        fn run(
            &self,
            _scope: Arc<Scope>,
            mut inbound: mpsc::UnboundedReceiver<UpstreamEvent>,
            outbound: StreamSender,
        ) -> AppFuture {
            Box::pin(async move {
                if let Some(UpstreamEvent::Connect) = inbound.recv().await {
                    outbound.close(CLOSE_FORBIDDEN).await?;
                }
                while inbound.recv().await.is_some() {}
                Ok(())
            })
        }
    }

    /// Accepts, then ignores everything including disconnect.
    pub struct Stubborn;

    impl StreamApplication for Stubborn {
        fn run(
            &self,
            _scope: Arc<Scope>,
            mut inbound: mpsc::UnboundedReceiver<UpstreamEvent>,
            outbound: StreamSender,
        ) -> AppFuture {
            Box::pin(async move {
                let _ = inbound.recv().await;
                outbound.accept().await?;
                std::future::pending::<()>().await;
                Ok(())
            })
        }
    }

    pub fn scope() -> Arc<Scope> {
        Arc::new(Scope::from_parts("/ws/", None, Vec::<(&str, &str)>::new(), None).unwrap_or_default())
    }

    /// Collect actions until the sender side is dropped or `wait` passes.
    pub async fn collect(rx: &mut mpsc::Receiver<SocketAction>, wait: Duration) -> Vec<SocketAction> {
        let mut out = Vec::new();
        while let Ok(Some(action)) = tokio::time::timeout(wait, rx.recv()).await {
            out.push(action);
        }
        out
    }
}
