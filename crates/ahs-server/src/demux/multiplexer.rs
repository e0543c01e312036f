//! ChannelDemultiplexer: several stream applications over one socket.
//!
//! Inbound frames are `{"stream": name, "payload": ...}` and are routed to
//! the named stream's queue. Outbound text from a stream is wrapped the same
//! way. The socket is accepted when the first stream accepts and closed when
//! the last accepting stream closes.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ahs_core::{AhsError, AhsResult, StreamFrame};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{
    Downstream, DownstreamEvent, SocketAction, SocketEvent, StreamApplication, StreamSender,
    UpstreamEvent, CLOSE_ABNORMAL, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
};
use crate::scope::Scope;

type StreamOutcome = (String, Result<AhsResult<()>, Box<dyn Any + Send>>);

/// Maps stream names to applications; one instance serves every connection.
pub struct Demultiplexer {
    streams: Vec<(String, Arc<dyn StreamApplication>)>,
    close_timeout: Duration,
    capacity: usize,
}

impl Demultiplexer {
    pub fn new(close_timeout: Duration) -> Self {
        Self {
            streams: Vec::new(),
            close_timeout,
            capacity: super::DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    /// Bound of the queue every stream's outbound frames share.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn stream(mut self, name: impl Into<String>, app: Arc<dyn StreamApplication>) -> Self {
        self.streams.push((name.into(), app));
        self
    }

    pub fn stream_names(&self) -> Vec<&str> {
        self.streams.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Drive one connection from [`SocketEvent::Connect`] to teardown.
    ///
    /// Returns once every stream task has finished or been aborted.
    pub async fn run(
        &self,
        scope: Arc<Scope>,
        mut events: mpsc::Receiver<SocketEvent>,
        actions: mpsc::Sender<SocketAction>,
    ) -> AhsResult<()> {
        match events.recv().await {
            Some(SocketEvent::Connect) => {}
            Some(other) => {
                return Err(AhsError::Protocol(format!("expected connect, got {other:?}")));
            }
            None => return Ok(()),
        }

        let (down_tx, mut down_rx) = mpsc::channel::<Downstream>(self.capacity);
        let mut tasks: JoinSet<StreamOutcome> = JoinSet::new();
        let mut conn = Connection::default();

        for (name, app) in &self.streams {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(UpstreamEvent::Connect);
            conn.queues.insert(name.clone(), tx);

            let fut = app.run(scope.clone(), rx, StreamSender::new(name.clone(), down_tx.clone()));
            let name = name.clone();
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(fut).catch_unwind().await;
                (name, outcome)
            });
        }
        drop(down_tx);
        debug!(streams = ?self.stream_names(), "stream tasks started");

        let mut disconnect_code = CLOSE_NORMAL;
        loop {
            tokio::select! {
                biased;

                Some(down) = down_rx.recv() => {
                    conn.downstream(down, &actions).await;
                    if conn.socket_closed {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(SocketEvent::Text(text)) => {
                        if let Err(e) = conn.route(&text) {
                            warn!(error = %e, "closing socket");
                            conn.close_socket(&actions, CLOSE_PROTOCOL_ERROR).await;
                            disconnect_code = CLOSE_PROTOCOL_ERROR;
                            break;
                        }
                    }
                    Some(SocketEvent::Binary(_)) => {
                        warn!("protocol violation: binary frame, closing socket");
                        conn.close_socket(&actions, CLOSE_PROTOCOL_ERROR).await;
                        disconnect_code = CLOSE_PROTOCOL_ERROR;
                        break;
                    }
                    Some(SocketEvent::Connect) => debug!("duplicate connect ignored"),
                    Some(SocketEvent::Disconnect { code }) => {
                        debug!(code, "client disconnected");
                        conn.socket_closed = true;
                        disconnect_code = code;
                        break;
                    }
                    None => {
                        conn.socket_closed = true;
                        disconnect_code = CLOSE_ABNORMAL;
                        break;
                    }
                },
                Some(joined) = tasks.join_next() => {
                    match joined {
                        Ok(outcome) => conn.stream_finished(outcome, &actions).await,
                        Err(e) => error!(error = %e, "stream task join failed"),
                    }
                    if conn.socket_closed {
                        break;
                    }
                }
            }
        }

        conn.closing = true;
        for queue in conn.queues.values() {
            let _ = queue.send(UpstreamEvent::Disconnect {
                code: disconnect_code,
            });
        }

        let drain = async {
            loop {
                tokio::select! {
                    joined = tasks.join_next() => match joined {
                        Some(Ok((name, outcome))) => log_outcome(&name, &outcome),
                        Some(Err(e)) => error!(error = %e, "stream task join failed"),
                        None => break,
                    },
                    Some(down) = down_rx.recv() => {
                        debug!(stream = %down.stream, event = ?down.event, "dropping event after close");
                    }
                }
            }
        };
        if tokio::time::timeout(self.close_timeout, drain).await.is_err() {
            warn!(remaining = tasks.len(), "stream tasks did not stop in time, aborting");
        }
        tasks.shutdown().await;
        debug!("connection torn down");
        Ok(())
    }
}

/// Per-connection stream bookkeeping.
#[derive(Default)]
struct Connection {
    queues: HashMap<String, mpsc::UnboundedSender<UpstreamEvent>>,
    accepting: HashSet<String>,
    accepted: bool,
    closing: bool,
    socket_closed: bool,
}

impl Connection {
    /// Route one inbound frame to its stream.
    fn route(&self, text: &str) -> AhsResult<()> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| AhsError::Protocol("frame is not valid JSON".into()))?;
        let well_formed = value
            .as_object()
            .is_some_and(|m| m.contains_key("stream") && m.contains_key("payload"));
        if !well_formed {
            return Err(AhsError::Protocol(
                "frame must be an object with 'stream' and 'payload'".into(),
            ));
        }
        let frame: StreamFrame = serde_json::from_value(value)
            .map_err(|_| AhsError::Protocol("'stream' must be a string".into()))?;

        if !self.accepting.contains(&frame.stream) {
            return Err(AhsError::Protocol(format!(
                "stream '{}' is not accepting frames",
                frame.stream
            )));
        }
        match self.queues.get(&frame.stream) {
            Some(queue) if queue.send(UpstreamEvent::Receive { text: frame.payload.to_string() }).is_ok() => {}
            _ => debug!(stream = %frame.stream, "stream queue gone, dropping frame"),
        }
        Ok(())
    }

    async fn downstream(&mut self, down: Downstream, actions: &mpsc::Sender<SocketAction>) {
        match down.event {
            DownstreamEvent::Accept => {
                if self.closing || self.socket_closed {
                    return;
                }
                self.accepting.insert(down.stream.clone());
                debug!(stream = %down.stream, "stream accepting frames");
                if !self.accepted {
                    self.accepted = true;
                    if actions.send(SocketAction::Accept).await.is_err() {
                        debug!("transport gone before accept");
                    }
                }
            }
            DownstreamEvent::Send(text) => {
                if self.socket_closed || !self.accepting.contains(&down.stream) {
                    debug!(stream = %down.stream, "stream not open, dropping outbound frame");
                    return;
                }
                let payload = serde_json::from_str(&text).unwrap_or(Value::String(text));
                let frame = StreamFrame {
                    stream: down.stream,
                    payload,
                };
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        let _ = actions.send(SocketAction::Text(text)).await;
                    }
                    Err(e) => error!(error = %e, "failed to encode stream frame"),
                }
            }
            DownstreamEvent::Close { code } => self.stream_closed(&down.stream, code, actions).await,
        }
    }

    async fn stream_finished(&mut self, (name, outcome): StreamOutcome, actions: &mpsc::Sender<SocketAction>) {
        log_outcome(&name, &outcome);
        let code = match outcome {
            Ok(Ok(())) => CLOSE_NORMAL,
            _ => CLOSE_INTERNAL_ERROR,
        };
        if self.queues.contains_key(&name) {
            self.stream_closed(&name, code, actions).await;
        }
    }

    async fn stream_closed(&mut self, stream: &str, code: u16, actions: &mpsc::Sender<SocketAction>) {
        self.accepting.remove(stream);
        self.queues.remove(stream);
        debug!(stream, code, "stream closed");
        if self.accepting.is_empty() && !self.closing {
            info!(code, "last stream closed, closing socket");
            self.close_socket(actions, code).await;
        }
    }

    /// Emit at most one close per connection.
    async fn close_socket(&mut self, actions: &mpsc::Sender<SocketAction>, code: u16) {
        if self.socket_closed {
            return;
        }
        self.socket_closed = true;
        if actions.send(SocketAction::Close { code }).await.is_err() {
            debug!("transport gone before close");
        }
    }
}

fn log_outcome(stream: &str, outcome: &Result<AhsResult<()>, Box<dyn Any + Send>>) {
    match outcome {
        Ok(Ok(())) => debug!(stream, "stream task finished"),
        Ok(Err(e)) => warn!(stream, error = %e, "stream task failed"),
        Err(_) => error!(stream, "stream task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::CLOSE_FORBIDDEN;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const WAIT: Duration = Duration::from_millis(200);

    struct Harness {
        events: mpsc::Sender<SocketEvent>,
        actions: mpsc::Receiver<SocketAction>,
        run: tokio::task::JoinHandle<AhsResult<()>>,
    }

    impl Harness {
        async fn start(demux: Demultiplexer) -> Self {
            let (ev_tx, ev_rx) = mpsc::channel(16);
            let (act_tx, act_rx) = mpsc::channel(16);
            let demux = Arc::new(demux);
            let run = tokio::spawn(async move { demux.run(scope(), ev_rx, act_tx).await });
            ev_tx.send(SocketEvent::Connect).await.unwrap();
            Self {
                events: ev_tx,
                actions: act_rx,
                run,
            }
        }

        async fn next(&mut self) -> Option<SocketAction> {
            tokio::time::timeout(WAIT, self.actions.recv()).await.ok().flatten()
        }

        /// Expect the socket accept, then let the remaining streams settle.
        async fn accepted(&mut self) {
            assert_eq!(self.next().await, Some(SocketAction::Accept));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        async fn frame(&self, stream: &str, payload: Value) {
            let text = json!({"stream": stream, "payload": payload}).to_string();
            self.events.send(SocketEvent::Text(text)).await.unwrap();
        }

        async fn finish(mut self) -> Vec<SocketAction> {
            tokio::time::timeout(Duration::from_secs(2), &mut self.run)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            collect(&mut self.actions, WAIT).await
        }
    }

    fn close_count(actions: &[SocketAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, SocketAction::Close { .. }))
            .count()
    }

    #[tokio::test]
    async fn first_accept_accepts_socket_once() {
        let (a, _) = Echo::new();
        let (b, _) = Echo::new();
        let demux = Demultiplexer::new(WAIT).stream("a", a).stream("b", b);
        let mut h = Harness::start(demux).await;

        h.accepted().await;
        h.frame("b", json!({"x": 1})).await;
        let echoed = h.next().await;
        assert_eq!(
            echoed,
            Some(SocketAction::Text(json!({"stream": "b", "payload": {"x": 1}}).to_string()))
        );
    }

    #[tokio::test]
    async fn frame_for_non_accepting_stream_is_protocol_close() {
        let (a, _) = Echo::new();
        let demux = Demultiplexer::new(WAIT)
            .stream("a", a)
            .stream("locked", Arc::new(Reject));
        let mut h = Harness::start(demux).await;
        h.accepted().await;

        h.frame("locked", json!({})).await;
        let actions = h.finish().await;
        assert_eq!(actions, vec![SocketAction::Close { code: CLOSE_PROTOCOL_ERROR }]);
    }

    #[tokio::test]
    async fn unknown_stream_is_protocol_close() {
        let (a, _) = Echo::new();
        let mut h = Harness::start(Demultiplexer::new(WAIT).stream("a", a)).await;
        h.accepted().await;
        h.frame("nope", json!({})).await;
        assert_eq!(
            h.finish().await,
            vec![SocketAction::Close { code: CLOSE_PROTOCOL_ERROR }]
        );
    }

    #[tokio::test]
    async fn malformed_frames_are_protocol_close() {
        for bad in [
            SocketEvent::Text(json!({"stream": "a"}).to_string()),
            SocketEvent::Text(json!({"payload": {}}).to_string()),
            SocketEvent::Text("[1, 2]".into()),
            SocketEvent::Text("not json".into()),
            SocketEvent::Binary(vec![1, 2, 3]),
        ] {
            let (a, _) = Echo::new();
            let mut h = Harness::start(Demultiplexer::new(WAIT).stream("a", a)).await;
            h.accepted().await;
            h.events.send(bad).await.unwrap();
            assert_eq!(
                h.finish().await,
                vec![SocketAction::Close { code: CLOSE_PROTOCOL_ERROR }]
            );
        }
    }

    #[tokio::test]
    async fn closing_every_stream_closes_socket_once() {
        let (a, _) = Echo::new();
        let (b, _) = Echo::new();
        let demux = Demultiplexer::new(WAIT).stream("a", a).stream("b", b);
        let mut h = Harness::start(demux).await;
        h.accepted().await;

        h.frame("a", json!("close")).await;
        h.frame("b", json!("close")).await;
        let actions = h.finish().await;
        assert_eq!(actions, vec![SocketAction::Close { code: CLOSE_NORMAL }]);
    }

    #[tokio::test]
    async fn disconnect_first_sends_no_close() {
        let (a, a_disconnects) = Echo::new();
        let (b, b_disconnects) = Echo::new();
        let demux = Demultiplexer::new(WAIT).stream("a", a).stream("b", b);
        let mut h = Harness::start(demux).await;
        h.accepted().await;

        h.events.send(SocketEvent::Disconnect { code: 1001 }).await.unwrap();
        let actions = h.finish().await;
        assert_eq!(close_count(&actions), 0);
        assert_eq!(a_disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(b_disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_streams_rejecting_closes_without_accept() {
        let demux = Demultiplexer::new(WAIT).stream("locked", Arc::new(Reject));
        let h = Harness::start(demux).await;
        assert_eq!(
            h.finish().await,
            vec![SocketAction::Close { code: CLOSE_FORBIDDEN }]
        );
    }

    #[tokio::test]
    async fn crashed_stream_is_isolated() {
        let (a, _) = Echo::new();
        let (b, _) = Echo::new();
        let demux = Demultiplexer::new(WAIT).stream("a", a).stream("b", b);
        let mut h = Harness::start(demux).await;
        h.accepted().await;

        h.frame("a", json!("panic")).await;
        h.frame("b", json!(7)).await;
        assert_eq!(
            h.next().await,
            Some(SocketAction::Text(json!({"stream": "b", "payload": 7}).to_string()))
        );

        h.events.send(SocketEvent::Disconnect { code: 1000 }).await.unwrap();
        assert_eq!(close_count(&h.finish().await), 0);
    }

    #[tokio::test]
    async fn narrow_outbound_queue_delivers_every_frame() {
        let (a, _) = Echo::new();
        let demux = Demultiplexer::new(WAIT).with_capacity(0).stream("a", a);
        assert_eq!(demux.capacity, 1);
        let mut h = Harness::start(demux).await;
        h.accepted().await;

        let events = h.events.clone();
        let sender = tokio::spawn(async move {
            for i in 0..40 {
                let text = json!({"stream": "a", "payload": i}).to_string();
                events.send(SocketEvent::Text(text)).await.unwrap();
            }
        });
        for i in 0..40 {
            assert_eq!(
                h.next().await,
                Some(SocketAction::Text(json!({"stream": "a", "payload": i}).to_string()))
            );
        }
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn stuck_stream_is_aborted_after_timeout() {
        let demux = Demultiplexer::new(Duration::from_millis(50)).stream("s", Arc::new(Stubborn));
        let mut h = Harness::start(demux).await;
        h.accepted().await;
        h.events.send(SocketEvent::Disconnect { code: 1000 }).await.unwrap();
        assert!(h.finish().await.is_empty());
    }
}
