//! The command stream application.
//!
//! Accepts the stream, owns one channel on the channel layer, forwards
//! inbound command requests through that channel and dispatches whatever
//! requests arrive on it. Responses coming back through the channel are
//! written to the socket.

use std::sync::Arc;

use ahs_core::codec::parse_json_object;
use ahs_core::messages::{CommandInvocation, ErrorReply, COMMAND_REQUEST};
use ahs_core::{AhsResult, ChannelMessage, CommandRequest};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::dispatcher::CommandDispatcher;
use crate::channel_layer::ChannelLayer;
use crate::demux::{AppFuture, StreamApplication, StreamSender, UpstreamEvent, CLOSE_FORBIDDEN};
use crate::scope::Scope;

/// Prefix of per-connection channel names.
pub const CHANNEL_PREFIX: &str = "ahs.command";

pub struct CommandConsumer {
    dispatcher: Arc<CommandDispatcher>,
    layer: Arc<dyn ChannelLayer>,
    require_authentication: bool,
}

impl CommandConsumer {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        layer: Arc<dyn ChannelLayer>,
        require_authentication: bool,
    ) -> Self {
        Self {
            dispatcher,
            layer,
            require_authentication,
        }
    }
}

impl StreamApplication for CommandConsumer {
    fn run(
        &self,
        scope: Arc<Scope>,
        inbound: mpsc::UnboundedReceiver<UpstreamEvent>,
        outbound: StreamSender,
    ) -> AppFuture {
        let conn = ConsumerConnection {
            dispatcher: self.dispatcher.clone(),
            layer: self.layer.clone(),
            scope,
            outbound,
        };
        let require_authentication = self.require_authentication;
        Box::pin(async move { conn.run(inbound, require_authentication).await })
    }
}

struct ConsumerConnection {
    dispatcher: Arc<CommandDispatcher>,
    layer: Arc<dyn ChannelLayer>,
    scope: Arc<Scope>,
    outbound: StreamSender,
}

impl ConsumerConnection {
    async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<UpstreamEvent>,
        require_authentication: bool,
    ) -> AhsResult<()> {
        match inbound.recv().await {
            Some(UpstreamEvent::Connect) => {}
            _ => return Ok(()),
        }

        if require_authentication && !self.scope.identity.is_authenticated() {
            info!(remote = ?self.scope.remote, stream = self.outbound.stream(), "rejecting anonymous connection");
            return self.outbound.close(CLOSE_FORBIDDEN).await;
        }

        let (channel, mut channel_rx) = self.layer.new_channel(CHANNEL_PREFIX).await?;
        self.outbound.accept().await?;
        info!(
            channel = %channel,
            owner = self.scope.identity.owner().unwrap_or("anonymous"),
            stream = self.outbound.stream(),
            "command connection accepted"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        let result = self
            .serve(&mut inbound, &channel, &mut channel_rx, &mut tasks)
            .await;

        self.layer.discard(&channel).await;
        let in_flight = tasks.len();
        tasks.shutdown().await;
        debug!(channel = %channel, in_flight, "command connection closed");
        result
    }

    async fn serve(
        &self,
        inbound: &mut mpsc::UnboundedReceiver<UpstreamEvent>,
        channel: &str,
        channel_rx: &mut mpsc::Receiver<ChannelMessage>,
        tasks: &mut JoinSet<()>,
    ) -> AhsResult<()> {
        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(UpstreamEvent::Receive { text }) => {
                        if let Some(req) = self.receive(&text, channel).await? {
                            // This loop is the channel's only reader.
                            let layer = self.layer.clone();
                            let channel = channel.to_string();
                            tasks.spawn(async move {
                                if let Err(e) = layer.send(&channel, ChannelMessage::CommandRequest(req)).await {
                                    warn!(channel = %channel, error = %e, "failed to forward command request");
                                }
                            });
                        }
                    }
                    Some(UpstreamEvent::Connect) => {}
                    Some(UpstreamEvent::Disconnect { code }) => {
                        debug!(channel, code, "command connection disconnected");
                        return Ok(());
                    }
                    None => return Ok(()),
                },
                Some(message) = channel_rx.recv() => match message {
                    ChannelMessage::CommandRequest(req) => {
                        let dispatcher = self.dispatcher.clone();
                        tasks.spawn(async move {
                            dispatcher.dispatch(req).await;
                        });
                    }
                    ChannelMessage::CommandResponse(envelope) => {
                        self.outbound.send_json(&envelope).await?;
                    }
                },
                Some(done) = tasks.join_next() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            error!(channel, error = %e, "dispatch task panicked");
                        }
                    }
                }
            }
        }
    }

    /// Handle one text frame from the client. Malformed frames are answered
    /// here; a valid request is returned for forwarding.
    async fn receive(&self, text: &str, channel: &str) -> AhsResult<Option<CommandRequest>> {
        let frame = match parse_json_object(text) {
            Ok(frame) => frame,
            Err(_) => return self.reply(ErrorReply::invalid_json()).await,
        };
        let Some(msg_type) = frame.get("type").and_then(Value::as_str) else {
            return self.reply(ErrorReply::missing_type()).await;
        };
        if msg_type != COMMAND_REQUEST {
            return self.reply(ErrorReply::unsupported_type(msg_type)).await;
        }

        let data = frame.get("data").cloned().unwrap_or(Value::Null);
        let invocation: CommandInvocation = match serde_json::from_value(data) {
            Ok(inv) => inv,
            Err(e) => {
                warn!(error = %e, "malformed command request");
                return self
                    .reply(ErrorReply::new(format!("Invalid command request: {e}")))
                    .await;
            }
        };

        let Some(app) = invocation.app.or_else(|| self.scope.route.app_name.clone()) else {
            return self
                .reply(ErrorReply::new("Missing 'app' in command request"))
                .await;
        };

        let mut req = CommandRequest::new(app, invocation.cmd, self.scope.identity.clone(), channel)
            .with_args(invocation.args)
            .with_kwargs(invocation.kwargs)
            .with_correlation_id(invocation.unique_id);
        req.page_name = self.scope.route.page_name.clone();
        req.socket_url = self.scope.route.socket_url.clone();

        debug!(app = %req.app_namespace, cmd = %req.command_name, "command request received");
        Ok(Some(req))
    }

    async fn reply(&self, error: ErrorReply) -> AhsResult<Option<CommandRequest>> {
        self.outbound.send_json(&error).await?;
        Ok(None)
    }
}
