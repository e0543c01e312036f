//! CommandDispatcher: validate one request, run its handler and stream the
//! results to the request's channel.

use std::sync::Arc;

use ahs_core::{AhsError, AhsResult, ChannelMessage, CommandRequest, ResponseEnvelope};
use futures_util::StreamExt;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use super::registry::{BoundArgs, CommandRegistry, CommandSpec, Handler};
use crate::channel_layer::ChannelLayer;

/// Keyword reserved for the acting principal; never bound from client input.
pub const IDENTITY_PARAM: &str = "user";

pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
    layer: Arc<dyn ChannelLayer>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<CommandRegistry>, layer: Arc<dyn ChannelLayer>) -> Self {
        Self { registry, layer }
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Run one request, returning the number of envelopes sent.
    ///
    /// Errors are returned to the caller; envelopes already sent before a
    /// handler failure stay sent.
    pub async fn execute(&self, req: &CommandRequest) -> AhsResult<usize> {
        let mut sent = 0;
        self.run(req, &mut sent).await?;
        Ok(sent)
    }

    /// Run one request and never fail: every error is logged and the
    /// connection carries on. Returns the number of envelopes sent.
    pub async fn dispatch(&self, req: CommandRequest) -> usize {
        let mut sent = 0;
        if let Err(e) = self.run(&req, &mut sent).await {
            match &e {
                AhsError::UnknownCommand { .. } => {
                    warn!(app = %req.app_namespace, cmd = %req.command_name, "unknown command, dropping request")
                }
                AhsError::MissingParameters(names) => {
                    warn!(app = %req.app_namespace, cmd = %req.command_name, missing = ?names, "missing required parameters")
                }
                AhsError::InvalidParameter { .. } => {
                    warn!(app = %req.app_namespace, cmd = %req.command_name, error = %e, "invalid parameter")
                }
                _ => {
                    error!(app = %req.app_namespace, cmd = %req.command_name, sent, error = %e, "command failed")
                }
            }
        }
        sent
    }

    async fn run(&self, req: &CommandRequest, sent: &mut usize) -> AhsResult<()> {
        let spec = self
            .registry
            .lookup(&req.app_namespace, &req.command_name)
            .ok_or_else(|| AhsError::UnknownCommand {
                namespace: req.app_namespace.clone(),
                command: req.command_name.clone(),
            })?;
        let args = bind_arguments(&spec, req)?;

        match &spec.handler {
            Handler::OneShot(f) => {
                let result = f(req.owner.clone(), args)
                    .await
                    .map_err(|e| AhsError::Other(format!("{e:#}")))?;
                match result {
                    Some(Value::Null) | None => {}
                    Some(data) => {
                        self.send(req, data).await?;
                        *sent += 1;
                    }
                }
            }
            Handler::Stream(f) => {
                let mut items = f(req.owner.clone(), args);
                while let Some(item) = items.next().await {
                    let data = item.map_err(|e| AhsError::Other(format!("{e:#}")))?;
                    self.send(req, data).await?;
                    *sent += 1;
                }
            }
        }

        debug!(app = %req.app_namespace, cmd = %req.command_name, sent = *sent, "command complete");
        Ok(())
    }

    async fn send(&self, req: &CommandRequest, data: Value) -> AhsResult<()> {
        let envelope = ResponseEnvelope::for_request(req, data);
        self.layer
            .send(&req.channel_name, ChannelMessage::CommandResponse(envelope))
            .await
    }
}

/// Match provided arguments to declared parameters.
///
/// Positional arguments fill parameters in declaration order. Keyword
/// arguments the handler does not declare are dropped. Missing required
/// parameters fail before anything runs; so do values of the wrong type.
pub fn bind_arguments(spec: &CommandSpec, req: &CommandRequest) -> AhsResult<BoundArgs> {
    if req.positional_args.len() > spec.params.len() {
        return Err(AhsError::InvalidParameter {
            name: "args".to_string(),
            expected: format!("at most {} positional arguments", spec.params.len()),
        });
    }

    let mut bound = Map::new();
    for (param, value) in spec.params.iter().zip(&req.positional_args) {
        bound.insert(param.name.clone(), value.clone());
    }

    for (name, value) in &req.keyword_args {
        if name == IDENTITY_PARAM || spec.param(name).is_none() {
            continue;
        }
        if bound.contains_key(name) {
            return Err(AhsError::InvalidParameter {
                name: name.clone(),
                expected: "a single value, got positional and keyword".to_string(),
            });
        }
        bound.insert(name.clone(), value.clone());
    }

    let missing: Vec<String> = spec
        .required_params()
        .into_iter()
        .filter(|name| !bound.contains_key(*name))
        .map(String::from)
        .collect();
    if !missing.is_empty() {
        return Err(AhsError::MissingParameters(missing));
    }

    for param in &spec.params {
        match (bound.get(&param.name), &param.default) {
            (Some(Value::Null), Some(_)) => {}
            (Some(value), _) if !param.ty.accepts(value) => {
                return Err(AhsError::InvalidParameter {
                    name: param.name.clone(),
                    expected: param.ty.name().to_string(),
                });
            }
            (Some(_), _) => {}
            (None, Some(default)) => {
                bound.insert(param.name.clone(), default.clone());
            }
            (None, None) => {}
        }
    }

    Ok(BoundArgs::new(bound))
}
