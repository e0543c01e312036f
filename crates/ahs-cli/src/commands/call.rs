//! `ahs call <url> <app> <cmd> [key=value ...]`: issue one command over a
//! WebSocket and print every response envelope until the socket goes quiet.

use std::time::Duration;

use ahs_core::messages::COMMAND_REQUEST;
use ahs_core::StreamFrame;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

/// One `ahs call` invocation.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub url: String,
    pub app: String,
    pub cmd: String,
    pub kwargs: Map<String, Value>,
    pub token: Option<String>,
    /// Logical stream name; `None` sends a bare frame.
    pub stream: Option<String>,
    pub wait: Duration,
}

pub async fn run(req: CallRequest) -> Result<()> {
    let responses = exchange(&req).await?;
    for response in &responses {
        println!("{}", serde_json::to_string_pretty(response)?);
    }
    info!(responses = responses.len(), "call finished");
    Ok(())
}

/// Parse `key=value` pairs. Values are JSON when they parse as JSON, strings
/// otherwise.
pub fn parse_kwargs(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut kwargs = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            anyhow::bail!("expected key=value, got '{pair}'");
        };
        if key.is_empty() {
            anyhow::bail!("empty key in '{pair}'");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        kwargs.insert(key.to_string(), value);
    }
    Ok(kwargs)
}

/// The text frame sent for `req`.
pub fn request_frame(req: &CallRequest, unique_id: u64) -> Value {
    let request = json!({
        "type": COMMAND_REQUEST,
        "data": {
            "app": req.app,
            "cmd": req.cmd,
            "kwargs": req.kwargs,
            "uniqueId": unique_id,
        },
    });
    match &req.stream {
        Some(stream) => json!({"stream": stream, "payload": request}),
        None => request,
    }
}

/// Send the request and collect response payloads until `req.wait` passes
/// without a frame or the server closes.
async fn exchange(req: &CallRequest) -> Result<Vec<Value>> {
    let mut request = req
        .url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid url '{}'", req.url))?;
    if let Some(token) = &req.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}")).context("token is not a valid header value")?;
        request.headers_mut().insert("authorization", value);
    }

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {}", req.url))?;
    debug!(url = %req.url, "connected");

    let frame = request_frame(req, 1);
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .context("failed to send request")?;

    let mut responses = Vec::new();
    loop {
        let msg = match tokio::time::timeout(req.wait, ws.next()).await {
            Err(_) | Ok(None) => break,
            Ok(Some(msg)) => msg.context("websocket error")?,
        };
        match msg {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.to_string()));
                responses.push(unwrap_stream(value, req.stream.as_deref()));
            }
            Message::Close(frame) => {
                if let Some(frame) = frame {
                    eprintln!("ahs: server closed the socket ({})", u16::from(frame.code));
                }
                break;
            }
            _ => {}
        }
    }

    let _ = ws.close(None).await;
    Ok(responses)
}

/// Strip the stream wrapper from frames addressed to `stream`.
fn unwrap_stream(value: Value, stream: Option<&str>) -> Value {
    match stream {
        Some(name) => match serde_json::from_value::<StreamFrame>(value.clone()) {
            Ok(frame) if frame.stream == name => frame.payload,
            _ => value,
        },
        None => value,
    }
}
