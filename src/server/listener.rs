// src/server/listener.rs

//! The JSON-lines TCP transport: one request object per line, one response
//! object per line. The transport is deliberately thin; all semantics live
//! behind the command registry.

use super::context::ServerContext;
use super::dispatch::{CommandArgs, CommandRegistry};
use crate::core::state::FabricState;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

#[derive(Deserialize, Debug)]
struct WireRequest {
    namespace: String,
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Serialize, Debug)]
struct WireResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    steps: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Accepts client connections until shutdown, then drains the executor.
pub async fn run(context: ServerContext) -> Result<()> {
    let ServerContext {
        state,
        registry,
        listener,
        shutdown_tx,
    } = context;
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("client connected from {peer}");
                        tokio::spawn(handle_client(
                            stream,
                            state.clone(),
                            registry.clone(),
                            shutdown_tx.clone(),
                        ));
                    }
                    Err(e) => warn!("failed to accept client connection: {e}"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown requested over the wire");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    state.shutdown().await;
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    state: Arc<FabricState>,
    registry: Arc<CommandRegistry>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut framed = Framed::new(stream, LinesCodec::new());

    while let Some(line) = framed.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("client stream error: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WireRequest>(&line) {
            Ok(request) => {
                if request.namespace == "manage" && request.method == "shutdown" {
                    let response = WireResponse {
                        success: true,
                        summary: None,
                        steps: Vec::new(),
                        return_value: Some(Value::String("shutting down".into())),
                        error: None,
                    };
                    send(&mut framed, &response).await;
                    let _ = shutdown_tx.send(());
                    return;
                }
                dispatch(&state, &registry, request).await
            }
            Err(e) => WireResponse {
                success: false,
                summary: None,
                steps: Vec::new(),
                return_value: None,
                error: Some(format!("malformed request: {e}")),
            },
        };
        send(&mut framed, &response).await;
    }
}

async fn dispatch(
    state: &Arc<FabricState>,
    registry: &Arc<CommandRegistry>,
    request: WireRequest,
) -> WireResponse {
    let result = registry
        .dispatch(
            state.clone(),
            &request.namespace,
            &request.method,
            CommandArgs(request.args),
        )
        .await;
    match result {
        Ok(status) => WireResponse {
            success: status.success,
            summary: Some(serde_json::json!({
                "procedure_id": status.procedure_id.to_string(),
                "title": status.title,
                "state": status.state.to_string(),
            })),
            steps: status
                .steps
                .iter()
                .map(|s| serde_json::to_value(s).unwrap_or(Value::Null))
                .collect(),
            return_value: status.return_value.clone(),
            error: None,
        },
        // Request-level failures carry no procedure; §7 forbids leaking
        // anything beyond the error's display form across the wire.
        Err(e) => WireResponse {
            success: false,
            summary: None,
            steps: Vec::new(),
            return_value: None,
            error: Some(e.to_string()),
        },
    }
}

async fn send(framed: &mut Framed<TcpStream, LinesCodec>, response: &WireResponse) {
    match serde_json::to_string(response) {
        Ok(serialized) => {
            if let Err(e) = framed.send(serialized).await {
                warn!("failed to write response: {e}");
            }
        }
        Err(e) => warn!("failed to serialize response: {e}"),
    }
}
