//! Node endpoint checks run after a client starts
//!
//! A `verify-node` step carries a `CHECK <rpc-ws> <engine-ws> <jwt-file>`
//! command. The executor hands it to [`run_check`] instead of the backend:
//! the JWT secret is read on the host through the backend, then the RPC
//! endpoint must accept a `newHeads` subscription and the engine endpoint
//! must answer `engine_exchangeCapabilities` under an HS256 token.

use futures::{SinkExt, StreamExt};
use http::HeaderValue;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::deploy::backend::{Backend, BackendOutput};
use crate::errors::OrchestratorError;
use crate::models::host::Host;
use crate::utils::hex;

/// Command keyword routing a step to [`run_check`]
pub const CHECK_KEYWORD: &str = "CHECK";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Parsed `CHECK` command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCheck {
    pub rpc: Url,
    pub engine: Url,
    pub jwt_secret_file: String,
}

impl NodeCheck {
    pub fn matches(command: &str) -> bool {
        command.split_whitespace().next() == Some(CHECK_KEYWORD)
    }

    pub fn parse(command: &str) -> Result<Self, OrchestratorError> {
        let invalid = |message: String| OrchestratorError::ValidationError(format!("check command: {}", message));
        let parts: Vec<&str> = command.split_whitespace().collect();
        let [keyword, rpc, engine, secret] = parts.as_slice() else {
            return Err(invalid(format!("expected 'CHECK <rpc> <engine> <jwt-file>', got '{}'", command)));
        };
        if *keyword != CHECK_KEYWORD {
            return Err(invalid(format!("unknown keyword '{}'", keyword)));
        }
        let parse_ws = |raw: &str| -> Result<Url, OrchestratorError> {
            let url = Url::parse(raw).map_err(|e| invalid(format!("{}: {}", raw, e)))?;
            match url.scheme() {
                "ws" | "wss" => Ok(url),
                other => Err(invalid(format!("{}: scheme '{}' is not ws or wss", raw, other))),
            }
        };
        Ok(Self {
            rpc: parse_ws(*rpc)?,
            engine: parse_ws(*engine)?,
            jwt_secret_file: secret.to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EngineClaims {
    pub iat: i64,
}

/// HS256 token for the engine API, keyed by the hex secret in `jwtsecret`
pub fn engine_jwt(secret_hex: &str, iat: i64) -> Result<String, OrchestratorError> {
    let secret = hex::decode(secret_hex).map_err(|e| OrchestratorError::TokenError(format!("jwt secret: {}", e)))?;
    if secret.is_empty() {
        return Err(OrchestratorError::TokenError("jwt secret is empty".to_string()));
    }
    encode(
        &Header::new(Algorithm::HS256),
        &EngineClaims { iat },
        &EncodingKey::from_secret(&secret),
    )
    .map_err(|e| OrchestratorError::TokenError(e.to_string()))
}

/// Extract the `result` of the JSON-RPC reply with `id`
///
/// `Ok(None)` means the text is some other message (a notification or a
/// reply to another id).
pub fn parse_rpc_reply(text: &str, id: u64) -> Result<Option<Value>, String> {
    let reply: Value = serde_json::from_str(text).map_err(|e| format!("malformed reply: {}", e))?;
    if reply.get("id").and_then(Value::as_u64) != Some(id) {
        return Ok(None);
    }
    if let Some(error) = reply.get("error") {
        let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(format!("rpc error: {}", message));
    }
    reply
        .get("result")
        .cloned()
        .map(Some)
        .ok_or_else(|| "reply has neither result nor error".to_string())
}

/// Send one request and wait for its reply
///
/// The inner `Err` is an RPC-level rejection; the outer one a transport
/// failure.
async fn call(socket: &mut Socket, id: u64, method: &str, params: Value) -> Result<Result<Value, String>, OrchestratorError> {
    let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
    socket.send(Message::Text(request.to_string().into())).await?;

    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => match parse_rpc_reply(text.as_str(), id) {
                Ok(Some(result)) => return Ok(Ok(result)),
                Ok(None) => debug!("ignoring unrelated message: {}", text.as_str()),
                Err(e) => return Ok(Err(e)),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(WsError::ConnectionClosed.into())
}

/// Subscribe to `newHeads`; returns the subscription id
pub async fn subscribe_new_heads(url: &Url) -> Result<Result<String, String>, OrchestratorError> {
    let (mut socket, _) = connect_async(url.as_str()).await?;
    let reply = call(&mut socket, 1, "eth_subscribe", json!(["newHeads"])).await?;
    let _ = socket.close(None).await;
    Ok(reply.map(|id| id.as_str().map(str::to_string).unwrap_or_else(|| id.to_string())))
}

/// Call `engine_exchangeCapabilities` with a bearer `jwt`; returns the
/// capabilities the node advertises
pub async fn exchange_capabilities(url: &Url, jwt: &str) -> Result<Result<Vec<String>, String>, OrchestratorError> {
    let mut request = url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", jwt))
        .map_err(|e| OrchestratorError::TokenError(format!("authorization header: {}", e)))?;
    request.headers_mut().insert(http::header::AUTHORIZATION, bearer);

    let (mut socket, _) = connect_async(request).await?;
    let reply = call(&mut socket, 1, "engine_exchangeCapabilities", json!([[]])).await?;
    let _ = socket.close(None).await;
    Ok(reply.map(|caps| {
        caps.as_array()
            .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }))
}

/// Run a `CHECK` command against `host`
///
/// Unreachable endpoints are transport errors and may be retried; an
/// endpoint that answers with an RPC error fails the step with exit code 1.
pub async fn run_check(backend: &dyn Backend, host: &Host, command: &str) -> Result<BackendOutput, OrchestratorError> {
    let check = NodeCheck::parse(command)?;

    let secret = backend.run(host, &format!("cat {}", check.jwt_secret_file)).await?;
    if !secret.is_success() {
        return Ok(BackendOutput {
            exit_code: secret.exit_code,
            output: format!("reading {}: {}", check.jwt_secret_file, secret.output),
        });
    }
    let jwt = engine_jwt(&secret.output, chrono::Utc::now().timestamp())?;

    let mut report = Vec::new();
    match subscribe_new_heads(&check.rpc).await? {
        Ok(subscription) => report.push(format!("{}: subscribed to newHeads ({})", check.rpc, subscription)),
        Err(e) => return Ok(failed(format!("{}: {}", check.rpc, e))),
    }
    match exchange_capabilities(&check.engine, &jwt).await? {
        Ok(capabilities) => report.push(format!(
            "{}: {} engine capabilities",
            check.engine,
            capabilities.len()
        )),
        Err(e) => return Ok(failed(format!("{}: {}", check.engine, e))),
    }

    info!("[{}] node endpoints answered", host.name);
    Ok(BackendOutput::success(report.join("\n")))
}

fn failed(output: String) -> BackendOutput {
    BackendOutput { exit_code: 1, output }
}
