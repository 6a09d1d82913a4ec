use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, Query, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine, prelude::BASE64_STANDARD};
use futures_util::{SinkExt, StreamExt};
use http::{HeaderMap, HeaderValue, StatusCode, header};
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, time::timeout};
#[cfg(not(coverage_nightly))]
use tracing::{debug, error};

use crate::{
    allowlist::HostResolver,
    browser::{BrowserCommand, BrowserHandle, BrowserMessage},
    directory::{DirectoryResolution, resolve_directory},
    droppable_handle::DroppableHandle,
    error::SessionError,
    session::{GatewayContext, GatewaySession, next_session_id},
    session_config::{Identity, SessionRequest},
    shutdown::ShutdownCoordinator,
    upstream::{UpstreamConnection, UpstreamConnector},
};

const CORRELATION_HEADER: &str = "mrhsession";
const BASIC_REALM: &str = "Basic realm=\"WebSSH\"";
// How long the final events get to reach the browser once a session has ended.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    port: Option<String>,
    sshterm: Option<String>,
    ready_timeout: Option<String>,
    dir: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    code: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    recoverable: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

fn error_response(status: StatusCode, code: &str, recoverable: bool) -> Response {
    (
        status,
        Json(ErrorBody {
            errors: vec![ErrorEntry {
                code: code.into(),
                recoverable,
            }],
        }),
    )
        .into_response()
}

fn unauthorized() -> Response {
    let mut response = error_response(StatusCode::UNAUTHORIZED, "Unauthorized", false);
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static(BASIC_REALM),
    );
    response
}

#[derive(Debug, Serialize)]
struct PreflightBody {
    pwd: String,
    cwd: String,
}

pub(crate) fn router<C, R>(context: Arc<GatewayContext<C, R>>) -> Router
where
    C: UpstreamConnector,
    R: HostResolver + Send + Sync + 'static,
{
    Router::new()
        .route("/ping", get(ping::<C, R>))
        .route("/ssh/host", get(preflight::<C, R>))
        .route("/ssh/host/{host}", get(preflight::<C, R>))
        .route("/ssh/socket", get(socket::<C, R>))
        .route("/ssh/socket/{host}", get(socket::<C, R>))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&context.shutdown),
            drain_guard,
        ))
        .with_state(context)
}

// New requests are refused once the server is winding down.
async fn drain_guard(
    State(shutdown): State<Arc<ShutdownCoordinator>>,
    request: Request,
    next: Next,
) -> Response {
    if shutdown.is_draining() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service unavailable: Server shutting down",
        )
            .into_response();
    }
    next.run(request).await
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not Found", false)
}

// Username and password from the Basic authorization header, plus the gateway
// private key if one is configured.
fn identity<C, R>(headers: &HeaderMap, context: &GatewayContext<C, R>) -> Option<Identity> {
    let encoded = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Basic ")?;
    let decoded = String::from_utf8(BASE64_STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    let identity = Identity {
        username: username.into(),
        password: Some(password.into()).filter(|password: &String| !password.is_empty()),
        private_key: context.config_builder.defaults().private_key(),
    };
    identity.credentials().is_some().then_some(identity)
}

fn session_request(
    host: Option<Path<String>>,
    query: SessionQuery,
    headers: &HeaderMap,
) -> SessionRequest {
    SessionRequest {
        host: host.map(|Path(host)| host),
        port: query.port,
        term: query.sshterm,
        ready_timeout: query.ready_timeout,
        correlation_token: headers
            .get(CORRELATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(Into::into),
        directory: query.dir,
    }
}

async fn ping<C, R>(
    State(context): State<Arc<GatewayContext<C, R>>>,
    headers: HeaderMap,
) -> Response
where
    C: UpstreamConnector,
    R: HostResolver + Send + Sync + 'static,
{
    if identity(&headers, &context).is_none() {
        return unauthorized();
    }
    (StatusCode::OK, "OK").into_response()
}

// Checks that a session could be opened, and where its shell would start.
async fn preflight<C, R>(
    State(context): State<Arc<GatewayContext<C, R>>>,
    host: Option<Path<String>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response
where
    C: UpstreamConnector,
    R: HostResolver + Send + Sync + 'static,
{
    let Some(identity) = identity(&headers, &context) else {
        return unauthorized();
    };
    let request = session_request(host, query, &headers);
    let config = match context.authorize(&identity, &request).await {
        Ok(config) => config.without_interaction(),
        Err(SessionError::HostNotAllowed(_) | SessionError::HostUnresolvable { .. }) => {
            return error_response(StatusCode::UNAUTHORIZED, "Unauthorized", false);
        }
        Err(SessionError::MissingCredentials) => return unauthorized(),
        Err(error) => {
            #[cfg(not(coverage_nightly))]
            error!(%error, "Unable to build session configuration.");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", false);
        }
    };
    // Banner text has nowhere to go outside of a browser session.
    let (browser, _) = BrowserHandle::new();
    let connection = match context.connector.connect(&config, &browser).await {
        Ok(connection) => connection,
        Err(SessionError::UpstreamAuthFailure) => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "Missing SSH Configuration",
                false,
            );
        }
        Err(error) => {
            #[cfg(not(coverage_nightly))]
            error!(%error, host = %config.host, "Preflight connection failed.");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", false);
        }
    };
    let resolution = resolve_directory(
        config.requested_directory.as_deref(),
        connection.open_filesystem(),
    )
    .await;
    connection.close().await;
    match resolution {
        Ok(DirectoryResolution { pwd, cwd }) => (
            StatusCode::OK,
            Json(PreflightBody {
                cwd: cwd.unwrap_or_else(|| pwd.clone()),
                pwd,
            }),
        )
            .into_response(),
        Err(error) if error.is_recoverable() => error_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            &error.to_string(),
            true,
        ),
        Err(error) => {
            #[cfg(not(coverage_nightly))]
            error!(%error, host = %config.host, "Preflight directory check failed.");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error", false)
        }
    }
}

async fn socket<C, R>(
    ws: WebSocketUpgrade,
    State(context): State<Arc<GatewayContext<C, R>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    host: Option<Path<String>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response
where
    C: UpstreamConnector,
    R: HostResolver + Send + Sync + 'static,
{
    // Requests without an identity are still upgraded, so that the session can
    // report the problem over the socket.
    let identity = identity(&headers, &context);
    let request = session_request(host, query, &headers);
    ws.on_upgrade(move |socket| bridge(socket, peer, context, identity, request))
}

// Joins a WebSocket to a gateway session until the session ends.
async fn bridge<C, R>(
    socket: WebSocket,
    peer: SocketAddr,
    context: Arc<GatewayContext<C, R>>,
    identity: Option<Identity>,
    request: SessionRequest,
) where
    C: UpstreamConnector,
    R: HostResolver + Send + Sync + 'static,
{
    let id = next_session_id();
    let (browser, mut outbound) = BrowserHandle::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (mut sink, mut stream) = socket.split();
    let mut writer = DroppableHandle(tokio::spawn(async move {
        while let Some(command) = outbound.recv().await {
            let message = match command {
                BrowserCommand::Output(data) => Message::Binary(data),
                BrowserCommand::Event(event) => match serde_json::to_string(&event) {
                    Ok(text) => Message::Text(text.into()),
                    Err(_) => continue,
                },
                BrowserCommand::Disconnect => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    }));
    let _reader = DroppableHandle(tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(Message::Binary(data)) => BrowserMessage::Data(data),
                Ok(Message::Text(text)) => match BrowserMessage::from_text(text.as_str()) {
                    Some(message) => message,
                    None => continue,
                },
                Ok(Message::Close(frame)) => BrowserMessage::Disconnect(
                    frame
                        .map(|frame| frame.reason.as_str().to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "client namespace disconnect".into()),
                ),
                Ok(_) => continue,
                Err(error) => BrowserMessage::Error(error.to_string()),
            };
            let last = matches!(
                message,
                BrowserMessage::Disconnect(_) | BrowserMessage::Error(_)
            );
            if inbound_tx.send(message).is_err() || last {
                return;
            }
        }
        let _ = inbound_tx.send(BrowserMessage::Disconnect("transport close".into()));
    }));
    let outcome = GatewaySession::new(id, peer, context, browser, inbound_rx)
        .run(identity, request)
        .await;
    #[cfg(not(coverage_nightly))]
    debug!(session = %id, %peer, ?outcome, "Session ended.");
    let _ = timeout(FLUSH_TIMEOUT, &mut writer.0).await;
}
