use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpStream, time};
use tokio_tungstenite::accept_hdr_async_with_config;
use tracing::{debug, info, instrument, warn};
use tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    http::{header, HeaderValue, StatusCode},
    protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
};
use uuid::Uuid;

use crate::{
    server::{
        client::{ClientObserver, ClientSettings, ServerClient},
        stream::ServerStream,
        ServerState,
    },
    state::{AuthInfo, ClientInfo},
};

/// What the handshake callback learned about an accepted request.
struct Admission {
    info: ClientInfo,
    auth: Option<AuthInfo>,
    protocol: Option<HeaderValue>,
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_owned()));
    *response.status_mut() = status;
    response
}

/// Applies the handshake policy: path, origin, capacity, then authentication.
fn admit(state: &ServerState, request: &Request, addr: SocketAddr) -> Result<Admission, ErrorResponse> {
    if request.uri().path() != state.config.path {
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!(%addr, origin = ?origin, "origin rejected");
        return Err(reject(StatusCode::FORBIDDEN, "origin not allowed"));
    }

    if state.hub.client_count() >= state.config.max_connections {
        warn!(%addr, max = state.config.max_connections, "connection limit reached");
        return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "server at capacity"));
    }

    let authenticator = state.authenticator.read().clone();
    let auth = match authenticator {
        Some(authenticator) => match authenticator.authenticate(request) {
            Ok(identity) => Some(identity),
            Err(e) if state.config.auth_required => {
                warn!(%addr, error = %e, "authentication failed");
                return Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"));
            }
            Err(e) => {
                debug!(%addr, error = %e, "continuing anonymously");
                None
            }
        },
        None if state.config.auth_required => {
            return Err(reject(StatusCode::UNAUTHORIZED, "unauthorized"));
        }
        None => None,
    };

    let mut info = ClientInfo::new(Uuid::new_v4().to_string());
    info.remote_addr = Some(addr);
    info.user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    info.headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_owned())))
        .collect();

    // Echo the first offered subprotocol.
    let protocol = request
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').map(str::trim).find(|p| !p.is_empty()))
        .and_then(|p| HeaderValue::from_str(p).ok());

    Ok(Admission { info, auth, protocol })
}

fn websocket_config(max_message_size: usize) -> WebSocketConfig {
    let limit = (max_message_size > 0).then_some(max_message_size);
    WebSocketConfig {
        max_message_size: limit,
        max_frame_size: limit,
        ..Default::default()
    }
}

/// Takes one accepted TCP connection through admission, TLS, the WebSocket
/// handshake and registration, then hands it to its [`ServerClient`] loops.
#[instrument(skip(tcp, state))]
pub async fn handle_connection(tcp: TcpStream, addr: SocketAddr, state: Arc<ServerState>) {
    if !state.rate_limiter.check(addr.ip()) {
        debug!(%addr, "connection rate limit exceeded");
        state.metrics.rejected_connections.inc();
        return;
    }

    let stream = match &state.tls_acceptor {
        Some(acceptor) => match acceptor.accept(tcp).await {
            Ok(tls) => ServerStream::Tls(Box::new(tls)),
            Err(e) => {
                warn!(%addr, error = %e, "TLS handshake failed");
                state.metrics.rejected_connections.inc();
                return;
            }
        },
        None => ServerStream::Plain(tcp),
    };

    let tls = stream.is_tls();
    let mut admission = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let admitted = admit(&state, request, addr)?;
        if let Some(protocol) = admitted.protocol.clone() {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);
        }
        admission = Some(admitted);
        Ok(response)
    };

    let handshake = accept_hdr_async_with_config(
        stream,
        callback,
        Some(websocket_config(state.config.max_message_size)),
    );
    let mut ws = match time::timeout(state.config.write_timeout(), handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "WebSocket handshake failed");
            state.metrics.rejected_connections.inc();
            return;
        }
        Err(_) => {
            debug!(%addr, "WebSocket handshake timed out");
            state.metrics.rejected_connections.inc();
            return;
        }
    };
    let Some(Admission { info, auth, .. }) = admission else {
        return;
    };

    let client = ServerClient::new(info, auth, ClientSettings::from(state.config.as_ref()));
    if let Err(e) = state.hub.register_client(client.clone()).await {
        warn!(client_id = client.id(), error = %e, "registration failed");
        state.metrics.rejected_connections.inc();
        let frame = CloseFrame {
            code: CloseCode::Again,
            reason: "server unavailable".into(),
        };
        let _ = ws.close(Some(frame)).await;
        return;
    }

    state.metrics.connections.inc();
    state.metrics.connections_total.inc();
    info!(client_id = client.id(), %addr, tls, "client connected");

    let observer: Arc<dyn ClientObserver> = state.clone();
    client.start(ws, observer).await;
    state.notify_connect(&client);
}
