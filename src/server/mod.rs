//! HTTP/WebSocket gateway for a shared terminal.
//!
//! ## Routes
//!
//! Installed under both path namespaces at once — `local` and, when a public
//! session is active, the proxy-assigned session id. `B` is the optional
//! configured base path:
//!
//! | Method | Path                        | Purpose                          |
//! |--------|-----------------------------|----------------------------------|
//! | GET    | `B/s/{sid}/`                | Viewer page + discovery headers  |
//! | GET    | `B/s/{sid}/static/{file}`   | Embedded static assets           |
//! | GET    | `B/s/{sid}/ws`              | Terminal WebSocket               |
//! | GET    | `B/s/{sid}/tws`             | Tunnel WebSocket (if enabled)    |
//!
//! The page response advertises the WebSocket paths so clients never
//! hard-code them:
//!
//! - `TTYSHARE-VERSION: 2`
//! - `TTYSHARE-TTY-WSPATH`, `TTYSHARE-TUNNEL-WSPATH`
//! - `TTYSHARE-WSPATH` — deprecated alias of the tty path, still emitted so
//!   older joining binaries keep working.

pub mod assets;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{future, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::session::Session as YamuxSession;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::ws::WsByteStream;
use session::TtySession;

/// Identifier of the private (non-proxied) session namespace.
pub const LOCAL_SESSION: &str = "local";

pub const HEADER_VERSION: &str = "ttyshare-version";
pub const HEADER_TTY_WSPATH: &str = "ttyshare-tty-wspath";
pub const HEADER_TUNNEL_WSPATH: &str = "ttyshare-tunnel-wspath";
/// Deprecated alias of [`HEADER_TTY_WSPATH`]; removal would break older
/// joining binaries.
pub const HEADER_LEGACY_WSPATH: &str = "ttyshare-wspath";

/// Protocol version advertised to clients. Tunnels require at least 2.
pub const PROTOCOL_VERSION: &str = "2";

/// First frame on a tunnel WebSocket; everything after it is mux bytes.
#[derive(Serialize, Deserialize)]
pub struct TunnelInit {
    #[serde(rename = "Address")]
    pub address: String,
}

/// Gateway settings fixed at startup.
#[derive(Clone, Default)]
pub struct GatewayConfig {
    /// Public session id assigned by the reverse proxy, if any.
    pub public_session_id: Option<String>,
    /// Optional URL prefix the whole route tree is nested under
    /// (empty or `/prefix`).
    pub base_path: String,
    /// Whether `tws` upgrades are honored.
    pub allow_tunneling: bool,
    /// Skip the same-origin check on WebSocket upgrades.
    pub cross_origin: bool,
    /// Serve frontend files from disk instead of the embedded copies.
    pub frontend_path: Option<PathBuf>,
}

#[derive(Clone)]
struct GatewayState {
    session: Arc<TtySession>,
    config: Arc<GatewayConfig>,
}

impl GatewayState {
    fn valid_session(&self, sid: &str) -> bool {
        sid == LOCAL_SESSION || Some(sid) == self.config.public_session_id.as_deref()
    }

    fn path_prefix(&self, sid: &str) -> String {
        format!("{}/s/{sid}", self.config.base_path)
    }

    async fn template(&self, name: &str) -> Option<String> {
        let raw = assets::load(self.config.frontend_path.as_deref(), name).await?;
        Some(String::from_utf8_lossy(&raw).into_owned())
    }

    /// The 404 page links back to the public session when one exists, else to
    /// the local one.
    async fn not_found_page(&self) -> Response {
        let sid = self
            .config
            .public_session_id
            .as_deref()
            .unwrap_or(LOCAL_SESSION);
        let prefix = self.path_prefix(sid);
        match self.template(assets::NOT_FOUND_TEMPLATE).await {
            Some(template) => (
                StatusCode::NOT_FOUND,
                Html(assets::render(&template, &prefix, "")),
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        }
    }
}

/// Build the gateway router for a session.
pub fn router(session: Arc<TtySession>, config: GatewayConfig) -> Router {
    let base_path = config.base_path.clone();
    let state = GatewayState {
        session,
        config: Arc::new(config),
    };

    let routes = Router::new()
        .route("/s/{sid}/", get(session_page))
        .route("/s/{sid}/static/{*file}", get(static_asset))
        .route("/s/{sid}/ws", get(terminal_ws))
        .route("/s/{sid}/tws", get(tunnel_ws));

    let app = if base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&base_path, routes)
    };

    app.fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn put_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        }
        Err(_) => warn!("skipping invalid header value for {name}"),
    }
}

/// `GET B/s/{sid}/` — the viewer page, with the WebSocket paths advertised in
/// response headers.
async fn session_page(
    State(state): State<GatewayState>,
    Path(sid): Path<String>,
) -> Response {
    if !state.valid_session(&sid) {
        return state.not_found_page().await;
    }
    let prefix = state.path_prefix(&sid);
    let tty_path = format!("{prefix}/ws");
    let tunnel_path = format!("{prefix}/tws");

    let Some(template) = state.template(assets::VIEWER_TEMPLATE).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let body = assets::render(&template, &prefix, &tty_path);

    let mut headers = HeaderMap::new();
    put_header(&mut headers, HEADER_VERSION, PROTOCOL_VERSION);
    put_header(&mut headers, HEADER_TTY_WSPATH, &tty_path);
    put_header(&mut headers, HEADER_LEGACY_WSPATH, &tty_path);
    if state.config.allow_tunneling {
        put_header(&mut headers, HEADER_TUNNEL_WSPATH, &tunnel_path);
    }
    (headers, Html(body)).into_response()
}

/// `GET B/s/{sid}/static/{file}`
async fn static_asset(
    State(state): State<GatewayState>,
    Path((sid, file)): Path<(String, String)>,
) -> Response {
    if !state.valid_session(&sid) || file.contains("..") {
        return state.not_found_page().await;
    }
    match assets::load(state.config.frontend_path.as_deref(), &file).await {
        Some(data) => (
            [(header::CONTENT_TYPE, assets::content_type(&file))],
            data,
        )
            .into_response(),
        None => state.not_found_page().await,
    }
}

/// Best-effort same-origin check for browser upgrades, bypassed with
/// `--cross-origin`. Non-browser clients send no `Origin` header and pass.
fn same_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let Ok(origin_url) = url::Url::parse(origin) else {
        return false;
    };
    let origin_host = match (origin_url.host_str(), origin_url.port()) {
        (Some(h), Some(p)) => format!("{h}:{p}"),
        (Some(h), None) => h.to_string(),
        _ => return false,
    };
    origin_host.eq_ignore_ascii_case(host)
}

/// `GET B/s/{sid}/ws` — terminal WebSocket upgrade.
async fn terminal_ws(
    State(state): State<GatewayState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.valid_session(&sid) {
        return state.not_found_page().await;
    }
    if !state.config.cross_origin && !same_origin(&headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_terminal_socket(state, socket))
}

async fn handle_terminal_socket(state: GatewayState, socket: WebSocket) {
    let (sink, stream) = socket.split();
    // Protocol frames travel as text; the sink lock inside the viewer's
    // writer task serializes concurrent senders.
    let sink = sink.with(|frame: String| {
        future::ready(Ok::<_, axum::Error>(Message::Text(frame.into())))
    });
    let viewer = state.session.start_viewer(sink);
    state.session.attach(&viewer);
    debug!(viewers = state.session.viewer_count(), "viewer connected");
    state.session.run_viewer(viewer, stream).await;
}

/// `GET B/s/{sid}/tws` — tunnel WebSocket upgrade.
async fn tunnel_ws(
    State(state): State<GatewayState>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.valid_session(&sid) || !state.config.allow_tunneling {
        return state.not_found_page().await;
    }
    if !state.config.cross_origin && !same_origin(&headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(handle_tunnel_socket)
}

/// Read the init frame, then serve mux substreams: each one is spliced onto a
/// fresh TCP connection to the address the client asked for.
async fn handle_tunnel_socket(mut socket: WebSocket) {
    let init = loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {
                warn!("tunnel: expected a text init frame");
                return;
            }
            Some(Err(e)) => {
                warn!("tunnel: cannot read the init frame: {e}");
                return;
            }
        }
    };
    let init: TunnelInit = match serde_json::from_str(init.as_str()) {
        Ok(init) => init,
        Err(e) => {
            warn!("tunnel: cannot decode the init frame: {e}");
            return;
        }
    };
    info!(address = %init.address, "tunnel opened");

    let transport = WsByteStream::new(socket);
    let mut mux = YamuxSession::new_server(transport, YamuxConfig::default());
    loop {
        match mux.next().await {
            Some(Ok(mut substream)) => {
                let address = init.address.clone();
                tokio::spawn(async move {
                    match TcpStream::connect(&address).await {
                        Ok(mut local) => {
                            let _ = tokio::io::copy_bidirectional(&mut substream, &mut local).await;
                        }
                        Err(e) => warn!("tunnel: cannot dial {address}: {e}"),
                    }
                });
            }
            Some(Err(e)) => {
                debug!("tunnel mux finished: {e}");
                break;
            }
            None => break,
        }
    }
}

async fn not_found(State(state): State<GatewayState>) -> Response {
    state.not_found_page().await
}
