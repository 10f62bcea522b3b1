//! Joining client: attach to a shared session from another terminal.
//!
//! The client fetches the session page, learns the WebSocket paths from the
//! `TTYSHARE-*` response headers (they are never hard-coded), then runs three
//! concurrent roles:
//!
//! - an **input pump** copying stdin upstream as `Write` frames, with the
//!   detach sequence filtered out by an escape detector;
//! - an **output pump** decoding frames to stdout;
//! - a **resize monitor** pushing local window sizes upstream on SIGWINCH.
//!
//! Output (and input) are muted whenever the local window is smaller than
//! the remote one in either dimension, tracked by one atomic flag both pumps
//! read without blocking. An optional `-L` flag additionally forwards a
//! local TCP port through the tunnel WebSocket.

pub mod keys;
pub mod term;

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::proto::{ProtocolError, SessionKey, TtyCodec, TtyMessage};
use crate::server::{
    HEADER_LEGACY_WSPATH, HEADER_TTY_WSPATH, HEADER_TUNNEL_WSPATH, HEADER_VERSION,
};
use crate::tunnel::forward;
use crate::ws::WsFrame;

/// Serialized write access to the upstream socket.
type WsSink = Arc<tokio::sync::Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;

pub struct JoinConfig {
    /// Session URL, optionally carrying `#key=...`.
    pub url: String,
    /// Detach sequence specification, e.g. `ctrl-o,ctrl-c`.
    pub detach_keys: String,
    /// Optional `-L local:host:port` tunnel.
    pub tunnel: Option<String>,
}

/// Local and remote window dimensions, `(cols, rows)`.
struct WinSizes {
    local: (u16, u16),
    remote: (u16, u16),
}

struct ClientState {
    sizes: Mutex<WinSizes>,
    /// False while the local window is too small; both pumps consult it.
    output_enabled: AtomicBool,
    detach_label: String,
}

/// The mute predicate: suppressed iff the local window is smaller than the
/// remote one in either dimension.
fn is_muted(local: (u16, u16), remote: (u16, u16)) -> bool {
    local.1 < remote.1 || local.0 < remote.0
}

impl ClientState {
    /// Re-evaluate the mute decision after any size change. Entering the
    /// muted state replaces the screen with an explanation; leaving it clears
    /// the screen again and lets the host's redraw repaint it.
    fn update_mute(&self) {
        let (local, remote) = {
            let sizes = self.sizes.lock().unwrap();
            (sizes.local, sizes.remote)
        };
        debug!(
            "local window: {}x{}, remote window: {}x{}",
            local.0, local.1, remote.0, remote.1
        );
        if is_muted(local, remote) {
            self.output_enabled.store(false, Ordering::SeqCst);
            term::clear_screen();
            print!(
                "\n\rYour window is smaller than the remote window. \
                 Resize, or press <{}> to detach.\n\r\tRemote window: {}x{}\n\r\tYour window:   {}x{}\n\r",
                self.detach_label, remote.0, remote.1, local.0, local.1
            );
            let _ = io::stdout().flush();
        } else {
            if !self.output_enabled.load(Ordering::SeqCst) {
                term::clear_screen();
            }
            self.output_enabled.store(true, Ordering::SeqCst);
        }
    }
}

/// Extract the optional encryption key from the URL fragment. The fragment
/// never reaches the gateway, so the key stays between the two ends.
fn key_from_fragment(url: &Url) -> Result<Option<SessionKey>, ProtocolError> {
    match url.fragment().and_then(|f| f.strip_prefix("key=")) {
        Some(encoded) => Ok(Some(SessionKey::from_base64(encoded)?)),
        None => Ok(None),
    }
}

/// Build a WebSocket URL from the page URL's authority and an advertised path.
fn websocket_url(page: &Url, ws_path: &str) -> io::Result<String> {
    let scheme = if page.scheme() == "https" { "wss" } else { "ws" };
    let host = page
        .host_str()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "URL has no host"))?;
    Ok(match page.port() {
        Some(port) => format!("{scheme}://{host}:{port}{ws_path}"),
        None => format!("{scheme}://{host}{ws_path}"),
    })
}

async fn send_frame(sink: &WsSink, frame: String) -> bool {
    sink.lock()
        .await
        .send(Message::Text(frame.into()))
        .await
        .is_ok()
}

/// Run the joining side until the session ends or the detach sequence fires.
pub async fn run(config: JoinConfig) -> io::Result<()> {
    let detach_seq = keys::parse_detach_keys(&config.detach_keys)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut page_url = Url::parse(&config.url)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let key = key_from_fragment(&page_url)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    page_url.set_fragment(None);

    // Discover the WebSocket paths from the page's response headers.
    let resp = reqwest::get(page_url.clone())
        .await
        .map_err(io::Error::other)?;
    let header = |name: &str| -> Option<String> {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let version = header(HEADER_VERSION).unwrap_or_default();
    let tunnel_ws_path = header(HEADER_TUNNEL_WSPATH);
    let tty_ws_path = header(HEADER_TTY_WSPATH)
        .or_else(|| header(HEADER_LEGACY_WSPATH))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "this does not look like a tty-share session (no TTYSHARE headers)",
            )
        })?;

    // Tunnel, if requested. A pre-v2 gateway disables the tunnel alone; the
    // terminal session still runs.
    if let Some(spec) = &config.tunnel {
        let spec = forward::parse_tunnel_spec(spec)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let new_enough = version.parse::<u32>().map(|v| v >= 2).unwrap_or(false);
        match tunnel_ws_path.filter(|_| new_enough) {
            Some(path) => {
                let ws_url = websocket_url(&page_url, &path)?;
                tokio::spawn(async move {
                    if let Err(e) = forward::run_tunnel(ws_url, spec).await {
                        warn!("tunnel ended: {e}");
                    }
                });
            }
            None => eprintln!(
                "Cannot create a tunnel: the server does not support it (need protocol version 2)"
            ),
        }
    }

    let tty_ws_url = websocket_url(&page_url, &tty_ws_path)?;
    let (socket, _) = connect_async(tty_ws_url.as_str())
        .await
        .map_err(io::Error::other)?;
    let (sink, mut stream) = socket.split();
    let sink: WsSink = Arc::new(tokio::sync::Mutex::new(sink));

    let codec = match key {
        Some(key) => TtyCodec::encrypted(key),
        None => TtyCodec::cleartext(),
    };
    let state = Arc::new(ClientState {
        sizes: Mutex::new(WinSizes {
            local: term::window_size().unwrap_or((80, 24)),
            remote: (0, 0),
        }),
        output_enabled: AtomicBool::new(true),
        detach_label: config.detach_keys.clone(),
    });

    let _raw_mode = term::RawModeGuard::enable()?;
    term::clear_screen();

    // Tell the host our size once up front; it is free to ignore it.
    {
        let local = state.sizes.lock().unwrap().local;
        if let Ok(frame) = codec.encode_winsize(local.0, local.1) {
            send_frame(&sink, frame).await;
        }
    }

    // Input pump: stdin -> escape detector -> Write frames upstream. On
    // detach (or stdin EOF) it closes the socket, which unblocks the output
    // pump below.
    let input_task = tokio::spawn({
        let sink = Arc::clone(&sink);
        let codec = codec.clone();
        let state = Arc::clone(&state);
        async move {
            let mut stdin = tokio::io::stdin();
            let mut detector = keys::EscapeDetector::new(detach_seq);
            let mut buf = [0u8; 1024];
            loop {
                let n = match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let (bytes, detach) = detector.feed(&buf[..n]);
                // While muted, keys are neither forwarded nor echoed.
                if !bytes.is_empty() && state.output_enabled.load(Ordering::SeqCst) {
                    match codec.encode_write(&bytes) {
                        Ok(frame) => {
                            if !send_frame(&sink, frame).await {
                                break;
                            }
                        }
                        Err(e) => warn!("cannot encode input: {e}"),
                    }
                }
                if detach {
                    break;
                }
            }
            let _ = sink.lock().await.close().await;
        }
    });

    // Resize monitor: SIGWINCH -> recompute mute, notify the host.
    let winch_task = tokio::spawn({
        let sink = Arc::clone(&sink);
        let codec = codec.clone();
        let state = Arc::clone(&state);
        async move {
            let Ok(mut winch) = term::winch_stream() else {
                return;
            };
            while winch.recv().await.is_some() {
                if let Ok(local) = term::window_size() {
                    state.sizes.lock().unwrap().local = local;
                }
                state.update_mute();
                let local = state.sizes.lock().unwrap().local;
                if let Ok(frame) = codec.encode_winsize(local.0, local.1) {
                    if !send_frame(&sink, frame).await {
                        break;
                    }
                }
            }
        }
    });

    // Output pump: decode frames until the socket closes.
    while let Some(next) = stream.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(e) => {
                if !<Message as WsFrame>::error_is_eof(&e) {
                    warn!("connection error: {e}");
                }
                break;
            }
        };
        match msg {
            Message::Text(text) => match codec.decode(text.as_str()) {
                Ok(TtyMessage::Write(data)) => {
                    if state.output_enabled.load(Ordering::SeqCst) {
                        let mut out = io::stdout();
                        let _ = out.write_all(&data);
                        let _ = out.flush();
                    }
                }
                Ok(TtyMessage::WinSize { cols, rows }) => {
                    {
                        let mut sizes = state.sizes.lock().unwrap();
                        sizes.remote = (cols, rows);
                        if let Ok(local) = term::window_size() {
                            sizes.local = local;
                        }
                    }
                    state.update_mute();
                }
                Err(e) => warn!("dropping frame: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    winch_task.abort();
    input_task.abort();
    term::clear_screen();
    drop(_raw_mode);
    println!("tty-share disconnected");
    Ok(())
}
