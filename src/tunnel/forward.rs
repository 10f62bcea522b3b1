//! Joining-side TCP tunnel (`-L local:host:port`).
//!
//! Listens on a local port and carries each accepted connection as one
//! substream over the tunnel WebSocket; the sharing side dials the remote
//! address for each. Failures here terminate the tunnel loop but never the
//! terminal session, which runs on its own WebSocket.

use std::io;

use futures::SinkExt;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::session::Session as YamuxSession;
use tracing::{debug, info, warn};

use crate::server::TunnelInit;
use crate::ws::WsByteStream;

/// A parsed `-L local:host:port` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Port to listen on locally (bound on 127.0.0.1).
    pub local_port: u16,
    /// `host:port` the sharing side dials for every substream.
    pub remote_address: String,
}

pub fn parse_tunnel_spec(spec: &str) -> Result<TunnelSpec, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (local, host, port) = match parts.as_slice() {
        [local, host, port] => (*local, *host, *port),
        _ => return Err(format!("expected local:host:port, got {spec:?}")),
    };
    let local_port: u16 = local
        .parse()
        .map_err(|_| format!("invalid local port {local:?}"))?;
    if host.is_empty() {
        return Err(format!("missing remote host in {spec:?}"));
    }
    port.parse::<u16>()
        .map_err(|_| format!("invalid remote port {port:?}"))?;
    Ok(TunnelSpec {
        local_port,
        remote_address: format!("{host}:{port}"),
    })
}

/// Dial the tunnel WebSocket, announce the remote address, then serve local
/// connections until the listener or the mux gives up.
pub async fn run_tunnel(ws_url: String, spec: TunnelSpec) -> io::Result<()> {
    let (mut socket, _) = connect_async(ws_url.as_str()).await.map_err(io::Error::other)?;

    let init = serde_json::to_string(&TunnelInit {
        address: spec.remote_address.clone(),
    })?;
    socket
        .send(Message::Text(init.into()))
        .await
        .map_err(io::Error::other)?;

    // After the init frame the socket is a binary mux pipe. This side opens
    // substreams; the sharing side accepts.
    let transport = WsByteStream::new(socket);
    let session = YamuxSession::new_client(transport, YamuxConfig::default());
    let mut control = session.control();
    tokio::spawn(crate::tunnel::drive_mux(session));

    let listener = TcpListener::bind(("127.0.0.1", spec.local_port)).await?;
    info!(
        "tunnel: 127.0.0.1:{} -> {}",
        spec.local_port, spec.remote_address
    );

    loop {
        let (mut local, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("tunnel: cannot accept local connections: {e}");
                break;
            }
        };
        let mut substream = match control.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("tunnel: cannot open a substream: {e}");
                break;
            }
        };
        debug!(%peer, "tunnel connection opened");
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut local, &mut substream).await;
        });
    }
    Ok(())
}
