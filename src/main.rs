//! # ttyshare
//!
//! Share an interactive terminal between a local host and remote
//! participants, from the browser or from another `ttyshare` invocation.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, mode switch, sharing-process wiring
//! config.rs        — clap CLI for both modes
//! pty.rs           — PTY master: allocate, spawn, resize, redraw hiccup
//! proto/           — JSON wire protocol + AES-GCM envelope
//! ws.rs            — byte-stream adaptor over WebSockets (for the mux)
//! server/
//!   mod.rs         — HTTP/WebSocket gateway (axum)
//!   session.rs     — PTY fan-out to N viewers
//!   assets.rs      — embedded frontend
//! tunnel/
//!   proxy.rs       — reverse-proxy dialer for public sessions
//!   forward.rs     — joining-side -L TCP tunnel
//! client/          — joining client: pumps, mute policy, raw mode
//! ```
//!
//! The sharing process owns the PTY and the session; the gateway owns the
//! HTTP listener and all viewer streams; each viewer stream owns its
//! WebSocket.

mod client;
mod config;
mod proto;
mod pty;
mod server;
mod tunnel;
mod ws;

use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use client::keys::EscapeDetector;
use client::term;
use config::Cli;
use proto::{SessionKey, TtyCodec};
use pty::PtyMaster;
use server::session::TtySession;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    let code = match cli.url.clone() {
        Some(url) => run_join(cli, url).await,
        None => run_share(cli).await,
    };
    std::process::exit(code);
}

/// Logging goes to a file when `--logfile` is given; otherwise stderr, kept
/// quiet by default because stderr shares the screen with the raw terminal.
fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match &cli.logfile {
        Some(path) => match std::fs::File::create(path) {
            Ok(file) => {
                println!("Writing logs to: {}", path.display());
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
            }
            Err(e) => {
                eprintln!("Cannot open {} for writing logs: {e}", path.display());
                tracing_subscriber::fmt().with_env_filter(filter).init();
            }
        },
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

async fn run_join(cli: Cli, url: String) -> i32 {
    let config = client::JoinConfig {
        url,
        detach_keys: cli.detach_keys.clone(),
        tunnel: cli.tunnel.clone(),
    };
    match client::run(config).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Cannot connect to the remote session: {e}");
            1
        }
    }
}

#[allow(clippy::too_many_lines)]
async fn run_share(cli: Cli) -> i32 {
    if !cli.headless && !io::stdin().is_terminal() {
        eprintln!("Input is not a terminal; use --headless to share without one");
        return 1;
    }

    let detach_seq = match client::keys::parse_detach_keys(&cli.detach_keys) {
        Ok(seq) => seq,
        Err(e) => {
            eprintln!("Invalid detach keys: {e}");
            return 1;
        }
    };

    let key = cli.encrypt.then(SessionKey::generate);
    let fragment = key
        .as_ref()
        .map(|k| format!("#key={}", k.to_base64()))
        .unwrap_or_default();
    let base_path = cli.normalized_base_path();

    // A public session dials the proxy first: its session id becomes the
    // second gateway namespace and part of the printed URL.
    let mut public_session_id = None;
    let mut public_url = None;
    let mut proxy_conn = None;
    if cli.public {
        match tunnel::proxy::connect(&cli.tty_proxy, cli.no_tls).await {
            Ok(conn) => {
                println!("public session: {}{}", conn.public_url, fragment);
                public_session_id = Some(conn.session_id.clone());
                public_url = Some(conn.public_url.clone());
                proxy_conn = Some(conn);
            }
            Err(e) => {
                eprintln!("Cannot connect to the tty-proxy at {}: {e}", cli.tty_proxy);
                return 1;
            }
        }
    }

    println!(
        "local session: http://{}{}/s/local/{}",
        cli.listen, base_path, fragment
    );

    // Give the user a chance to copy the URL before the command takes over
    // the screen.
    if !cli.no_wait && !cli.headless {
        println!("Press Enter to continue!");
        let mut line = String::new();
        let _ = io::stdin().read_line(&mut line);
    }

    let (cols, rows) = if cli.headless {
        (cli.headless_cols, cli.headless_rows)
    } else {
        term::window_size().unwrap_or((80, 24))
    };

    let mut extra_env = vec![
        ("TTY_SHARE".to_string(), "1".to_string()),
        (
            "TTY_SHARE_LOCAL_URL".to_string(),
            format!("http://{}", cli.listen),
        ),
    ];
    if let Some(url) = &public_url {
        extra_env.push(("TTY_SHARE_PUBLIC_URL".to_string(), url.clone()));
    }

    let args = cli.command_args();
    let pty = match PtyMaster::spawn(&cli.command, &args, cols, rows, &extra_env) {
        Ok(pty) => Arc::new(pty),
        Err(e) => {
            eprintln!("Cannot start {:?}: {e}", cli.command);
            return 1;
        }
    };
    let (mut pty_reader, mut viewer_writer, mut stdin_writer) =
        match (pty.reader(), pty.writer(), pty.writer()) {
            (Ok(r), Ok(w1), Ok(w2)) => (r, w1, w2),
            _ => {
                eprintln!("Cannot open the PTY master");
                return 1;
            }
        };

    let codec = match key {
        Some(key) => TtyCodec::encrypted(key),
        None => TtyCodec::cleartext(),
    };
    let (pty_input_tx, mut pty_input_rx) = mpsc::channel::<Vec<u8>>(256);
    let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(4);
    let session = TtySession::new(codec, pty_input_tx, refresh_tx, cli.readonly);
    session.window_size(cols, rows);

    // Viewer input -> PTY. Read-only sessions never get anything here: the
    // session drops viewer writes before they reach the channel.
    tokio::spawn(async move {
        while let Some(data) = pty_input_rx.recv().await {
            if viewer_writer.write_all(&data).await.is_err() {
                break;
            }
            let _ = viewer_writer.flush().await;
        }
    });

    // Redraw requests from viewer attaches.
    {
        let pty = Arc::clone(&pty);
        tokio::spawn(async move {
            while refresh_rx.recv().await.is_some() {
                pty.refresh().await;
            }
        });
    }

    // Gateway.
    let gateway_config = server::GatewayConfig {
        public_session_id,
        base_path,
        allow_tunneling: cli.allow_tunneling,
        cross_origin: cli.cross_origin,
        frontend_path: cli.frontend_path.clone(),
    };
    let app = server::router(Arc::clone(&session), gateway_config);
    let listener = match tokio::net::TcpListener::bind(&cli.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Cannot listen on {}: {e}", cli.listen);
            return 1;
        }
    };
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("gateway error: {e}");
        }
    });

    // Public requests arriving over the proxy socket get spliced onto the
    // local gateway.
    let proxy_task = proxy_conn.map(|conn| {
        let gateway_addr = cli.listen.clone();
        tokio::spawn(conn.run(gateway_addr))
    });

    let raw_guard = if cli.headless {
        None
    } else {
        match term::RawModeGuard::enable() {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Cannot put the terminal in raw mode: {e}");
                return 1;
            }
        }
    };

    // PTY output pump: child -> local stdout (interactive mode) + viewers.
    let output_task = {
        let session = Arc::clone(&session);
        let headless = cli.headless;
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match pty_reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if !headless {
                            let mut out = io::stdout();
                            let _ = out.write_all(&buf[..n]);
                            let _ = out.flush();
                        }
                        session.write(&buf[..n]);
                    }
                }
            }
        })
    };

    // Host stdin -> PTY, honoring the host-side detach sequence.
    let (detach_tx, mut detach_rx) = mpsc::channel::<()>(1);
    let stdin_task = if cli.headless {
        None
    } else {
        let detach_tx = detach_tx.clone();
        Some(tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut detector = EscapeDetector::new(detach_seq);
            let mut buf = [0u8; 1024];
            loop {
                let n = match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let (bytes, detach) = detector.feed(&buf[..n]);
                if !bytes.is_empty() {
                    if stdin_writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                    let _ = stdin_writer.flush().await;
                }
                if detach {
                    let _ = detach_tx.send(()).await;
                    break;
                }
            }
        }))
    };

    // Host window changes propagate to the PTY and to every viewer.
    let winch_task = if cli.headless {
        None
    } else {
        let pty = Arc::clone(&pty);
        let session = Arc::clone(&session);
        Some(tokio::spawn(async move {
            let Ok(mut winch) = term::winch_stream() else {
                return;
            };
            while winch.recv().await.is_some() {
                if let Ok((cols, rows)) = term::window_size() {
                    debug!("new window size: {cols}x{rows}");
                    if let Err(e) = pty.resize(cols, rows) {
                        warn!("cannot resize the PTY: {e}");
                    }
                    session.window_size(cols, rows);
                }
            }
        }))
    };

    // Run until the child exits or the host detaches.
    tokio::select! {
        _ = pty.wait() => {}
        _ = detach_rx.recv() => {
            pty.stop().await;
        }
    }

    drop(raw_guard);
    println!("tty-share finished");

    server_task.abort();
    output_task.abort();
    if let Some(task) = stdin_task {
        task.abort();
    }
    if let Some(task) = winch_task {
        task.abort();
    }
    if let Some(task) = proxy_task {
        task.abort();
    }
    0
}
