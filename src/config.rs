//! Command-line interface.
//!
//! One binary, two modes. Without a positional argument it shares the local
//! terminal; with a session URL it joins an existing one:
//!
//! ```text
//! ttyshare [flags]          # share: run a command and serve it
//! ttyshare <session URL>    # join: attach from another terminal
//! ```

use std::path::PathBuf;

use clap::Parser;

fn default_command() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "bash".to_string())
}

/// Share an interactive terminal over HTTP/WebSockets.
#[derive(Parser, Debug)]
#[command(name = "ttyshare", version, about)]
pub struct Cli {
    /// URL of an existing session to join. Omit it to share a new session.
    pub url: Option<String>,

    /// The command to run (defaults to $SHELL).
    #[arg(long, default_value_t = default_command())]
    pub command: String,

    /// Arguments for the command, whitespace separated.
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub args: String,

    /// Address the gateway listens on.
    #[arg(long, default_value = "localhost:8000")]
    pub listen: String,

    /// Viewers can watch but their input is dropped.
    #[arg(long)]
    pub readonly: bool,

    /// Expose the session publicly through a tty-proxy server.
    #[arg(long)]
    pub public: bool,

    /// Address of the proxy used for public sessions.
    #[arg(long, default_value = "localhost:9000")]
    pub tty_proxy: String,

    /// Connect to the proxy without TLS (debugging only).
    #[arg(long)]
    pub no_tls: bool,

    /// Serve frontend files from this directory instead of the embedded ones.
    #[arg(long)]
    pub frontend_path: Option<PathBuf>,

    /// URL path the gateway routes are nested under.
    #[arg(long, default_value = "")]
    pub base_url_path: String,

    /// Allow cross-origin WebSocket upgrades.
    #[arg(long)]
    pub cross_origin: bool,

    /// Allow joining clients to open TCP tunnels (-L) through this session.
    #[arg(short = 'A', long)]
    pub allow_tunneling: bool,

    /// Encrypt the session; the key is appended to the printed URLs as a
    /// fragment and never sent to the gateway or proxy.
    #[arg(long)]
    pub encrypt: bool,

    /// Share without a controlling terminal (no local echo or input).
    #[arg(long)]
    pub headless: bool,

    /// Terminal width for --headless.
    #[arg(long, default_value_t = 80)]
    pub headless_cols: u16,

    /// Terminal height for --headless.
    #[arg(long, default_value_t = 25)]
    pub headless_rows: u16,

    /// Start the command right away instead of waiting for Enter.
    #[arg(long)]
    pub no_wait: bool,

    /// Key sequence that detaches from the session.
    #[arg(long, default_value = "ctrl-o,ctrl-c")]
    pub detach_keys: String,

    /// Forward a local port through the session (joining mode).
    #[arg(short = 'L', long = "tunnel", value_name = "local:host:port")]
    pub tunnel: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    /// The command's arguments, split on whitespace.
    pub fn command_args(&self) -> Vec<String> {
        self.args.split_whitespace().map(String::from).collect()
    }

    /// Base URL path normalized to either empty or `/prefix` with no
    /// trailing slash.
    pub fn normalized_base_path(&self) -> String {
        let trimmed = self.base_url_path.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_url_switches_to_join_mode() {
        let cli = Cli::try_parse_from(["ttyshare", "http://localhost:8000/s/local/"]).unwrap();
        assert_eq!(cli.url.as_deref(), Some("http://localhost:8000/s/local/"));
    }

    #[test]
    fn share_mode_flags() {
        let cli = Cli::try_parse_from([
            "ttyshare",
            "--command",
            "bash",
            "--args",
            "-l -i",
            "--readonly",
            "--public",
            "-A",
            "--listen",
            "0.0.0.0:9999",
        ])
        .unwrap();
        assert!(cli.url.is_none());
        assert_eq!(cli.command, "bash");
        assert_eq!(cli.command_args(), vec!["-l", "-i"]);
        assert!(cli.readonly && cli.public && cli.allow_tunneling);
        assert_eq!(cli.listen, "0.0.0.0:9999");
    }

    #[test]
    fn join_mode_tunnel_flag() {
        let cli = Cli::try_parse_from([
            "ttyshare",
            "http://example.com/s/abc/",
            "-L",
            "7001:example.test:80",
        ])
        .unwrap();
        assert_eq!(cli.tunnel.as_deref(), Some("7001:example.test:80"));
    }

    #[test]
    fn base_path_is_normalized() {
        let mk = |p: &str| Cli::try_parse_from(["ttyshare", "--base-url-path", p]).unwrap();
        assert_eq!(mk("").normalized_base_path(), "");
        assert_eq!(mk("/").normalized_base_path(), "");
        assert_eq!(mk("tty").normalized_base_path(), "/tty");
        assert_eq!(mk("/tty/").normalized_base_path(), "/tty");
    }

    #[test]
    fn defaults_match_the_docs() {
        let cli = Cli::try_parse_from(["ttyshare"]).unwrap();
        assert_eq!(cli.listen, "localhost:8000");
        assert_eq!(cli.detach_keys, "ctrl-o,ctrl-c");
        assert_eq!((cli.headless_cols, cli.headless_rows), (80, 25));
    }
}
