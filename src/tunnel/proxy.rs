//! Reverse-proxy dialer: expose the local gateway through a public relay.
//!
//! Exactly one outbound TCP connection (TLS unless `--no-tls`) is opened to
//! the proxy. A line-delimited JSON hello is exchanged, after which the raw
//! socket belongs to the stream multiplexer with this side accepting. Every
//! accepted substream is one front-facing HTTP request, spliced onto a fresh
//! TCP connection to the local gateway.
//!
//! There is no reconnect. The proxy-assigned session id is part of the
//! public URL, so transparently reconnecting would hand the user a session
//! identity different from the one already printed; a lost proxy socket ends
//! the public exposure and is logged.

use std::io;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::MaybeTlsStream;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::session::Session as YamuxSession;
use tracing::{debug, error, info};

#[derive(Serialize)]
struct HelloClient {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Data")]
    data: String,
}

#[derive(Deserialize)]
struct HelloServer {
    #[serde(rename = "Version", default)]
    version: String,
    #[serde(rename = "SessionID")]
    session_id: String,
    #[serde(rename = "PublicURL")]
    public_url: String,
}

type ProxyStream = BufReader<MaybeTlsStream<TcpStream>>;

/// An established proxy connection, ready to serve public requests.
pub struct ProxyConnection {
    /// Session id assigned by the proxy; becomes the public path namespace.
    pub session_id: String,
    /// URL to hand to the user.
    pub public_url: String,
    mux: YamuxSession<ProxyStream>,
}

/// Dial the proxy and run the hello exchange.
///
/// The hello is read through a buffered reader and the same buffered stream
/// is handed to the multiplexer, so bytes the proxy sends right behind its
/// hello are not lost.
pub async fn connect(proxy_addr: &str, no_tls: bool) -> io::Result<ProxyConnection> {
    let tcp = TcpStream::connect(proxy_addr).await?;
    let stream = if no_tls {
        MaybeTlsStream::Plain(tcp)
    } else {
        let connector = native_tls::TlsConnector::new().map_err(io::Error::other)?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let domain = proxy_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(proxy_addr);
        let tls = connector
            .connect(domain, tcp)
            .await
            .map_err(io::Error::other)?;
        MaybeTlsStream::NativeTls(tls)
    };
    let mut stream = BufReader::new(stream);

    let mut hello = serde_json::to_vec(&HelloClient {
        version: "1".to_string(),
        data: "-".to_string(),
    })?;
    hello.push(b'\n');
    stream.write_all(&hello).await?;
    stream.flush().await?;

    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "proxy closed the connection during the hello exchange",
        ));
    }
    let hello: HelloServer = serde_json::from_str(line.trim()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed proxy hello: {e}"),
        )
    })?;
    debug!(
        version = %hello.version,
        session = %hello.session_id,
        "proxy hello complete"
    );

    Ok(ProxyConnection {
        session_id: hello.session_id,
        public_url: hello.public_url,
        mux: YamuxSession::new_server(stream, YamuxConfig::default()),
    })
}

impl ProxyConnection {
    /// Accept substreams until the proxy socket dies, splicing each onto a
    /// TCP connection to the local gateway at `gateway_addr`.
    pub async fn run(mut self, gateway_addr: String) {
        loop {
            match self.mux.next().await {
                Some(Ok(mut substream)) => {
                    let addr = gateway_addr.clone();
                    tokio::spawn(async move {
                        match TcpStream::connect(&addr).await {
                            Ok(mut local) => {
                                let _ =
                                    tokio::io::copy_bidirectional(&mut substream, &mut local).await;
                            }
                            Err(e) => {
                                error!("cannot reach the local gateway at {addr}: {e}");
                            }
                        }
                    });
                }
                Some(Err(e)) => {
                    error!("tty-proxy connection closed: {e}");
                    break;
                }
                None => {
                    info!("tty-proxy connection closed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn hello_client_wire_shape() {
        let hello = serde_json::to_string(&HelloClient {
            version: "1".into(),
            data: "-".into(),
        })
        .unwrap();
        let value: Value = serde_json::from_str(&hello).unwrap();
        assert_eq!(value["Version"], "1");
        assert_eq!(value["Data"], "-");
    }

    #[test]
    fn hello_server_parses_proxy_reply() {
        let reply = r#"{"Version":"1","SessionID":"NmQzu9","PublicURL":"https://on.tty-share.com/s/NmQzu9/","Data":"-"}"#;
        let hello: HelloServer = serde_json::from_str(reply).unwrap();
        assert_eq!(hello.session_id, "NmQzu9");
        assert_eq!(hello.public_url, "https://on.tty-share.com/s/NmQzu9/");
    }
}
