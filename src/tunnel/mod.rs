//! TCP tunneling over multiplexed byte streams.
//!
//! Both tunnel planes fold a stream multiplexer over a single reliable
//! connection: the reverse-proxy dialer ([`proxy`]) accepts substreams that
//! carry public HTTP requests toward the local gateway, and the joining-side
//! forwarder ([`forward`]) opens one substream per accepted local TCP
//! connection. Neither plane ever touches the terminal session.

pub mod forward;
pub mod proxy;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_yamux::session::Session as YamuxSession;
use tracing::debug;

/// Keep a mux session polled so substreams opened through its control handle
/// make progress. This side opens streams and never expects inbound ones;
/// any that show up are dropped.
pub async fn drive_mux<T>(mut session: YamuxSession<T>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match session.next().await {
            Some(Ok(_)) => debug!("dropping unexpected inbound substream"),
            Some(Err(e)) => {
                debug!("mux session finished: {e}");
                break;
            }
            None => break,
        }
    }
}
