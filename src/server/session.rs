//! Session fan-out: one PTY, any number of viewers.
//!
//! The session broadcasts child output to every attached viewer and feeds
//! viewer keystrokes back into the PTY (or drops them when the session is
//! read-only). The viewer set sits behind a reader/writer lock and fan-out
//! iterates over a snapshot, so a broadcast never blocks attach/detach.
//!
//! Each viewer gets a bounded outbound queue drained by its own writer task;
//! a slow viewer overflows its queue and loses frames instead of stalling the
//! PTY pump or its faster peers. The failing viewer is reaped when its read
//! loop errors out.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::proto::{TtyCodec, TtyMessage};
use crate::ws::{FrameData, WsFrame};

/// Outbound frames buffered per viewer before overflow drops kick in.
const VIEWER_QUEUE: usize = 256;

/// One attached consumer of session output.
pub struct Viewer {
    id: u64,
    outbound: mpsc::Sender<String>,
}

/// Shared state of a single shared terminal.
pub struct TtySession {
    codec: TtyCodec,
    viewers: RwLock<Vec<Arc<Viewer>>>,
    last_winsize: RwLock<Option<(u16, u16)>>,
    pty_input: mpsc::Sender<Vec<u8>>,
    refresh: mpsc::Sender<()>,
    readonly: bool,
    next_id: AtomicU64,
}

impl TtySession {
    /// Create a session. `pty_input` receives viewer keystrokes (unless
    /// `readonly`), `refresh` is signalled whenever a redraw of the child is
    /// wanted (new viewer attached).
    pub fn new(
        codec: TtyCodec,
        pty_input: mpsc::Sender<Vec<u8>>,
        refresh: mpsc::Sender<()>,
        readonly: bool,
    ) -> Arc<Self> {
        Arc::new(TtySession {
            codec,
            viewers: RwLock::new(Vec::new()),
            last_winsize: RwLock::new(None),
            pty_input,
            refresh,
            readonly,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create a viewer whose frames are written to `sink` by a dedicated
    /// task. The viewer is not visible to broadcasts until [`attach`]ed.
    ///
    /// [`attach`]: TtySession::attach
    pub fn start_viewer<S>(&self, sink: S) -> Arc<Viewer>
    where
        S: Sink<String> + Send + Unpin + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<String>(VIEWER_QUEUE);
        tokio::spawn(async move {
            let mut sink = sink;
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
        Arc::new(Viewer { id, outbound: tx })
    }

    /// Broadcast child output to every attached viewer. Per-viewer failures
    /// (full queue, dead writer) are logged and skipped; the broadcast never
    /// aborts. Returns the input length, so the session can sit behind any
    /// writer-shaped pump without short writes.
    pub fn write(&self, data: &[u8]) -> usize {
        match self.codec.encode_write(data) {
            Ok(frame) => self.broadcast(frame),
            Err(e) => warn!("cannot encode terminal output: {e}"),
        }
        data.len()
    }

    /// Record the window size and broadcast it. Rebroadcast even when the
    /// size is unchanged: a just-attached viewer may not have seen it yet.
    pub fn window_size(&self, cols: u16, rows: u16) {
        *self.last_winsize.write().unwrap() = Some((cols, rows));
        match self.codec.encode_winsize(cols, rows) {
            Ok(frame) => self.broadcast(frame),
            Err(e) => warn!("cannot encode window size: {e}"),
        }
    }

    fn broadcast(&self, frame: String) {
        let snapshot: Vec<Arc<Viewer>> = self.viewers.read().unwrap().clone();
        for viewer in snapshot {
            if viewer.outbound.try_send(frame.clone()).is_err() {
                warn!(viewer = viewer.id, "viewer not keeping up, dropping frame");
            }
        }
    }

    /// Add a viewer to the session. The latest window size (if any) is queued
    /// ahead of every later broadcast, and a PTY redraw is requested so the
    /// newcomer's screen is not blank.
    pub fn attach(&self, viewer: &Arc<Viewer>) {
        {
            let mut viewers = self.viewers.write().unwrap();
            if let Some((cols, rows)) = *self.last_winsize.read().unwrap() {
                if let Ok(frame) = self.codec.encode_winsize(cols, rows) {
                    let _ = viewer.outbound.try_send(frame);
                }
            }
            viewers.push(Arc::clone(viewer));
        }
        let _ = self.refresh.try_send(());
        debug!(viewer = viewer.id, "viewer attached");
    }

    pub fn detach(&self, viewer: &Viewer) {
        self.viewers.write().unwrap().retain(|v| v.id != viewer.id);
        debug!(viewer = viewer.id, "viewer detached");
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.read().unwrap().len()
    }

    /// Drive a viewer's read side until it disconnects.
    ///
    /// `Write` frames are forwarded to the PTY (dropped when read-only, so
    /// the socket never back-pressures and the viewer simply has no effect).
    /// `WinSize` frames from viewers are ignored: the host decides the
    /// window. Malformed or undecryptable frames are dropped and the loop
    /// continues; end-of-stream detaches the viewer before returning.
    pub async fn run_viewer<St, M>(&self, viewer: Arc<Viewer>, mut stream: St)
    where
        St: futures::Stream<Item = Result<M, M::Error>> + Unpin,
        M: WsFrame,
    {
        while let Some(next) = stream.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(err) => {
                    if !M::error_is_eof(&err) {
                        warn!(viewer = viewer.id, "viewer read error: {err}");
                    }
                    break;
                }
            };
            let data = match frame.into_frame_data() {
                FrameData::Data(data) => data,
                FrameData::Skip => continue,
                FrameData::Close => break,
            };
            let Ok(text) = std::str::from_utf8(&data) else {
                warn!(viewer = viewer.id, "dropping non-UTF-8 frame");
                continue;
            };
            match self.codec.decode(text) {
                Ok(TtyMessage::Write(input)) => {
                    if self.readonly {
                        continue;
                    }
                    if self.pty_input.send(input).await.is_err() {
                        break;
                    }
                }
                Ok(TtyMessage::WinSize { .. }) => {
                    // Policy: the host decides the window size.
                    debug!(viewer = viewer.id, "ignoring viewer window size");
                }
                Err(e) => {
                    warn!(viewer = viewer.id, "dropping frame: {e}");
                }
            }
        }
        self.detach(&viewer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::TtyCodec;
    use crate::ws::testing::{FakeMsg, FakeSocket};
    use bytes::Bytes;

    fn test_session(readonly: bool) -> (Arc<TtySession>, mpsc::Receiver<Vec<u8>>) {
        let (pty_tx, pty_rx) = mpsc::channel(16);
        let (refresh_tx, _refresh_rx) = mpsc::channel(4);
        (
            TtySession::new(TtyCodec::cleartext(), pty_tx, refresh_tx, readonly),
            pty_rx,
        )
    }

    fn channel_viewer(
        session: &TtySession,
    ) -> (Arc<Viewer>, futures::channel::mpsc::Receiver<String>) {
        let (sink, rx) = futures::channel::mpsc::channel::<String>(64);
        (session.start_viewer(sink), rx)
    }

    async fn next_message(rx: &mut futures::channel::mpsc::Receiver<String>) -> TtyMessage {
        let frame = rx.next().await.expect("viewer stream ended");
        TtyCodec::cleartext().decode(&frame).expect("bad frame")
    }

    #[tokio::test]
    async fn write_reaches_every_attached_viewer_once() {
        let (session, _pty_rx) = test_session(false);
        let (v1, mut rx1) = channel_viewer(&session);
        let (v2, mut rx2) = channel_viewer(&session);
        session.attach(&v1);
        session.attach(&v2);

        assert_eq!(session.write(b"hello viewers"), 13);

        for rx in [&mut rx1, &mut rx2] {
            match next_message(rx).await {
                TtyMessage::Write(data) => assert_eq!(data, b"hello viewers"),
                other => panic!("expected Write, got {other:?}"),
            }
        }
        // Exactly one frame each.
        assert!(rx1.try_next().is_err());
        assert!(rx2.try_next().is_err());
    }

    #[tokio::test]
    async fn late_viewer_sees_current_winsize_first() {
        let (session, _pty_rx) = test_session(false);
        session.window_size(100, 30);
        session.window_size(120, 40);

        let (viewer, mut rx) = channel_viewer(&session);
        session.attach(&viewer);
        session.write(b"after attach");

        match next_message(&mut rx).await {
            TtyMessage::WinSize { cols, rows } => {
                assert_eq!((cols, rows), (120, 40));
            }
            other => panic!("expected WinSize first, got {other:?}"),
        }
        match next_message(&mut rx).await {
            TtyMessage::Write(data) => assert_eq!(data, b"after attach"),
            other => panic!("expected Write, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn attach_requests_a_redraw() {
        let (pty_tx, _pty_rx) = mpsc::channel(16);
        let (refresh_tx, mut refresh_rx) = mpsc::channel(4);
        let session = TtySession::new(TtyCodec::cleartext(), pty_tx, refresh_tx, false);

        let (viewer, _rx) = channel_viewer(&session);
        session.attach(&viewer);
        assert!(refresh_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn viewer_input_reaches_the_pty() {
        let (session, mut pty_rx) = test_session(false);
        let (viewer, _rx) = channel_viewer(&session);
        session.attach(&viewer);

        let frame = TtyCodec::cleartext().encode_write(b"echo hi\n").unwrap();
        let socket = FakeSocket::new(vec![Ok(FakeMsg::Data(Bytes::from(frame)))]);
        session.run_viewer(viewer, socket).await;

        assert_eq!(pty_rx.recv().await.unwrap(), b"echo hi\n");
        assert_eq!(session.viewer_count(), 0);
    }

    #[tokio::test]
    async fn readonly_drops_viewer_input() {
        let (session, mut pty_rx) = test_session(true);
        let (viewer, _rx) = channel_viewer(&session);
        session.attach(&viewer);

        let frame = TtyCodec::cleartext().encode_write(b"rm -rf /\n").unwrap();
        let socket = FakeSocket::new(vec![Ok(FakeMsg::Data(Bytes::from(frame)))]);
        session.run_viewer(viewer, socket).await;

        assert!(pty_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn viewer_winsize_is_discarded() {
        let (session, mut pty_rx) = test_session(false);
        session.window_size(100, 30);
        let (viewer, _rx) = channel_viewer(&session);
        session.attach(&viewer);

        let frame = TtyCodec::cleartext().encode_winsize(20, 10).unwrap();
        let socket = FakeSocket::new(vec![Ok(FakeMsg::Data(Bytes::from(frame)))]);
        session.run_viewer(viewer, socket).await;

        assert_eq!(*session.last_winsize.read().unwrap(), Some((100, 30)));
        assert!(pty_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frames_do_not_end_the_viewer_loop() {
        let (session, mut pty_rx) = test_session(false);
        let (viewer, _rx) = channel_viewer(&session);
        session.attach(&viewer);

        let good = TtyCodec::cleartext().encode_write(b"still here\n").unwrap();
        let socket = FakeSocket::new(vec![
            Ok(FakeMsg::Data(Bytes::from_static(b"garbage"))),
            Ok(FakeMsg::Data(Bytes::from(good))),
        ]);
        session.run_viewer(viewer, socket).await;

        assert_eq!(pty_rx.recv().await.unwrap(), b"still here\n");
    }

    #[tokio::test]
    async fn detach_removes_only_that_viewer() {
        let (session, _pty_rx) = test_session(false);
        let (v1, _rx1) = channel_viewer(&session);
        let (v2, _rx2) = channel_viewer(&session);
        session.attach(&v1);
        session.attach(&v2);
        assert_eq!(session.viewer_count(), 2);

        session.detach(&v1);
        assert_eq!(session.viewer_count(), 1);
    }
}
