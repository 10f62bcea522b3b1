//! Local terminal control for the joining side.

use std::io::{self, Write};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Puts the terminal into raw mode and restores it on drop, so an early
/// return or panic never leaves the user's shell unusable.
pub struct RawModeGuard(());

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(RawModeGuard(()))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current local window size as `(cols, rows)`.
pub fn window_size() -> io::Result<(u16, u16)> {
    size()
}

/// Stream of local window-change notifications (SIGWINCH).
pub fn winch_stream() -> io::Result<Signal> {
    signal(SignalKind::window_change())
}

pub fn clear_screen() {
    let mut out = io::stdout();
    let _ = out.write_all(b"\x1b[H\x1b[2J");
    let _ = out.flush();
}
