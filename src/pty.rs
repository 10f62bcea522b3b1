//! PTY master: allocation, child spawning, resize, and the redraw hiccup.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd stays alive for
//! the whole session so resize ioctls keep working; the read and write halves
//! handed to the I/O pumps are independent dups of it.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};
use tracing::debug;

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// A running child command attached to a PTY.
pub struct PtyMaster {
    master: OwnedFd,
    child: tokio::sync::Mutex<Child>,
    /// Last size set through [`resize`]; the redraw hiccup returns to it.
    ///
    /// [`resize`]: PtyMaster::resize
    size: Mutex<(u16, u16)>,
}

impl PtyMaster {
    /// Allocate a PTY of the given size and spawn `command` on its slave side.
    ///
    /// The child becomes a session leader with the PTY slave as its
    /// controlling terminal; stdin/stdout/stderr all point at the slave.
    /// `extra_env` is appended to the inherited environment.
    pub fn spawn(
        command: &str,
        args: &[String],
        cols: u16,
        rows: u16,
        extra_env: &[(String, String)],
    ) -> io::Result<Self> {
        let OpenptyResult { master, slave } =
            openpty(&winsize(cols, rows), None).map_err(io::Error::from)?;

        let slave_fd = slave.as_raw_fd();
        let mut cmd = Command::new(command);
        cmd.args(args).kill_on_drop(true);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }

        // The child's stdio is wired up in pre_exec (dup2 to the PTY slave),
        // so tokio must not set up pipes of its own.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // SAFETY: all syscalls used here are async-signal-safe per POSIX.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                    return Err(io::Error::last_os_error());
                }
                libc::dup2(slave_fd, 0);
                libc::dup2(slave_fd, 1);
                libc::dup2(slave_fd, 2);
                if slave_fd > 2 {
                    libc::close(slave_fd);
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        drop(slave);

        Ok(PtyMaster {
            master,
            child: tokio::sync::Mutex::new(child),
            size: Mutex::new((cols, rows)),
        })
    }

    fn dup_master(&self) -> io::Result<tokio::fs::File> {
        let fd: RawFd = unsafe { libc::dup(self.master.as_raw_fd()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: we own this fd via dup.
        Ok(tokio::fs::File::from_std(unsafe {
            std::fs::File::from_raw_fd(fd)
        }))
    }

    /// An async read handle on the PTY master (child output).
    pub fn reader(&self) -> io::Result<tokio::fs::File> {
        self.dup_master()
    }

    /// An async write handle on the PTY master (child input).
    pub fn writer(&self) -> io::Result<tokio::fs::File> {
        self.dup_master()
    }

    fn set_winsize_raw(&self, cols: u16, rows: u16) -> io::Result<()> {
        let size = winsize(cols, rows);
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize.
        let ret = unsafe {
            libc::ioctl(
                self.master.as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::addr_of!(size),
            )
        };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Resize the PTY. This is the size the redraw hiccup restores.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        self.set_winsize_raw(cols, rows)?;
        *self.size.lock().unwrap() = (cols, rows);
        Ok(())
    }

    /// Nudge the child into repainting its screen.
    ///
    /// There is no portable "redraw" ioctl, so the window briefly shrinks by
    /// one row and then returns to the true current size; nearly all terminal
    /// applications repaint on the way back. The second resize re-reads the
    /// stored size so a real resize arriving mid-hiccup wins.
    pub async fn refresh(&self) {
        let (cols, rows) = *self.size.lock().unwrap();
        if rows <= 1 {
            return;
        }
        if let Err(e) = self.set_winsize_raw(cols, rows - 1) {
            debug!("refresh resize failed: {e}");
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (cols, rows) = *self.size.lock().unwrap();
        if let Err(e) = self.set_winsize_raw(cols, rows) {
            debug!("refresh restore failed: {e}");
        }
    }

    /// Wait for the child to exit. Returns its exit code, `-1` if it was
    /// killed by a signal.
    pub async fn wait(&self) -> io::Result<i32> {
        let status = self.child.lock().await.wait().await?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Terminate the child: SIGTERM first, then SIGKILL shortly after, since
    /// shells tend to ignore a lone SIGTERM.
    pub async fn stop(&self) {
        let mut child = self.child.lock().await;
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn spawned_child_runs_under_a_tty() {
        let pty = PtyMaster::spawn("/bin/sh", &["-c".into(), "tty".into()], 80, 24, &[]).unwrap();
        let mut reader = pty.reader().unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
            }
        }
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("/dev/"), "expected a tty path, got: {text}");
        assert_eq!(pty.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exit_code_is_propagated() {
        let pty =
            PtyMaster::spawn("/bin/sh", &["-c".into(), "exit 3".into()], 80, 24, &[]).unwrap();
        assert_eq!(pty.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn resize_updates_stored_size() {
        let pty = PtyMaster::spawn("/bin/sh", &["-c".into(), "sleep 1".into()], 80, 24, &[])
            .unwrap();
        pty.resize(100, 30).unwrap();
        assert_eq!(*pty.size.lock().unwrap(), (100, 30));
        pty.stop().await;
    }
}
