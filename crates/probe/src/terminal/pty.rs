// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Native PTY backend: `forkpty` a child shell, drive the master fd with
//! non-blocking async I/O, resize via `TIOCSWINSZ`.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use anyhow::{bail, Context};
use bytes::Bytes;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ExitStatus;

/// Newtype around the master fd for use with `AsyncFd`.
#[derive(Debug)]
pub struct PtyFd(pub OwnedFd);

impl AsRawFd for PtyFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// A child process attached to a pseudo-terminal.
pub struct NativePty {
    master: AsyncFd<PtyFd>,
    child_pid: Pid,
    reaped: bool,
}

impl NativePty {
    /// Spawn `command` (program + args) on a fresh PTY with the given
    /// dimensions.
    // forkpty requires unsafe: the post-fork child is partially
    // initialized until exec.
    #[allow(unsafe_code)]
    pub fn spawn(command: &[String], cols: u16, rows: u16) -> anyhow::Result<Self> {
        if command.is_empty() {
            bail!("empty command");
        }
        let winsize = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. The child immediately
        // execs.
        let result = unsafe { forkpty(Some(&winsize), None) }.context("forkpty failed")?;
        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("PICKET", "1");

                let c_args: Vec<CString> = command
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;
                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let master = AsyncFd::new(PtyFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master, child_pid: child, reaped: false })
            }
        }
    }

    pub fn child_pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }

    /// Drive the PTY until the child exits, the session is cancelled, or
    /// the output consumer goes away. Raw output chunks go to
    /// `output_tx`; raw input bytes arrive on `input_rx`; dimension
    /// changes on `resize_rx`.
    pub async fn run(
        mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<Bytes>,
        mut resize_rx: mpsc::Receiver<(u16, u16)>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        let mut buf = vec![0u8; 8192];
        let mut input_open = true;
        let mut resize_open = true;
        let mut killed = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    killed = true;
                    break;
                }

                result = read_chunk(&self.master, &mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            if output_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                killed = true;
                                break;
                            }
                        }
                        // EIO: the slave side closed (child exited).
                        Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                        Err(e) => {
                            self.kill_child().await;
                            self.reap().await?;
                            return Err(e.into());
                        }
                    }
                }

                input = input_rx.recv(), if input_open => {
                    match input {
                        Some(data) => write_all(&self.master, &data).await?,
                        None => input_open = false,
                    }
                }

                resize = resize_rx.recv(), if resize_open => {
                    match resize {
                        Some((cols, rows)) => {
                            if let Err(e) = self.resize(cols, rows) {
                                tracing::warn!(err = %e, pid = %pid, "pty resize failed");
                            }
                        }
                        None => resize_open = false,
                    }
                }
            }
        }

        if killed {
            self.kill_child().await;
        }
        self.reap().await
    }

    /// Update the PTY window size.
    // TIOCSWINSZ requires unsafe for the libc::ioctl call.
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
        // SAFETY: TIOCSWINSZ sets the window size on the PTY master fd;
        // the Winsize struct is fully initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    /// SIGHUP, short grace, SIGKILL. The grace period yields to the
    /// runtime; only `Drop` may block.
    async fn kill_child(&self) {
        let _ = kill(self.child_pid, Signal::SIGHUP);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let _ = kill(self.child_pid, Signal::SIGKILL);
    }

    /// Reap the child off the runtime and mark it collected.
    async fn reap(&mut self) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        let status = tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .context("join wait thread")??;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        // Best-effort shutdown for sessions dropped without a clean run.
        let _ = kill(self.child_pid, Signal::SIGHUP);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = kill(self.child_pid, Signal::SIGKILL);
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Block until the child exits.
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus { code: Some(code), signal: None });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => {
                return Ok(ExitStatus { code: None, signal: None });
            }
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

async fn read_chunk(afd: &AsyncFd<PtyFd>, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let mut guard = afd.readable().await?;
        match guard.try_io(|inner| {
            nix::unistd::read(inner.get_ref().0.as_fd(), buf).map_err(io_err)
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn write_all(afd: &AsyncFd<PtyFd>, data: &[u8]) -> io::Result<()> {
    let mut offset = 0;
    while offset < data.len() {
        let mut guard = afd.writable().await?;
        match guard.try_io(|inner| {
            nix::unistd::write(inner.get_ref().0.as_fd(), &data[offset..]).map_err(io_err)
        }) {
            Ok(Ok(n)) => offset += n,
            Ok(Err(e)) => return Err(e),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
