//! PTY-backed shell session with replay buffer and subscriber fan-out.
//!
//! Each instance owns exactly one of these. The session spawns the user's
//! login shell on a PTY, keeps the most recent 16 KiB of output in a ring
//! buffer for late-subscriber catch-up, and fans every output chunk out to a
//! set of bounded subscriber channels. A slow subscriber loses frames; the
//! PTY reader never blocks on a consumer.
//!
//! # Process model
//!
//! ```text
//! ShellSession
//! ├── pty slot:    master + writer + killer + pid   (replaced on respawn)
//! ├── reader thread: PTY → ring buffer + subscribers
//! └── waiter thread: child.wait() → respawn | done
//! ```
//!
//! The waiter respawns the shell after an unexpected exit (100 ms delay so a
//! chronically failing shell cannot hot-loop). Subscribers and the ring
//! buffer survive respawn; the PTY file descriptor does not. `stop()`
//! suppresses respawn, closes the PTY, waits up to five seconds, then
//! force-kills the process group.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, mpsc, watch};

use crate::ring::{RingBuffer, SHELL_BUFFER_CAP};

/// PTY reader scratch size.
const PTY_READ_CHUNK: usize = 4096;

/// Per-subscriber channel capacity.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Delay before respawning after an unexpected exit.
const RESPAWN_DELAY: Duration = Duration::from_millis(100);

/// Grace period for the child to exit after `stop()` closes the PTY.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Shell lifecycle notifications for the workspace stream.
#[derive(Debug, Clone)]
pub enum ShellEvent {
    /// The shell process exited.
    Exited {
        /// Exit code; `None` when killed by signal.
        code: Option<i32>,
        /// Whether the session is about to respawn it.
        respawning: bool,
    },
}

/// Spawn parameters for a shell session.
#[derive(Debug, Clone)]
pub struct ShellSpec {
    /// Command argv; empty means "detect the platform shell".
    pub argv: Vec<String>,
    /// Working directory (the session workspace).
    pub workdir: PathBuf,
    /// Initial terminal width.
    pub cols: u16,
    /// Initial terminal height.
    pub rows: u16,
}

impl ShellSpec {
    /// Spec for the platform login shell in `workdir` at 80×24.
    #[must_use]
    pub fn for_workspace(workdir: PathBuf) -> Self {
        Self {
            argv: Vec::new(),
            workdir,
            cols: 80,
            rows: 24,
        }
    }

    fn resolved_argv(&self) -> Vec<String> {
        if !self.argv.is_empty() {
            return self.argv.clone();
        }
        default_shell_argv()
    }
}

/// Detect the platform shell.
///
/// POSIX gets `$SHELL -l` (login shell) with a `/bin/bash` fallback;
/// Windows gets PowerShell, falling back to `%COMSPEC%`/cmd.
fn default_shell_argv() -> Vec<String> {
    #[cfg(windows)]
    {
        if which_exists("powershell.exe") {
            return vec!["powershell.exe".to_string()];
        }
        return vec![std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())];
    }
    #[cfg(not(windows))]
    {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        vec![shell, "-l".to_string()]
    }
}

#[cfg(windows)]
fn which_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|p| p.join(name).exists()))
        .unwrap_or(false)
}

/// Live PTY handles for the current shell process.
struct PtySlot {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl std::fmt::Debug for PtySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySlot").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// One PTY-backed shell with output fan-out and a replay ring.
pub struct ShellSession {
    spec: ShellSpec,
    /// Current PTY handles; `None` between stop and drop.
    pty: Mutex<Option<PtySlot>>,
    /// Replay buffer — dedicated mutex so reads never contend with the
    /// subscriber set.
    ring: Arc<Mutex<RingBuffer>>,
    /// Subscriber channels keyed by subscription id.
    subscribers: Arc<Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>>,
    next_subscriber: AtomicU64,
    running: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    events_tx: broadcast::Sender<ShellEvent>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Debug for ShellSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellSession")
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ShellSession {
    /// Spawn the shell and start the reader and waiter threads.
    pub fn spawn(spec: ShellSpec) -> Result<Arc<Self>> {
        let (done_tx, done_rx) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(16);
        let session = Arc::new(Self {
            spec,
            pty: Mutex::new(None),
            ring: Arc::new(Mutex::new(RingBuffer::new(SHELL_BUFFER_CAP))),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            done_tx,
            done_rx,
            events_tx,
            started_at: chrono::Utc::now(),
        });

        let child = session.launch()?;
        Self::spawn_waiter(Arc::clone(&session), child);
        Ok(session)
    }

    /// Launch (or relaunch) the PTY and reader thread, storing fresh handles.
    ///
    /// Returns the child for the waiter to own.
    fn launch(self: &Arc<Self>) -> Result<Box<dyn portable_pty::Child + Send + Sync>> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: self.spec.rows,
                cols: self.spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("openpty failed")?;

        let argv = self.spec.resolved_argv();
        let mut cmd = CommandBuilder::new(&argv[0]);
        for arg in &argv[1..] {
            cmd.arg(arg);
        }
        cmd.cwd(&self.spec.workdir);
        cmd.env("PWD", self.spec.workdir.as_os_str());
        cmd.env("TERM", "xterm-256color");
        if std::env::var_os("LANG").is_none() {
            cmd.env("LANG", "C.UTF-8");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("failed to spawn shell: {argv:?}"))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();
        let writer = pair.master.take_writer().context("PTY writer unavailable")?;
        let reader = pair
            .master
            .try_clone_reader()
            .context("PTY reader unavailable")?;

        {
            let mut slot = self.pty.lock().expect("pty lock poisoned");
            *slot = Some(PtySlot {
                master: pair.master,
                writer,
                killer,
                pid,
            });
        }
        self.running.store(true, Ordering::SeqCst);
        log::info!(
            "[shell] started {:?} (pid {:?}) in {}",
            argv,
            pid,
            self.spec.workdir.display()
        );

        self.spawn_reader(reader);
        Ok(child)
    }

    /// Reader thread: PTY → ring buffer + subscriber fan-out.
    fn spawn_reader(&self, mut reader: Box<dyn Read + Send>) {
        let ring = Arc::clone(&self.ring);
        let subscribers = Arc::clone(&self.subscribers);
        std::thread::spawn(move || {
            let mut buf = [0u8; PTY_READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break, // PTY closed
                    Ok(n) => {
                        let chunk = &buf[..n];
                        ring.lock().expect("ring lock poisoned").push(chunk);
                        let subs = subscribers.lock().expect("subscriber lock poisoned");
                        for tx in subs.values() {
                            // Non-blocking: a full channel drops this frame
                            // for that subscriber only.
                            let _ = tx.try_send(chunk.to_vec());
                        }
                    }
                }
            }
        });
    }

    /// Waiter thread: reap the child, respawn on unexpected exit.
    fn spawn_waiter(
        session: Arc<Self>,
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
    ) {
        std::thread::spawn(move || loop {
            let status = child.wait();
            let code = status.ok().map(|s| i32::try_from(s.exit_code()).unwrap_or(-1));
            session.running.store(false, Ordering::SeqCst);

            if session.stopping.load(Ordering::SeqCst) {
                let _ = session
                    .events_tx
                    .send(ShellEvent::Exited { code, respawning: false });
                let _ = session.done_tx.send(true);
                return;
            }

            log::warn!("[shell] unexpected exit (code {code:?}), respawning");
            let _ = session
                .events_tx
                .send(ShellEvent::Exited { code, respawning: true });
            std::thread::sleep(RESPAWN_DELAY);

            // Stop may have arrived during the delay.
            if session.stopping.load(Ordering::SeqCst) {
                let _ = session.done_tx.send(true);
                return;
            }

            match session.launch() {
                Ok(new_child) => child = new_child,
                Err(e) => {
                    log::error!("[shell] respawn failed: {e}");
                    let _ = session.done_tx.send(true);
                    return;
                }
            }
        });
    }

    /// Add a subscriber; returns its id and the receiving channel.
    ///
    /// The channel only carries bytes produced after this call; use
    /// [`buffered_output`](Self::buffered_output) for catch-up.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, tx);
        (id, rx)
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .remove(&id);
    }

    /// Subscribe to shell lifecycle events (exit/respawn).
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ShellEvent> {
        self.events_tx.subscribe()
    }

    /// Copy of the replay ring (oldest first).
    #[must_use]
    pub fn buffered_output(&self) -> Vec<u8> {
        self.ring.lock().expect("ring lock poisoned").to_vec()
    }

    /// Write input bytes to the PTY.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            bail!("shell not running");
        }
        let mut slot = self.pty.lock().expect("pty lock poisoned");
        match slot.as_mut() {
            Some(pty) => {
                pty.writer.write_all(bytes).context("PTY write failed")?;
                pty.writer.flush().context("PTY flush failed")?;
                Ok(())
            }
            None => bail!("shell not running"),
        }
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let slot = self.pty.lock().expect("pty lock poisoned");
        match slot.as_ref() {
            Some(pty) => pty
                .master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .context("PTY resize failed"),
            None => bail!("shell not running"),
        }
    }

    /// Whether the shell process is currently alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// PID of the current shell process.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pty
            .lock()
            .expect("pty lock poisoned")
            .as_ref()
            .and_then(|p| p.pid)
    }

    /// When the session was created (not the last respawn).
    #[must_use]
    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    /// Stop the shell: suppress respawn, close the PTY, wait up to five
    /// seconds for a clean exit, then force-kill the process group.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        let taken = {
            let mut slot = self.pty.lock().expect("pty lock poisoned");
            slot.take()
        };
        let Some(pty) = taken else {
            return; // already stopped
        };
        let pid = pty.pid;
        let mut killer = pty.killer;
        // Closing master + writer hangs up the controlling terminal: the
        // shell receives SIGHUP and normally exits on its own.
        drop(pty.master);
        drop(pty.writer);

        let mut done = self.done_rx.clone();
        let clean = tokio::time::timeout(STOP_GRACE, async {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !clean {
            log::warn!("[shell] stop grace expired (pid {pid:?}), force-killing");
            force_kill(pid, killer.as_mut());
        } else {
            log::debug!("[shell] stopped cleanly (pid {pid:?})");
        }
    }
}

/// Kill the shell's process group on POSIX, or the process elsewhere.
fn force_kill(pid: Option<u32>, killer: &mut (dyn ChildKiller + Send + Sync)) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The PTY child is its own session leader; negative pid targets the
        // whole group so grandchildren die too.
        // SAFETY: plain kill(2) call with a known pid.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
        return;
    }
    let _ = killer.kill();
}
