//! Low-level PTY spawn: open a pseudo-terminal, exec `argv` inside it, and bridge
//! stdin/stdout/resize/exit over channels. This is the leaf C2 depends on; `session::manager`
//! layers session lifecycle, the asciicast log, and the control socket on top.

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{self, Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Arguments to spawn a process under a PTY (spec §4.1 `createSession`).
pub struct PtySpawnOptions {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    pub term: String,
}

/// Bridge to a spawned PTY child: writer for stdin, child handle for kill/signal.
pub struct PtyBridge {
    pub writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
}

/// Sender to request a PTY resize (cols, rows); a dedicated thread applies `master.resize()`.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Sent once, when the child process exits.
#[derive(Debug, Clone, Copy)]
pub struct PtyExit {
    pub exit_code: i32,
}

/// Spawn `opts.argv[0]` with the remaining argv as arguments, inside a new PTY sized
/// `cols x rows`, in `cwd` (falling back to the current process cwd), with `opts.env`
/// merged over the inherited environment plus `TERM=opts.term`.
///
/// Returns the bridge, a receiver of raw output chunks, a resize sender, and a receiver
/// that yields exactly one `PtyExit` when the child exits.
pub fn spawn_pty(
    opts: PtySpawnOptions,
) -> Result<(
    PtyBridge,
    mpsc::Receiver<Vec<u8>>,
    ResizeSender,
    mpsc::Receiver<PtyExit>,
)> {
    if opts.argv.is_empty() {
        return Err(Error::InvalidArgument("argv must not be empty".into()));
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: opts.rows,
            cols: opts.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&opts.argv[0]);
    for arg in &opts.argv[1..] {
        cmd.arg(arg);
    }
    if let Some(cwd) = &opts.cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", &opts.term);
    for (k, v) in &opts.env {
        cmd.env(k, v);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;
    // Slave fd is only needed by the child; drop our copy so the master sees EOF on exit.
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| Error::SpawnFailed(e.to_string()))?;
    let master = pair.master;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (exit_tx, exit_rx) = mpsc::channel::<PtyExit>(1);

    let child = Arc::new(Mutex::new(child));

    // Blocking thread: read PTY stdout and forward chunks to the async side.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Dedicated thread: apply resize requests (portable_pty's resize is synchronous).
    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let size = PtySize {
                cols,
                rows,
                pixel_width: 0,
                pixel_height: 0,
            };
            let _ = master.resize(size);
        }
    });

    // Poll try_wait() until the child exits, then send exactly one PtyExit.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || loop {
        let exit_status = {
            let mut guard = match child_poll.lock() {
                Ok(g) => g,
                Err(_) => break,
            };
            match guard.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(status.exit_code() as i32),
                Err(_) => Some(-1),
            }
        };
        if let Some(code) = exit_status {
            let _ = exit_tx.blocking_send(PtyExit { exit_code: code });
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
    });

    Ok((PtyBridge { writer: Arc::new(Mutex::new(writer)), child }, rx, resize_tx, exit_rx))
}

/// The closed set of signals a control-socket/kill client may name (spec §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
    Hup,
    Int,
}

impl Signal {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "SIGTERM" => Ok(Signal::Term),
            "SIGKILL" => Ok(Signal::Kill),
            "SIGHUP" => Ok(Signal::Hup),
            "SIGINT" => Ok(Signal::Int),
            other => Err(Error::InvalidArgument(format!("unsupported signal: {other}"))),
        }
    }

    #[cfg(unix)]
    fn as_libc(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Hup => libc::SIGHUP,
            Signal::Int => libc::SIGINT,
        }
    }
}

impl PtyBridge {
    /// The child's OS process id, if it is still known to `portable_pty` (it is cleared
    /// once the child has been reaped on some platforms).
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|guard| guard.process_id())
    }

    /// Send `signal` to the child. On non-Unix targets this always sends the hard kill
    /// `portable_pty` provides, since arbitrary signal delivery is a POSIX concept.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        #[cfg(unix)]
        {
            let guard = self.child.lock().map_err(|_| Error::Io(poison_err()))?;
            if let Some(pid) = guard.process_id() {
                // Safety: `pid` is a still-referenced child process id owned by `guard`.
                let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_libc()) };
                if rc != 0 {
                    return Err(Error::Io(std::io::Error::last_os_error()));
                }
                return Ok(());
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = signal;
            self.kill()
        }
    }

    /// Hard-kill the child. Idempotent: killing an already-exited child is a no-op success.
    pub fn kill(&self) -> Result<()> {
        let mut guard = self.child.lock().map_err(|_| Error::Io(poison_err()))?;
        match guard.kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn poison_err() -> std::io::Error {
    std::io::Error::other("pty child mutex poisoned")
}
