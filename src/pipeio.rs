//! The pipe-I/O abstraction (§4.A) and its child-exit counterpart.
//!
//! The target OS's anonymous pipes support neither overlapped I/O nor
//! select-style readiness. Each endpoint owns a helper thread that performs
//! a blocking read or write and reports back through a channel, waking a
//! shared [`mio::Waker`] so the main loop's single `Poll::poll` call can
//! treat the endpoint like any other readiness source. This is the same
//! division of labor the teacher's own Windows named-pipe backend uses
//! between its IOCP completion callbacks and the `Io` state guarded by a
//! `Mutex` (`sys/windows/named_pipe.rs`); the teacher can lean on IOCP to
//! get there, we use a thread because the target OS has no IOCP.
//!
//! Endpoints never touch connection state directly. They flip an internal
//! buffer's ownership between "helper thread has it" and "main thread has
//! it" through the channel send/receive, which is what lets the main loop
//! stay lock-free (§5).

use std::io::{self, Read, Write};
use std::process::{Child, ExitStatus};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Waker;

/// Chunk size for a single background read (§4.A).
pub const READ_CHUNK: usize = 32 * 1024;

/// How often the child-exit watcher polls while the child is still running.
/// True blocking `wait()` can't be shared safely with a concurrent forced
/// `kill()` from the main thread under Rust's `std::process::Child` API (both
/// need `&mut self`), so the watcher polls instead of blocking; see
/// `DESIGN.md` for the tradeoff.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointState {
    Idle,
    Pending,
}

/// A background read endpoint over a child's stdout or stderr.
pub struct PipeReader {
    state: EndpointState,
    start_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    _handle: JoinHandle<()>,
}

impl PipeReader {
    pub fn spawn<R>(mut source: R, waker: Arc<Waker>) -> PipeReader
    where
        R: Read + Send + 'static,
    {
        let (start_tx, start_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK];
            while start_rx.recv().is_ok() {
                let outcome = match source.read(&mut buf) {
                    Ok(0) => Ok(Vec::new()),
                    Ok(n) => Ok(buf[..n].to_vec()),
                    Err(e) => Err(e),
                };
                let stop = !matches!(outcome, Ok(ref data) if !data.is_empty());
                if done_tx.send(outcome).is_err() {
                    return;
                }
                let _ = waker.wake();
                if stop {
                    return;
                }
            }
        });
        PipeReader {
            state: EndpointState::Idle,
            start_tx,
            done_rx,
            _handle: handle,
        }
    }

    /// Requires `Idle`; schedules the next read.
    pub fn read_initiate(&mut self) -> io::Result<()> {
        if self.state != EndpointState::Idle {
            return Err(io::Error::new(io::ErrorKind::Other, "read already pending"));
        }
        self.state = EndpointState::Pending;
        self.start_tx
            .send(())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// `Ok(None)` means the read is still pending. `Ok(Some(data))` with an
    /// empty `data` signals stream EOF (the helper's `Ok(0)`/broken-pipe
    /// cases are unified here, since under `Read::read` a zero-length result
    /// already is the one true EOF signal; see `DESIGN.md`).
    pub fn read_result(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.state != EndpointState::Pending {
            return Ok(None);
        }
        match self.done_rx.try_recv() {
            Ok(Ok(data)) => {
                self.state = EndpointState::Idle;
                Ok(Some(data))
            }
            Ok(Err(e)) => {
                self.state = EndpointState::Idle;
                Err(e)
            }
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => {
                self.state = EndpointState::Idle;
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == EndpointState::Pending
    }
}

/// A background write endpoint over a child's stdin.
pub struct PipeWriter {
    state: EndpointState,
    start_tx: mpsc::Sender<Vec<u8>>,
    done_rx: mpsc::Receiver<io::Result<usize>>,
    _handle: JoinHandle<()>,
}

impl PipeWriter {
    pub fn spawn<W>(mut sink: W, waker: Arc<Waker>) -> PipeWriter
    where
        W: Write + Send + 'static,
    {
        let (start_tx, start_rx) = mpsc::channel::<Vec<u8>>();
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            while let Ok(data) = start_rx.recv() {
                let outcome = sink.write_all(&data).map(|_| data.len());
                if done_tx.send(outcome).is_err() {
                    return;
                }
                let _ = waker.wake();
            }
        });
        PipeWriter {
            state: EndpointState::Idle,
            start_tx,
            done_rx,
            _handle: handle,
        }
    }

    /// Requires not-`Pending` (§3: "at most one pending write on the stdin
    /// pipe at a time"). Copies `data` to the helper before returning.
    pub fn write_initiate(&mut self, data: Vec<u8>) -> io::Result<()> {
        if self.state == EndpointState::Pending {
            return Err(io::Error::new(io::ErrorKind::Other, "write already pending"));
        }
        self.state = EndpointState::Pending;
        self.start_tx
            .send(data)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    pub fn write_result(&mut self) -> io::Result<Option<usize>> {
        if self.state != EndpointState::Pending {
            return Ok(None);
        }
        match self.done_rx.try_recv() {
            Ok(Ok(n)) => {
                self.state = EndpointState::Idle;
                Ok(Some(n))
            }
            Ok(Err(e)) => {
                self.state = EndpointState::Idle;
                Err(e)
            }
            Err(mpsc::TryRecvError::Empty) => Ok(None),
            Err(mpsc::TryRecvError::Disconnected) => {
                self.state = EndpointState::Idle;
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == EndpointState::Pending
    }
}

/// Watches a child process for exit in the background and allows the main
/// thread to force-kill it, without the two racing over `&mut Child`.
pub struct ChildWatcher {
    child: Arc<Mutex<Option<Child>>>,
    exit_rx: mpsc::Receiver<io::Result<ExitStatus>>,
    _handle: JoinHandle<()>,
}

impl ChildWatcher {
    pub fn spawn(child: Child, waker: Arc<Waker>) -> ChildWatcher {
        let shared = Arc::new(Mutex::new(Some(child)));
        let (tx, rx) = mpsc::channel();
        let watched = Arc::clone(&shared);
        let handle = thread::spawn(move || loop {
            thread::sleep(CHILD_POLL_INTERVAL);
            let mut guard = match watched.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            let status = match guard.as_mut() {
                Some(c) => c.try_wait(),
                None => return,
            };
            match status {
                Ok(Some(exit_status)) => {
                    drop(guard);
                    let _ = tx.send(Ok(exit_status));
                    let _ = waker.wake();
                    return;
                }
                Ok(None) => continue,
                Err(e) => {
                    drop(guard);
                    let _ = tx.send(Err(e));
                    let _ = waker.wake();
                    return;
                }
            }
        });
        ChildWatcher {
            child: shared,
            exit_rx: rx,
            _handle: handle,
        }
    }

    /// Non-blocking: `None` if the child hasn't exited yet.
    pub fn try_take_exit(&mut self) -> Option<io::Result<ExitStatus>> {
        self.exit_rx.try_recv().ok()
    }

    /// Forcibly terminates the child if it's still alive and reaps it.
    /// Safe to call even after the watcher has already reported an exit.
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.kill();
                let _ = child.wait();
            }
            *guard = None;
        }
    }
}
