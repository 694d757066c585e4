//! Per-connection state machine (§3, §4.C).
//!
//! A `Connection` owns one client socket, its setup/running/closing
//! lifecycle, the fixed receive/send buffers, and (once a child has been
//! spawned) the three pipe endpoints and the child watcher. Every method
//! here is non-blocking from the main loop's point of view: the blocking
//! work lives in the helper threads spawned by [`crate::pipeio`].

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;

use log::{debug, warn};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token, Waker};

use crate::error::{interrupted, would_block, ConnError};
use crate::fixedbuf::FixedBuf;
use crate::pathsearch;
use crate::pipeio::{ChildWatcher, PipeReader, PipeWriter, READ_CHUNK};
use crate::proto::{self, client_tag, server_tag};
use crate::quoting;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Setup,
    Running,
    Closing,
}

/// The mio token a connection's socket occupies, derived from its stable
/// identifier rather than its (mutable) slot index (see `table.rs`). Pipe
/// and child-exit completions no longer carry their own tokens: they wake
/// the server's single shared [`Waker`], and the per-tick sweep in
/// `server.rs` finds whatever actually completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnTokens {
    pub socket: Token,
}

impl ConnTokens {
    pub fn for_id(id: u64, base_token: usize) -> ConnTokens {
        ConnTokens {
            socket: Token(base_token + id as usize),
        }
    }
}

enum DispatchOutcome {
    Consumed,
    /// An `I` frame arrived while a previous write was still pending;
    /// leave it at the front of the receive buffer (§4.C).
    Stall,
}

pub struct Connection {
    id: u64,
    tokens: ConnTokens,
    stream: TcpStream,
    socket_interest: Option<Interest>,
    state: ConnState,

    recv: FixedBuf,
    send: FixedBuf,

    app_path: Option<Vec<u8>>,
    command_line: Option<Vec<u8>>,
    work_dir: Option<Vec<u8>>,

    child_watcher: Option<ChildWatcher>,
    stdin_writer: Option<PipeWriter>,
    stdout_reader: Option<PipeReader>,
    stderr_reader: Option<PipeReader>,
    stdout_eof: bool,
    stderr_eof: bool,

    /// Shared across every connection and every one of its pipe/child
    /// helper threads; only its identity (one source registered once, in
    /// `Server::bind`) matters, never which endpoint woke it (§4.D: the
    /// per-tick sweep finds the actual work regardless).
    waker: Arc<Waker>,

    /// Set once the connection should be removed from the table. Does not
    /// by itself imply the forced-abort teardown ran (see `fail` vs. the
    /// natural Closing-and-drained path in `flush`).
    ready_to_destroy: bool,
}

impl Connection {
    pub fn accept(
        id: u64,
        stream: TcpStream,
        registry: &Registry,
        base_token: usize,
        waker: Arc<Waker>,
        recv_capacity: usize,
        send_capacity: usize,
    ) -> io::Result<Connection> {
        let tokens = ConnTokens::for_id(id, base_token);
        let mut stream = stream;
        registry.register(&mut stream, tokens.socket, Interest::READABLE)?;

        Ok(Connection {
            id,
            tokens,
            stream,
            socket_interest: Some(Interest::READABLE),
            state: ConnState::Setup,
            recv: FixedBuf::with_capacity(recv_capacity),
            send: FixedBuf::with_capacity(send_capacity),
            app_path: None,
            command_line: None,
            work_dir: None,
            child_watcher: None,
            stdin_writer: None,
            stdout_reader: None,
            stderr_reader: None,
            stdout_eof: false,
            stderr_eof: false,
            waker,
            ready_to_destroy: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tokens(&self) -> ConnTokens {
        self.tokens
    }

    pub fn ready_to_destroy(&self) -> bool {
        self.ready_to_destroy
    }

    /// Handles a readiness event for this connection's socket token.
    pub fn on_socket_event(&mut self, readable: bool, writable: bool) {
        if readable {
            self.pump_socket_read();
        }
        if writable && !self.ready_to_destroy {
            if let Err(e) = self.flush() {
                self.fail(e);
            }
        }
    }

    /// The fairness/backpressure-recovery pass run every tick for every
    /// connection (§4.D): re-checks everything that a prior tick might have
    /// deferred due to backpressure, not just what the deregistered pipe/
    /// socket tokens happen to have woken for.
    pub fn catch_up(&mut self) {
        if self.ready_to_destroy {
            return;
        }
        self.pump_socket_read();
        if self.ready_to_destroy {
            return;
        }
        if let Err(e) = self.drain_output(Stream::Stdout) {
            self.fail(e);
            return;
        }
        if let Err(e) = self.drain_output(Stream::Stderr) {
            self.fail(e);
            return;
        }
        if let Err(e) = self.service_stdin_completion() {
            self.fail(e);
            return;
        }
        if let Err(e) = self.process_inbound() {
            self.fail(e);
            return;
        }
        if let Err(e) = self.try_observe_exit() {
            self.fail(e);
            return;
        }
        if let Err(e) = self.flush() {
            self.fail(e);
        }
    }

    /// Recomputes and applies the socket's registered interest from current
    /// buffer occupancy (§4.D wait-set construction).
    pub fn sync_socket_interest(&mut self, registry: &Registry) {
        if self.ready_to_destroy {
            return;
        }
        let want_read = self.state != ConnState::Closing && self.recv.free() > 0;
        let want_write = !self.send.is_empty();
        let desired = match (want_read, want_write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        if desired == self.socket_interest {
            return;
        }
        let result = match (self.socket_interest, desired) {
            (None, Some(interest)) => registry.register(&mut self.stream, self.tokens.socket, interest),
            (Some(_), None) => registry.deregister(&mut self.stream),
            (Some(_), Some(interest)) => registry.reregister(&mut self.stream, self.tokens.socket, interest),
            (None, None) => Ok(()),
        };
        if let Err(e) = result {
            warn!("conn {}: failed to update socket interest: {e}", self.id);
        } else {
            self.socket_interest = desired;
        }
    }

    fn pump_socket_read(&mut self) {
        if self.ready_to_destroy || self.state == ConnState::Closing {
            return;
        }
        if let Err(e) = self.read_socket() {
            self.fail(e);
            return;
        }
        if let Err(e) = self.process_inbound() {
            self.fail(e);
        }
    }

    fn read_socket(&mut self) -> Result<(), ConnError> {
        loop {
            if self.recv.free() == 0 {
                return Ok(());
            }
            match self.stream.read(self.recv.spare_mut()) {
                Ok(0) => {
                    debug!("conn {}: peer closed socket", self.id);
                    return Err(ConnError::Protocol("peer closed connection"));
                }
                Ok(n) => self.recv.commit(n),
                Err(ref e) if would_block(e) => return Ok(()),
                Err(ref e) if interrupted(e) => continue,
                Err(e) => return Err(ConnError::Io(e)),
            }
        }
    }

    /// Walks the receive buffer, dispatching every complete frame it can
    /// (§4.C). Stops at the first incomplete frame or the first stalled `I`
    /// frame, leaving it at the head of the buffer for next time.
    fn process_inbound(&mut self) -> Result<(), ConnError> {
        loop {
            let header = match proto::peek_frame(self.recv.as_slice()) {
                Some(h) => h,
                None => return Ok(()),
            };
            let frame_len = proto::encoded_len(header.payload_len);
            let payload = self.recv.as_slice()[proto::HEADER_LEN..frame_len].to_vec();

            match self.dispatch_client_frame(header.tag, &payload)? {
                DispatchOutcome::Consumed => self.recv.consume(frame_len),
                DispatchOutcome::Stall => return Ok(()),
            }
        }
    }

    fn dispatch_client_frame(&mut self, tag: u8, payload: &[u8]) -> Result<DispatchOutcome, ConnError> {
        match (tag, self.state) {
            (client_tag::APP_PATH, ConnState::Setup) => {
                self.app_path = Some(payload.to_vec());
                Ok(DispatchOutcome::Consumed)
            }
            (client_tag::COMMAND_LINE, ConnState::Setup) => {
                self.command_line = Some(payload.to_vec());
                Ok(DispatchOutcome::Consumed)
            }
            (client_tag::WORK_DIR, ConnState::Setup) => {
                self.work_dir = Some(payload.to_vec());
                Ok(DispatchOutcome::Consumed)
            }
            (client_tag::EXECUTE, ConnState::Setup) => {
                self.handle_execute()?;
                Ok(DispatchOutcome::Consumed)
            }
            (client_tag::STDIN, ConnState::Running) => self.handle_stdin_frame(payload),
            _ => Err(ConnError::Protocol("command tag not valid in current state")),
        }
    }

    fn handle_stdin_frame(&mut self, payload: &[u8]) -> Result<DispatchOutcome, ConnError> {
        if payload.is_empty() {
            // Empty payload: close stdin and null the handle (§4.C). Orphan
            // rather than drop: if a write were ever left pending here the
            // helper could be mid-syscall, but state here is always Idle
            // because a pending writer would have caused a Stall below
            // before this frame was ever consumed.
            self.stdin_writer = None;
            return Ok(DispatchOutcome::Consumed);
        }
        let writer = match self.stdin_writer.as_mut() {
            Some(w) => w,
            None => return Ok(DispatchOutcome::Consumed), // stdin already closed; drop silently
        };
        if writer.is_pending() {
            return Ok(DispatchOutcome::Stall);
        }
        writer.write_initiate(payload.to_vec()).map_err(ConnError::Io)?;
        Ok(DispatchOutcome::Consumed)
    }

    fn handle_execute(&mut self) -> Result<(), ConnError> {
        let app_path_bytes = self
            .app_path
            .clone()
            .ok_or(ConnError::Protocol("E received without a prior A"))?;
        let app_path = String::from_utf8_lossy(&app_path_bytes).into_owned();
        let resolved = pathsearch::resolve(&app_path);

        let mut cmd = Command::new(&resolved);
        if let Some(cl) = &self.command_line {
            let line = String::from_utf8_lossy(cl).into_owned();
            apply_raw_command_line(&mut cmd, &line);
        }
        if let Some(wd) = &self.work_dir {
            if !wd.is_empty() {
                cmd.current_dir(String::from_utf8_lossy(wd).into_owned());
            }
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(ConnError::Spawn)?;
        let stdin = child.stdin.take().expect("spawned with Stdio::piped()");
        let stdout = child.stdout.take().expect("spawned with Stdio::piped()");
        let stderr = child.stderr.take().expect("spawned with Stdio::piped()");

        self.stdin_writer = Some(PipeWriter::spawn(stdin, Arc::clone(&self.waker)));

        let mut stdout_reader = PipeReader::spawn(stdout, Arc::clone(&self.waker));
        stdout_reader.read_initiate().map_err(ConnError::Io)?;
        self.stdout_reader = Some(stdout_reader);

        let mut stderr_reader = PipeReader::spawn(stderr, Arc::clone(&self.waker));
        stderr_reader.read_initiate().map_err(ConnError::Io)?;
        self.stderr_reader = Some(stderr_reader);

        self.child_watcher = Some(ChildWatcher::spawn(child, Arc::clone(&self.waker)));
        self.state = ConnState::Running;
        Ok(())
    }

    fn drain_output(&mut self, stream: Stream) -> Result<(), ConnError> {
        let (eof, has_reader, tag) = match stream {
            Stream::Stdout => (self.stdout_eof, self.stdout_reader.is_some(), server_tag::STDOUT),
            Stream::Stderr => (self.stderr_eof, self.stderr_reader.is_some(), server_tag::STDERR),
        };
        if eof || !has_reader {
            return Ok(());
        }
        // Backpressure gate (§4.C): only act if there's room for the
        // largest frame a single background read can produce.
        if self.send.free() < proto::encoded_len(READ_CHUNK) {
            return Ok(());
        }

        let result = match stream {
            Stream::Stdout => self.stdout_reader.as_mut().unwrap().read_result(),
            Stream::Stderr => self.stderr_reader.as_mut().unwrap().read_result(),
        };

        match result {
            Ok(None) => Ok(()),
            Ok(Some(data)) => {
                if data.is_empty() {
                    self.set_stream_eof(stream);
                    self.queue_frame(tag, &[])
                } else {
                    self.queue_frame(tag, &data)?;
                    self.reinitiate_read(stream).map_err(ConnError::Io)
                }
            }
            Err(e) if ConnError::is_broken_pipe(&e) => {
                self.set_stream_eof(stream);
                self.queue_frame(tag, &[])
            }
            Err(e) => Err(ConnError::Io(e)),
        }
    }

    fn set_stream_eof(&mut self, stream: Stream) {
        match stream {
            Stream::Stdout => self.stdout_eof = true,
            Stream::Stderr => self.stderr_eof = true,
        }
    }

    fn reinitiate_read(&mut self, stream: Stream) -> io::Result<()> {
        match stream {
            Stream::Stdout => self.stdout_reader.as_mut().unwrap().read_initiate(),
            Stream::Stderr => self.stderr_reader.as_mut().unwrap().read_initiate(),
        }
    }

    fn service_stdin_completion(&mut self) -> Result<(), ConnError> {
        let Some(writer) = self.stdin_writer.as_mut() else {
            return Ok(());
        };
        match writer.write_result() {
            Ok(None) | Ok(Some(_)) => Ok(()),
            Err(e) if ConnError::is_broken_pipe(&e) => {
                // The child stopped reading stdin; that's normal, not fatal.
                self.stdin_writer = None;
                Ok(())
            }
            Err(e) => Err(ConnError::Io(e)),
        }
    }

    fn try_observe_exit(&mut self) -> Result<(), ConnError> {
        if self.state != ConnState::Running {
            return Ok(());
        }
        if !(self.stdout_eof && self.stderr_eof) {
            return Ok(());
        }
        if self.send.free() < proto::encoded_len(4) {
            return Ok(());
        }
        let Some(watcher) = self.child_watcher.as_mut() else {
            return Ok(());
        };
        match watcher.try_take_exit() {
            None => Ok(()),
            Some(Ok(status)) => {
                let code = exit_code_of(&status);
                self.queue_frame(server_tag::EXIT, &proto::encode_exit_code(code))?;
                self.child_watcher = None;
                self.state = ConnState::Closing;
                Ok(())
            }
            Some(Err(e)) => Err(ConnError::Io(e)),
        }
    }

    fn queue_frame(&mut self, tag: u8, payload: &[u8]) -> Result<(), ConnError> {
        if proto::encoded_len(payload.len()) > self.send.free() {
            return Err(ConnError::Protocol("send buffer overrun is unrecoverable"));
        }
        let mut framed = Vec::with_capacity(proto::encoded_len(payload.len()));
        proto::encode_frame(&mut framed, tag, payload);
        let fit = self.send.try_append(&framed);
        debug_assert!(fit, "capacity already checked above");
        self.flush()
    }

    fn flush(&mut self) -> Result<(), ConnError> {
        loop {
            if self.send.is_empty() {
                break;
            }
            match self.stream.write(self.send.as_slice()) {
                Ok(0) => return Err(ConnError::Io(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(n) => self.send.consume(n),
                Err(ref e) if would_block(e) => break,
                Err(ref e) if interrupted(e) => continue,
                Err(e) => return Err(ConnError::Io(e)),
            }
        }
        if self.state == ConnState::Closing && self.send.is_empty() {
            self.ready_to_destroy = true;
        }
        Ok(())
    }

    /// Forced-abort teardown (§4.C): close the socket, forcibly terminate a
    /// still-running child, and orphan the pipe endpoints rather than drop
    /// them (a helper thread may be blocked in a blocking read/write on a
    /// handle the target OS can deadlock closing out from under it). This is
    /// the deliberate, documented leak the spec calls for, not an oversight.
    fn fail(&mut self, err: ConnError) {
        warn!("conn {}: tearing down: {err}", self.id);
        if let Some(watcher) = self.child_watcher.take() {
            watcher.kill();
        }
        if let Some(w) = self.stdin_writer.take() {
            std::mem::forget(w);
        }
        if let Some(r) = self.stdout_reader.take() {
            std::mem::forget(r);
        }
        if let Some(r) = self.stderr_reader.take() {
            std::mem::forget(r);
        }
        self.ready_to_destroy = true;
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[cfg(unix)]
fn exit_code_of(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(windows)]
fn exit_code_of(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Passes `line` to the child's command line as close to verbatim as the
/// host OS allows (§4.C: "The command line is passed through verbatim;
/// quoting is entirely the client's responsibility"). `line` is the whole
/// `C` payload, argv0 token included, but `cmd` already has its program set
/// (the resolved path from the `A` frame), so argv0 is dropped here before
/// the rest is handed through: `Command` always reconstructs its own
/// leading program-name token, and appending `line` unchanged would
/// duplicate it (the child would see its own program name as argv[1]).
/// On Windows this uses `raw_arg` for the remainder so `Command` doesn't
/// re-quote args the client already quoted.
#[cfg(windows)]
fn apply_raw_command_line(cmd: &mut Command, line: &str) {
    use std::os::windows::process::CommandExt;
    let rest = quoting::skip_first_token(line);
    if !rest.is_empty() {
        cmd.raw_arg(rest);
    }
}

#[cfg(not(windows))]
fn apply_raw_command_line(cmd: &mut Command, line: &str) {
    let rest = quoting::skip_first_token(line);
    for part in rest.split_whitespace() {
        cmd.arg(part);
    }
}
