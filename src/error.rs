//! Design-level error taxonomy from the protocol specification (§7).
//!
//! Every per-connection failure is contained to that connection: nothing in
//! this module is ever propagated past [`crate::connection::Connection`]'s
//! own teardown path. The server loop itself only deals in `io::Result` for
//! its own fallible setup (binding the listener).

use std::fmt;
use std::io;

/// Why a connection was torn down.
///
/// Protocol violations, I/O failures, and spawn failures are distinguished
/// so the caller can log at the right level and, in the spawn case, decide
/// not to queue an `X` frame. Capacity rejection isn't a variant here: the
/// accept loop refuses a connection before a slot (and therefore a
/// `Connection`) ever exists for it.
#[derive(Debug)]
pub enum ConnError {
    /// Unknown command tag, frame overflow of the send buffer, or malformed
    /// framing.
    Protocol(&'static str),
    /// A non-`WouldBlock` socket error, or a pipe error other than broken-pipe.
    Io(io::Error),
    /// The child process failed to spawn.
    Spawn(io::Error),
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            ConnError::Io(e) => write!(f, "I/O error: {e}"),
            ConnError::Spawn(e) => write!(f, "spawn error: {e}"),
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Protocol(_) => None,
            ConnError::Io(e) | ConnError::Spawn(e) => Some(e),
        }
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        ConnError::Io(e)
    }
}

impl ConnError {
    /// True for the "stream EOF" case (§7): broken-pipe on a child output
    /// pipe is normal and never reaches this type, but some callers still
    /// want to know whether a raw `io::Error` would have classified as one.
    pub fn is_broken_pipe(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::BrokenPipe
    }
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn interrupted(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::Interrupted
}
