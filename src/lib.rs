//! ice9: a remote command-execution daemon and client for legacy Windows
//! hosts (§1–§2). The daemon's event loop and per-connection state machine
//! are the interesting part; `bin/ice9d.rs` and `bin/ice9r.rs` are thin
//! shells around the library modules below.

pub mod config;
pub mod connection;
pub mod error;
pub mod fixedbuf;
pub mod pathsearch;
pub mod pipeio;
pub mod proto;
pub mod quoting;
pub mod server;
pub mod table;
