//! Command-line configuration for both binaries (§4.D, §6).
//!
//! Hand-rolled against `std::env::args()`, the same amount of parsing
//! machinery the pipeline's other examples reach for a CLI-parsing crate
//! over only when the surface grows past a handful of flags; this one
//! doesn't.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

pub const DEFAULT_PORT: u16 = 5424;
pub const DEFAULT_MAX_SESSIONS: usize = 16;
const DEFAULT_RECV_BUFFER: usize = 72 * 1024;
const DEFAULT_SEND_BUFFER: usize = 128 * 1024;
const DEFAULT_LISTEN_BACKLOG: u32 = 8;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub max_sessions: usize,
    pub recv_buffer_capacity: usize,
    pub send_buffer_capacity: usize,
    pub backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            recv_buffer_capacity: DEFAULT_RECV_BUFFER,
            send_buffer_capacity: DEFAULT_SEND_BUFFER,
            backlog: DEFAULT_LISTEN_BACKLOG,
        }
    }
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Parses `ice9d [--listen <addr>] [--port <n>] [--max-sessions <n>]`.
pub fn parse_server_args<I: Iterator<Item = String>>(args: I) -> Result<ServerConfig, ConfigError> {
    let mut config = ServerConfig::default();
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" => {
                let value = next_value(&mut args, "--listen")?;
                config.bind_addr = value
                    .parse()
                    .map_err(|_| ConfigError(format!("invalid --listen address: {value}")))?;
            }
            "--port" => {
                let value = next_value(&mut args, "--port")?;
                config.port = value
                    .parse()
                    .map_err(|_| ConfigError(format!("invalid --port value: {value}")))?;
            }
            "--max-sessions" => {
                let value = next_value(&mut args, "--max-sessions")?;
                config.max_sessions = value
                    .parse()
                    .map_err(|_| ConfigError(format!("invalid --max-sessions value: {value}")))?;
                if config.max_sessions == 0 {
                    return Err(ConfigError("--max-sessions must be at least 1".into()));
                }
            }
            other => return Err(ConfigError(format!("unrecognized argument: {other}"))),
        }
    }
    Ok(config)
}

fn next_value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String, ConfigError> {
    args.next().ok_or_else(|| ConfigError(format!("{flag} requires a value")))
}

/// The parsed form of `ice9r`'s command line (§6).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub app_path: String,
    pub raw_command_line: Option<String>,
    pub args: Vec<String>,
}

pub fn parse_client_args<I: Iterator<Item = String>>(args: I) -> Result<ClientConfig, ConfigError> {
    let mut args = args.peekable();
    let host = args
        .next()
        .ok_or_else(|| ConfigError("usage: ice9r <ip> [-p <port>] <executable> [<args>...]".into()))?;

    let mut port = DEFAULT_PORT;
    if args.peek().map(|a| a.as_str()) == Some("-p") {
        args.next();
        let value = next_value(&mut args, "-p")?;
        port = value.parse().map_err(|_| ConfigError(format!("invalid port: {value}")))?;
    }

    let app_path = args.next().ok_or_else(|| ConfigError("missing executable path".into()))?;

    let mut raw_command_line = None;
    let mut positional = Vec::new();
    let mut end_of_options = false;
    while let Some(arg) = args.next() {
        if !end_of_options && arg == "--" {
            end_of_options = true;
            continue;
        }
        if !end_of_options && arg == "-e" {
            if !positional.is_empty() {
                return Err(ConfigError("-e and positional arguments are mutually exclusive".into()));
            }
            let rest: Vec<String> = args.collect();
            raw_command_line = Some(rest.join(" "));
            break;
        }
        positional.push(arg);
    }
    if raw_command_line.is_some() && !positional.is_empty() {
        return Err(ConfigError("-e and positional arguments are mutually exclusive".into()));
    }

    Ok(ClientConfig {
        host,
        port,
        app_path,
        raw_command_line,
        args: positional,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults_match_the_wire_protocol() {
        let config = parse_server_args(std::iter::empty()).unwrap();
        assert_eq!(config.port, 5424);
        assert_eq!(config.max_sessions, 16);
    }

    #[test]
    fn server_max_sessions_is_overridable() {
        let args = ["--max-sessions", "4"].into_iter().map(String::from);
        let config = parse_server_args(args).unwrap();
        assert_eq!(config.max_sessions, 4);
    }

    #[test]
    fn server_rejects_zero_max_sessions() {
        let args = ["--max-sessions", "0"].into_iter().map(String::from);
        assert!(parse_server_args(args).is_err());
    }

    #[test]
    fn client_parses_host_port_and_positional_args() {
        let args = ["10.0.0.5", "-p", "9000", "echo.exe", "hi", "there"]
            .into_iter()
            .map(String::from);
        let config = parse_client_args(args).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 9000);
        assert_eq!(config.app_path, "echo.exe");
        assert_eq!(config.args, vec!["hi", "there"]);
        assert!(config.raw_command_line.is_none());
    }

    #[test]
    fn client_parses_raw_command_line_after_e_flag() {
        let args = ["10.0.0.5", "cmd.exe", "-e", "echo", "hi", "there"]
            .into_iter()
            .map(String::from);
        let config = parse_client_args(args).unwrap();
        assert_eq!(config.raw_command_line.as_deref(), Some("echo hi there"));
        assert!(config.args.is_empty());
    }

    #[test]
    fn client_rejects_e_combined_with_positional_args() {
        let args = ["10.0.0.5", "cmd.exe", "extra", "-e", "echo"]
            .into_iter()
            .map(String::from);
        assert!(parse_client_args(args).is_err());
    }

    #[test]
    fn client_double_dash_ends_option_parsing() {
        let args = ["10.0.0.5", "cmd.exe", "--", "-p", "not-a-port"]
            .into_iter()
            .map(String::from);
        let config = parse_client_args(args).unwrap();
        assert_eq!(config.args, vec!["-p", "not-a-port"]);
    }
}
