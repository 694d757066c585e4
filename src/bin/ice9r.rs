//! The `ice9r` client (§6).
//!
//! Deliberately simple next to the daemon: one blocking socket, one
//! background thread forwarding local stdin, and a main thread that decodes
//! frames until the `X` frame arrives. There's no backpressure interlock to
//! build here: a human at a terminal, or a pipe already bounded by its own
//! OS buffer, is a gentler load than the daemon's four-stream fan-in.

use std::env;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::process;
use std::thread;

use ice9::config::{self, ClientConfig};
use ice9::fixedbuf::FixedBuf;
use ice9::proto::{self, client_tag, server_tag};
use ice9::quoting;

/// Exit code used when the socket closes without ever sending an `X` frame
/// (daemon crash, network failure mid-session).
const EXIT_CODE_NO_EXIT_FRAME: i32 = 255;
const STDIN_CHUNK: usize = 1024;

fn main() {
    env_logger::init();

    let config = match config::parse_client_args(env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ice9r: {e}");
            process::exit(2);
        }
    };

    match run(config) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("ice9r: {e}");
            process::exit(1);
        }
    }
}

fn run(config: ClientConfig) -> io::Result<i32> {
    let mut stream = TcpStream::connect((config.host.as_str(), config.port))?;

    let command_line = match &config.raw_command_line {
        Some(raw) => raw.clone(),
        None => {
            let mut full = Vec::with_capacity(config.args.len() + 1);
            full.push(config.app_path.clone());
            full.extend(config.args.iter().cloned());
            quoting::build_command_line(&full)
        }
    };

    send_frame(&mut stream, client_tag::APP_PATH, config.app_path.as_bytes())?;
    send_frame(&mut stream, client_tag::COMMAND_LINE, command_line.as_bytes())?;
    send_frame(&mut stream, client_tag::EXECUTE, &[])?;

    let stdin_stream = stream.try_clone()?;
    thread::spawn(move || forward_stdin(stdin_stream));

    read_until_exit(stream)
}

fn send_frame(stream: &mut TcpStream, tag: u8, payload: &[u8]) -> io::Result<()> {
    let mut out = Vec::with_capacity(proto::encoded_len(payload.len()));
    proto::encode_frame(&mut out, tag, payload);
    stream.write_all(&out)
}

fn forward_stdin(mut stream: TcpStream) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; STDIN_CHUNK];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => {
                let _ = send_frame(&mut stream, client_tag::STDIN, &[]);
                return;
            }
            Ok(n) => {
                if send_frame(&mut stream, client_tag::STDIN, &buf[..n]).is_err() {
                    return;
                }
            }
            Err(_) => return,
        }
    }
}

fn read_until_exit(mut stream: TcpStream) -> io::Result<i32> {
    let mut recv = FixedBuf::with_capacity(proto::encoded_len(proto::MAX_PAYLOAD));
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    loop {
        while let Some(header) = proto::peek_frame(recv.as_slice()) {
            let frame_len = proto::encoded_len(header.payload_len);
            let payload = recv.as_slice()[proto::HEADER_LEN..frame_len].to_vec();
            match header.tag {
                server_tag::STDOUT => stdout.write_all(&payload)?,
                server_tag::STDERR => stderr.write_all(&payload)?,
                server_tag::EXIT => return Ok(proto::decode_exit_code(&payload).unwrap_or(EXIT_CODE_NO_EXIT_FRAME)),
                _ => {}
            }
            recv.consume(frame_len);
        }
        if recv.free() == 0 {
            // No single frame can exceed the buffer's capacity; reaching
            // this means a malformed frame claims a length that never ends.
            return Ok(EXIT_CODE_NO_EXIT_FRAME);
        }
        match stream.read(recv.spare_mut()) {
            Ok(0) => return Ok(EXIT_CODE_NO_EXIT_FRAME),
            Ok(n) => recv.commit(n),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
