//! The `ice9d` daemon entry point.

use std::env;
use std::process;

use ice9::config;
use ice9::server::Server;

fn main() {
    env_logger::init();

    let config = match config::parse_server_args(env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ice9d: {e}");
            process::exit(2);
        }
    };

    let mut server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("ice9d: failed to bind {}:{}: {e}", config.bind_addr, config.port);
            process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        eprintln!("ice9d: event loop failed: {e}");
        process::exit(1);
    }
}
