//! Interactive client for the mux-echo server.
//!
//! Reads lines from stdin, sends each one as a frame and prints the payload
//! of the response.

use clap::Parser;
use mux_echo::config::DEFAULT_PORT;
use mux_echo::runtime::protocol::{read_frame, write_frame, MAX_PAYLOAD};
use std::io::{self, BufRead, Write};
use std::net::TcpStream;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mux-echo-client")]
#[command(version)]
#[command(about = "Send stdin lines to a mux-echo server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    addr: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let mut stream = TcpStream::connect(&args.addr)?;
    debug!(addr = %args.addr, "Connected");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut lines = stdin.lock().lines();

    loop {
        write!(stdout, "Enter a message: ")?;
        stdout.flush()?;

        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;

        if line.len() > MAX_PAYLOAD {
            warn!(
                len = line.len(),
                max = MAX_PAYLOAD,
                "Message too long, not sent"
            );
            continue;
        }

        write_frame(&mut stream, line.as_bytes())?;
        let reply = read_frame(&mut stream)?;
        writeln!(stdout, "Server says: {}", String::from_utf8_lossy(&reply))?;
    }

    Ok(())
}
