//! Minimal TCP echo server used as a supervised service in tests

use std::io::Write;
use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};

/// Echo every byte received on a loopback port
#[derive(Parser, Debug)]
#[command(name = "echo-server")]
struct Args {
    /// Port to listen on
    #[arg(long)]
    port: u16,

    /// Wait this long before binding
    #[arg(long, default_value_t = 0)]
    bind_delay_ms: u64,

    /// Exit immediately with this code instead of serving
    #[arg(long)]
    exit_code: Option<i32>,

    /// Written to stdout without a trailing newline on SIGTERM
    #[arg(long)]
    tail: Option<String>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    if let Some(code) = args.exit_code {
        eprintln!("exiting early with {}", code);
        std::process::exit(code);
    }

    tokio::time::sleep(Duration::from_millis(args.bind_delay_ms)).await;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, args.port)).await?;
    println!("listening on {}", listener.local_addr()?);

    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut socket, peer) = accepted?;
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    println!("connection from {} closed", peer);
                });
            }
            _ = terminate.recv() => {
                println!("shutting down");
                if let Some(tail) = args.tail.as_deref() {
                    let mut stdout = std::io::stdout();
                    stdout.write_all(tail.as_bytes())?;
                    stdout.flush()?;
                }
                return Ok(());
            }
        }
    }
}
