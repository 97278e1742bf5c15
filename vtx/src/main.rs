use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use vtx::{DriverConfig, Frame, Pattern, Vtx, VtxError, udp};

#[derive(Parser)]
#[command(name = "vtx", about = "VTX demo tools over the UDP driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Locate a service on the LAN by broadcast
    Locate {
        #[arg(long, default_value_t = 32000)]
        port: u16,
    },
    /// Run a ROUTER echo server
    EchoServer {
        #[arg(long, default_value = "udp://*:32000")]
        endpoint: String,
    },
    /// Run a DEALER client against the echo server
    EchoClient {
        #[arg(long, default_value = "udp://127.0.0.1:32000")]
        endpoint: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut vtx = Vtx::new();
    vtx.register("udp", udp::driver(DriverConfig::default()))?;

    match cli.command {
        Command::Locate { port } => locate(&vtx, port),
        Command::EchoServer { endpoint } => echo_server(&vtx, &endpoint),
        Command::EchoClient { endpoint } => echo_client(&vtx, &endpoint),
    }
}

/// Broadcast-connect and ping until something answers, then report where
/// the answer came from.
fn locate(vtx: &Vtx, port: u16) -> Result<()> {
    let mut client = vtx.socket(Pattern::Dealer)?;
    vtx.connect(&mut client, &format!("udp://*:{port}"))?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        client.send_bytes(b"ICANHAZ?".to_vec())?;
        match client.recv_timeout(Duration::from_millis(500)) {
            Ok(_) => {
                let server = vtx.getmeta(&client, "sender")?;
                info!(server = %server, "service located");
                return Ok(());
            }
            Err(VtxError::Timeout) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    info!("no service found");
    Ok(())
}

fn echo_server(vtx: &Vtx, endpoint: &str) -> Result<()> {
    let mut server = vtx.socket(Pattern::Router)?;
    vtx.bind(&mut server, endpoint)?;
    info!(endpoint, "echo server ready");

    loop {
        let mut msg = server.recv()?;
        if msg.len() < 2 {
            continue;
        }
        let address = msg.remove(0);
        info!(input = %String::from_utf8_lossy(&msg[0].data), "request");
        server.send(vec![
            Frame::new(address.data, true),
            Frame::new(b"acknowledge".to_vec(), false),
        ])?;
    }
}

fn echo_client(vtx: &Vtx, endpoint: &str) -> Result<()> {
    let mut client = vtx.socket(Pattern::Dealer)?;
    vtx.connect(&mut client, endpoint)?;

    loop {
        client.send_bytes(b"hello?".to_vec())?;
        info!("hello?");
        match client.recv_timeout(Duration::from_secs(5)) {
            Ok(reply) => {
                info!(reply = %String::from_utf8_lossy(&reply[0].data), "reply");
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(VtxError::Timeout) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}
