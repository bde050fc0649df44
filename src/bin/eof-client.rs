//! Companion client: sends one message and prints the server's reply.

use clap::Parser;
use eof_echo::protocol::MARKER;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Parser, Debug)]
#[command(name = "eof-client")]
#[command(version)]
#[command(about = "Send a message to an eof-echo server", long_about = None)]
struct Args {
    /// Server address
    #[arg(short = 'a', long, default_value = "127.0.0.1:11000")]
    addr: String,

    /// Message to send
    #[arg(default_value = "This is a test from Client")]
    message: String,

    /// Send the message as-is, without appending the marker
    #[arg(long)]
    raw: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut stream = TcpStream::connect(&args.addr).await?;

    let mut payload = args.message.into_bytes();
    if !args.raw {
        payload.extend_from_slice(MARKER);
    }
    stream.write_all(&payload).await?;
    println!("Bytes sent: {}", payload.len());

    // Nothing more to send; the server closes once it has replied.
    stream.shutdown().await?;

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await?;
    println!("Bytes received: {}", reply.len());
    println!("{}", String::from_utf8_lossy(&reply));

    Ok(())
}
