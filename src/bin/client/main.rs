//! chat-relay-client: terminal client for the relay.
//!
//! Usage: `chat-relay-client <hostname>`. After logging in, type
//! `recipient:message` lines; incoming messages are printed as they arrive.

use std::io::Write;
use std::process::ExitCode;

use anyhow::Result;
use chat_relay::client::{LoginReply, attempt_login, encode_chat_line, parse_username, welcome_message};
use chat_relay::constants::{CLIENT_BUFFER_SIZE, DEFAULT_PORT};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chat-relay-client", version, about = "Terminal client for chat-relay")]
struct Args {
    /// Server hostname or address
    host: String,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

type StdinLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let Some(stream) = connect(&args).await else {
        eprintln!("client: failed to connect");
        return Ok(ExitCode::from(2));
    };

    let interrupted = CancellationToken::new();
    let token = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    let Some(stream) = login(&args, stream, &mut stdin, &interrupted).await? else {
        println!("\nDisconnected.");
        return Ok(ExitCode::SUCCESS);
    };

    let (read_half, mut write_half) = stream.into_split();
    let receiver = tokio::spawn(receive_messages(read_half));

    println!("Enter recipient and message (username:message): \nPress Ctrl+C to disconnect");

    loop {
        let line = tokio::select! {
            _ = interrupted.cancelled() => break,
            line = stdin.next_line() => line?,
        };

        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        if let Err(e) = write_half.write_all(encode_chat_line(&line).as_bytes()).await {
            debug!(error = %e, "Send failed");
            break;
        }
    }

    println!("\nDisconnecting...");
    if let Err(e) = write_half.shutdown().await {
        debug!(error = %e, "Error closing connection");
    }
    receiver.abort();
    println!("\nDisconnected.");

    Ok(ExitCode::SUCCESS)
}

async fn connect(args: &Args) -> Option<TcpStream> {
    match TcpStream::connect((args.host.as_str(), args.port)).await {
        Ok(stream) => {
            if let Ok(addr) = stream.peer_addr() {
                println!("client: connecting to {}", addr.ip());
            }
            Some(stream)
        }
        Err(e) => {
            debug!(error = %e, host = %args.host, "Connect failed");
            None
        }
    }
}

/// Prompts until the server welcomes a username. The server closes the
/// connection after a rejection, so each retry starts on a fresh one.
async fn login(
    args: &Args,
    mut stream: TcpStream,
    stdin: &mut StdinLines,
    interrupted: &CancellationToken,
) -> Result<Option<TcpStream>> {
    loop {
        print!("Enter your username: ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = interrupted.cancelled() => return Ok(None),
            line = stdin.next_line() => line?,
        };

        let Some(line) = line else { return Ok(None) };
        let Some(username) = parse_username(&line) else {
            continue;
        };

        match attempt_login(&mut stream, username).await {
            Ok(LoginReply::Welcome) => {
                println!("{}", welcome_message(username).trim_end());
                return Ok(Some(stream));
            }
            Ok(LoginReply::Retry(reply)) => println!("{}", reply.trim_end()),
            Ok(LoginReply::Disconnected) => {}
            Err(e) => debug!(error = %e, "Login attempt failed"),
        }

        println!("Invalid username. Please try again.");

        stream = match connect(args).await {
            Some(stream) => stream,
            None => anyhow::bail!("lost connection to {}", args.host),
        };
    }
}

async fn receive_messages(mut read_half: OwnedReadHalf) {
    let mut buf = [0u8; CLIENT_BUFFER_SIZE - 1];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                println!("Server disconnected.");
                break;
            }
            Ok(n) => {
                println!("\nReceived message:\n{}", String::from_utf8_lossy(&buf[..n]));
            }
            Err(e) => {
                eprintln!("Error receiving message: {e}");
                break;
            }
        }
    }
}
