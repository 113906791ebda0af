use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{DISCONNECT_TOKEN, ServerLine, read_line, write_line},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    let mut buf = Vec::new();
    send_username(&mut reader, &mut writer, &mut buf, &args.username).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = Vec::new();

    run_client_loop(&mut reader, &mut writer, &mut buf, &mut stdin, &mut input).await?;
    leave(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn send_username(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    buf: &mut Vec<u8>,
    username: &str,
) -> Result<()> {
    match read_line(reader, buf).await?.map(|line| ServerLine::parse(&line)) {
        Some(ServerLine::Prompt) => {}
        Some(other) => bail!("expected username prompt, got {other:?}"),
        None => bail!("server closed the connection before prompting"),
    }
    write_line(writer, username).await?;
    write_stdout(&format!("*** connected as {username}")).await?;
    Ok(())
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    buf: &mut Vec<u8>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut Vec<u8>,
) -> Result<()> {
    loop {
        select! {
            server_line = read_line(reader, buf) => {
                if !handle_server_line(server_line).await? {
                    break;
                }
            }
            typed = read_line(stdin, input) => {
                if !handle_stdin_input(typed, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line(line: io::Result<Option<String>>) -> Result<bool> {
    match line? {
        Some(line) => {
            write_stdout(&render_server_line(&line)).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    typed: io::Result<Option<String>>,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let Some(text) = typed? else {
        return Ok(false);
    };
    if text == DISCONNECT_TOKEN {
        return Ok(false);
    }

    write_line(writer, &text).await?;
    Ok(true)
}

/// Sends the disconnect token and closes the write side. Best effort: the
/// server may already be gone.
async fn leave(writer: &mut OwnedWriteHalf) {
    if let Err(error) = write_line(writer, DISCONNECT_TOKEN).await {
        warn!(?error, "failed to send disconnect token");
    }
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
    if let Err(error) = write_stdout("*** leaving chat").await {
        warn!(?error, "failed to write to stdout");
    }
}

/// Turns a server line into what the terminal shows.
pub fn render_server_line(line: &str) -> String {
    match ServerLine::parse(line) {
        ServerLine::Members(names) => format!("*** online: {}", names.join(", ")),
        ServerLine::Prompt | ServerLine::Text(_) => line.to_string(),
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
