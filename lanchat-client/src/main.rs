use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use lanchat_client::{ClientCommand, ClientConfig, ClientEvent, spawn};
use lanchat_core::{BROADCAST_TARGET, FileEncoding, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug, Clone)]
#[command(name = "lanchat")]
struct ClientArgs {
    #[arg(long, default_value = "127.0.0.1:8888")]
    server: String,
    #[arg(long)]
    username: String,
    #[arg(long, default_value_t = 5)]
    connect_timeout_secs: u64,
    #[arg(long, default_value = "LANChat")]
    download_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    auto_reconnect: bool,
    #[arg(long, default_value_t = 3)]
    reconnect_delay_secs: u64,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        ClientConfig {
            server: args.server,
            username: args.username,
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            download_dir: args.download_dir,
            auto_reconnect: args.auto_reconnect,
            reconnect_delay: Duration::from_secs(args.reconnect_delay_secs),
        }
    }
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&PathBuf>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}

/// Local commands handled by the terminal front end; everything else is sent
/// as typed.
fn parse_input(line: &str) -> Option<ClientCommand> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match head {
        "/quit" => ClientCommand::Disconnect,
        "/users" => ClientCommand::RequestUsers,
        "/cancel" => ClientCommand::CancelUpload,
        "/to" => ClientCommand::SetTarget(if rest.is_empty() {
            BROADCAST_TARGET.to_owned()
        } else {
            rest.to_owned()
        }),
        "/file" | "/file64" if !rest.is_empty() => ClientCommand::SendFile {
            path: PathBuf::from(rest),
            encoding: if head == "/file" {
                FileEncoding::ChunkedBinary
            } else {
                FileEncoding::Base64Embedded
            },
        },
        _ if line.trim().is_empty() => return None,
        _ => ClientCommand::SendText(line.to_owned()),
    };
    Some(command)
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connecting { server } => println!("* connecting to {server}"),
        ClientEvent::Connected => println!("* connected"),
        ClientEvent::Disconnected { reason: None } => println!("* disconnected"),
        ClientEvent::Disconnected {
            reason: Some(reason),
        } => println!("* disconnected: {reason}"),
        ClientEvent::TransportError(err) => println!("! {err}"),
        ClientEvent::Message(message) => print_message(message),
        ClientEvent::FileReceived { message, path } => println!(
            "* {} sent {} ({} bytes), saved to {}",
            message.sender,
            message.filename,
            message.size,
            path.display()
        ),
        ClientEvent::ReceiveProgress {
            filename,
            received,
            total,
        } => println!("* receiving {filename}: {received}/{total}"),
        ClientEvent::Notice(text) => println!("! {text}"),
        ClientEvent::Renamed { username } => println!("* you are now {username}"),
        ClientEvent::UploadQueued { filename, position } => {
            println!("* {filename} queued at position {position}")
        }
        ClientEvent::UploadStarted { filename, total } => {
            println!("* sending {filename} ({total} bytes)")
        }
        ClientEvent::UploadProgress {
            filename,
            written,
            total,
        } => println!("* sending {filename}: {written}/{total}"),
        ClientEvent::UploadFinished { filename } => println!("* sent {filename}"),
        ClientEvent::UploadFailed { filename, reason } => {
            println!("! sending {filename} failed: {reason}")
        }
    }
}

fn print_message(message: &Message) {
    match message {
        Message::Text { sender, content } => println!("{sender}: {content}"),
        Message::Private {
            sender,
            target,
            content,
        } => println!("{sender} -> {target}: {content}"),
        Message::UserStatus { username, online } => {
            let state = if *online { "online" } else { "offline" };
            println!("* {username} is {state}");
        }
        Message::UserList { entries } => {
            let names: Vec<String> = entries
                .iter()
                .map(|entry| {
                    if entry.is_self {
                        format!("{} (me)", entry.username)
                    } else {
                        entry.username.clone()
                    }
                })
                .collect();
            println!("* online: {}", names.join(", "));
        }
        Message::Error { text } => println!("! {text}"),
        Message::System { text } => println!("* {text}"),
        Message::FileTransfer(file) => println!("* {} sent {}", file.sender, file.filename),
    }
}

#[tokio::main]
async fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_ref());

    let mut client = spawn(ClientConfig::from(args));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = client.next_event() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Some(command) = parse_input(&line) {
                        client.send(command);
                    }
                }
                Ok(None) => {
                    stdin_open = false;
                    client.send(ClientCommand::Disconnect);
                }
                Err(err) => {
                    warn!("failed to read stdin: {}", err);
                    stdin_open = false;
                    client.send(ClientCommand::Disconnect);
                }
            },
        }
    }

    let _ = client.task.await;
}
