use std::{future::Future, io, net::SocketAddr, time::Duration};

use bytes::Bytes;
use chrono::Local;
use lanchat_core::{
    Enqueued, FileEncoding, InboundEvent, InboundPipeline, Message, OutboundFile, Session,
    UploadQueue, UploadStep, compose, login_line, users_request,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, lookup_host, tcp::OwnedWriteHalf},
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep_until, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{ClientCommand, ClientConfig, ClientEvent, TransportError, storage};

const READ_BUFFER_BYTES: usize = 64 * 1024;
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// What a queued write is for, so its completion can be routed back.
#[derive(Debug)]
enum WriteTag {
    Line,
    Embedded(String),
    Frame(u64),
}

#[derive(Debug)]
enum WriteAck {
    Drained(WriteTag),
    Failed(WriteTag, io::Error),
}

enum Ended {
    /// The user asked to disconnect, or nobody is listening for events anymore.
    Quit,
    Lost(String),
}

/// The running client: send commands in, receive events out.
#[derive(Debug)]
pub struct ClientHandle {
    pub commands: mpsc::UnboundedSender<ClientCommand>,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn send(&self, command: ClientCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }
}

/// Starts the client on the current tokio runtime.
pub fn spawn(config: ClientConfig) -> ClientHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(config, command_rx, event_tx));
    ClientHandle {
        commands: command_tx,
        events: event_rx,
        task,
    }
}

/// Resolves `server` and opens a TCP connection, giving up after `connect_timeout`.
pub async fn connect(server: &str, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let attempt = async {
        let addrs: Vec<SocketAddr> = lookup_host(server)
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::InvalidInput => TransportError::InvalidAddress(server.to_owned()),
                _ => TransportError::HostNotFound(server.to_owned()),
            })?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!("connect to {} failed: {}", addr, err);
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .map(TransportError::from)
            .unwrap_or_else(|| TransportError::HostNotFound(server.to_owned())))
    };

    within(connect_timeout, attempt).await
}

async fn within<T>(
    limit: Duration,
    attempt: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    timeout(limit, attempt)
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Connects, serves the connection until it ends, and reconnects after the
/// configured delay when auto-reconnect is on.
pub async fn run(
    config: ClientConfig,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut session = Session::new(config.username.clone());

    loop {
        info!("connecting to {}", config.server);
        let _ = events.send(ClientEvent::Connecting {
            server: config.server.clone(),
        });

        match connect(&config.server, config.connect_timeout).await {
            Ok(stream) => {
                let mut connection = Connection::new(&config, &mut session, &events);
                match connection.serve(stream, &mut commands).await {
                    Ended::Quit => {
                        info!("disconnected by request");
                        let _ = events.send(ClientEvent::Disconnected { reason: None });
                        return;
                    }
                    Ended::Lost(reason) => {
                        warn!("connection lost: {}", reason);
                        let _ = events.send(ClientEvent::Disconnected {
                            reason: Some(reason),
                        });
                    }
                }
            }
            Err(err) => {
                error!("connect to {} failed: {}", config.server, err);
                let _ = events.send(ClientEvent::TransportError(err));
            }
        }

        if !config.auto_reconnect || events.is_closed() {
            return;
        }
        if !wait_before_reconnect(config.reconnect_delay, &mut commands, &events).await {
            return;
        }
    }
}

/// Sleeps out the reconnect delay. Returns `false` when the user disconnected
/// in the meantime.
async fn wait_before_reconnect(
    delay: Duration,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> bool {
    info!("reconnecting in {:?}", delay);
    let deadline = Instant::now() + delay;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return true,
            command = commands.recv() => match command {
                None | Some(ClientCommand::Disconnect) => return false,
                Some(other) => {
                    debug!("dropping {:?} while offline", other);
                    let _ = events.send(ClientEvent::Notice("not connected".to_owned()));
                }
            },
        }
    }
}

/// Per-connection state: everything here is discarded when the socket goes away.
struct Connection<'a> {
    config: &'a ClientConfig,
    session: &'a mut Session,
    events: &'a mpsc::UnboundedSender<ClientEvent>,
    pipeline: InboundPipeline,
    uploads: UploadQueue,
}

impl<'a> Connection<'a> {
    fn new(
        config: &'a ClientConfig,
        session: &'a mut Session,
        events: &'a mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            config,
            session,
            events,
            pipeline: InboundPipeline::new(),
            uploads: UploadQueue::new(),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn serve(
        &mut self,
        stream: TcpStream,
        commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Ended {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", err);
        }
        let (mut read_half, write_half) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel::<(WriteTag, Bytes)>();
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<WriteAck>();
        let mut writer = tokio::spawn(write_task(write_half, write_rx, ack_tx));

        let _ = write_tx.send((WriteTag::Line, Bytes::from(login_line(&self.session.username))));
        let _ = write_tx.send((WriteTag::Line, Bytes::from_static(users_request().as_bytes())));
        info!("connected to {} as {}", self.config.server, self.session.username);
        self.emit(ClientEvent::Connected);

        let mut buf = vec![0_u8; READ_BUFFER_BYTES];
        let ended = loop {
            tokio::select! {
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => break Ended::Lost(TransportError::RemoteClosed.to_string()),
                    Ok(n) => {
                        let inbound = self.pipeline.feed(&buf[..n], self.session);
                        for event in inbound {
                            self.on_inbound(event);
                        }
                    }
                    Err(err) => break Ended::Lost(TransportError::from(err).to_string()),
                },
                command = commands.recv() => match command {
                    None | Some(ClientCommand::Disconnect) => break Ended::Quit,
                    Some(command) => self.on_command(command, &write_tx),
                },
                Some(ack) = ack_rx.recv() => self.on_ack(ack),
            }
            if self.events.is_closed() {
                break Ended::Quit;
            }
            self.pump_uploads(&write_tx);
        };

        self.teardown();
        drop(write_tx);
        // Give lines queued before a disconnect a moment to reach the socket.
        if timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            debug!("writer still busy after {:?}; aborting", WRITER_DRAIN);
            writer.abort();
        }
        ended
    }

    fn on_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Message(Message::FileTransfer(file)) => {
                let events = self.events.clone();
                let download_dir = self.config.download_dir.clone();
                tokio::task::spawn_blocking(move || {
                    let now = Local::now().naive_local();
                    match storage::save_received_file(&download_dir, &file, now) {
                        Ok(path) => {
                            info!("saved {} to {}", file.filename, path.display());
                            let _ = events.send(ClientEvent::FileReceived {
                                message: file,
                                path,
                            });
                        }
                        Err(err) => {
                            warn!("failed to save {}: {}", file.filename, err);
                            let _ = events.send(ClientEvent::Notice(format!(
                                "failed to save {}: {}",
                                file.filename, err
                            )));
                        }
                    }
                });
            }
            InboundEvent::Message(message) => self.emit(ClientEvent::Message(message)),
            InboundEvent::Progress {
                filename,
                received,
                total,
            } => self.emit(ClientEvent::ReceiveProgress {
                filename,
                received,
                total,
            }),
            InboundEvent::Failure(err) => self.emit(ClientEvent::Notice(err.to_string())),
        }
    }

    fn on_command(
        &mut self,
        command: ClientCommand,
        write_tx: &mpsc::UnboundedSender<(WriteTag, Bytes)>,
    ) {
        match command {
            ClientCommand::SendText(text) => {
                match compose(self.session, &text, Local::now().naive_local()) {
                    Ok(Some(composed)) => {
                        let _ = write_tx.send((WriteTag::Line, Bytes::from(composed.line)));
                        if let Some(username) = composed.rename {
                            info!("username changed to {}", username);
                            self.session.username = username.clone();
                            self.emit(ClientEvent::Renamed { username });
                        }
                    }
                    Ok(None) => {}
                    Err(err) => self.emit(ClientEvent::Notice(err.to_string())),
                }
            }
            ClientCommand::SetTarget(target) => self.session.set_target(target),
            ClientCommand::RequestUsers => {
                let _ = write_tx.send((WriteTag::Line, Bytes::from_static(users_request().as_bytes())));
            }
            ClientCommand::SendFile { path, encoding } => {
                let label = path.display().to_string();
                let opened = OutboundFile::open(&path, encoding);
                match (opened, encoding) {
                    (Err(err), _) => {
                        warn!("cannot send {}: {}", label, err);
                        self.emit(ClientEvent::UploadFailed {
                            filename: label,
                            reason: err.to_string(),
                        });
                    }
                    (Ok(file), FileEncoding::Base64Embedded) => {
                        let filename = file.filename.clone();
                        let total = file.declared_size;
                        match file.into_base64_line(self.session) {
                            Ok(line) => {
                                self.emit(ClientEvent::UploadStarted {
                                    filename: filename.clone(),
                                    total,
                                });
                                let _ = write_tx.send((WriteTag::Embedded(filename), Bytes::from(line)));
                            }
                            Err(err) => self.emit(ClientEvent::UploadFailed {
                                filename,
                                reason: err.to_string(),
                            }),
                        }
                    }
                    (Ok(file), FileEncoding::ChunkedBinary) => {
                        let filename = file.filename.clone();
                        if let Enqueued::Queued { position } = self.uploads.enqueue(file) {
                            self.emit(ClientEvent::UploadQueued { filename, position });
                        }
                    }
                }
            }
            ClientCommand::CancelUpload => {
                if let Some(filename) = self.uploads.cancel_current() {
                    self.emit(ClientEvent::UploadFailed {
                        filename,
                        reason: "cancelled".to_owned(),
                    });
                }
            }
            ClientCommand::Disconnect => {}
        }
    }

    fn on_ack(&mut self, ack: WriteAck) {
        match ack {
            WriteAck::Drained(WriteTag::Frame(seq)) => {
                if let Some((filename, progress)) = self.uploads.on_write_complete(seq) {
                    self.emit(ClientEvent::UploadProgress {
                        filename,
                        written: progress.bytes_written,
                        total: progress.bytes_total,
                    });
                }
            }
            WriteAck::Drained(WriteTag::Embedded(filename)) => {
                info!("sent {}", filename);
                self.emit(ClientEvent::UploadFinished { filename });
            }
            WriteAck::Drained(WriteTag::Line) => {}
            WriteAck::Failed(WriteTag::Frame(seq), err) => {
                if let Some(step) = self.uploads.on_write_failed(seq, err) {
                    self.on_upload_step(step);
                }
            }
            WriteAck::Failed(WriteTag::Embedded(filename), err) => {
                self.emit(ClientEvent::UploadFailed {
                    filename,
                    reason: err.to_string(),
                });
            }
            WriteAck::Failed(WriteTag::Line, err) => {
                self.emit(ClientEvent::Notice(format!("send failed: {}", err)));
            }
        }
    }

    /// Moves the upload queue along until it is waiting on a write or empty.
    fn pump_uploads(&mut self, write_tx: &mpsc::UnboundedSender<(WriteTag, Bytes)>) {
        while let Some(step) = self.uploads.poll() {
            if let UploadStep::Frame { seq, frame, .. } = step {
                if write_tx.send((WriteTag::Frame(seq), frame)).is_err() {
                    return;
                }
                continue;
            }
            self.on_upload_step(step);
        }
    }

    fn on_upload_step(&self, step: UploadStep) {
        let event = match step {
            UploadStep::Started { filename, total } => ClientEvent::UploadStarted { filename, total },
            UploadStep::Finished { filename } => ClientEvent::UploadFinished { filename },
            UploadStep::Failed { filename, error } => ClientEvent::UploadFailed {
                filename,
                reason: error.to_string(),
            },
            UploadStep::Frame { .. } => return,
        };
        self.emit(event);
    }

    /// Releases every file handle and drops any half-received file.
    fn teardown(&mut self) {
        for filename in self.uploads.clear() {
            self.emit(ClientEvent::UploadFailed {
                filename,
                reason: "disconnected".to_owned(),
            });
        }
        if let Some(filename) = self.pipeline.reset() {
            warn!("discarding incomplete download of {}", filename);
            self.emit(ClientEvent::Notice(format!(
                "download of {} interrupted",
                filename
            )));
        }
    }
}

/// Writes frames in order and reports each one once it has fully drained.
async fn write_task(
    mut write_half: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<(WriteTag, Bytes)>,
    acks: mpsc::UnboundedSender<WriteAck>,
) {
    while let Some((tag, bytes)) = outgoing.recv().await {
        let written = match write_half.write_all(&bytes).await {
            Ok(()) => write_half.flush().await,
            Err(err) => Err(err),
        };
        let ack = match written {
            Ok(()) => WriteAck::Drained(tag),
            Err(err) => {
                warn!("write failed: {}", err);
                WriteAck::Failed(tag, err)
            }
        };
        if acks.send(ack).is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
