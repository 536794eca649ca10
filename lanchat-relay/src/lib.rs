use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use chrono::Local;
use lanchat_core::{BROADCAST_TARGET, Classified, FrameReader, RawFrame, UserEntry, classify_line};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

const WELCOME: &str = "[系统] 欢迎使用局域网聊天室！请设置用户名\n";
const READ_BUFFER_BYTES: usize = 64 * 1024;

type ClientId = String;

#[derive(Debug, Clone)]
struct Connection {
    username: String,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Debug, Default)]
struct RelayState {
    clients: HashMap<ClientId, Connection>,
    connected_total: u64,
}

impl RelayState {
    fn others(&self, client_id: &str) -> Vec<mpsc::UnboundedSender<Bytes>> {
        self.clients
            .iter()
            .filter(|(id, _)| id.as_str() != client_id)
            .map(|(_, conn)| conn.tx.clone())
            .collect()
    }

    fn named(&self, username: &str) -> Vec<mpsc::UnboundedSender<Bytes>> {
        self.clients
            .values()
            .filter(|conn| conn.username == username)
            .map(|conn| conn.tx.clone())
            .collect()
    }

    fn username(&self, client_id: &str) -> String {
        self.clients
            .get(client_id)
            .map(|conn| conn.username.clone())
            .unwrap_or_default()
    }

    /// One `user_list` line per client, each with its own row marked `isSelf`.
    fn user_lists(&self) -> Vec<(mpsc::UnboundedSender<Bytes>, Bytes)> {
        self.clients
            .iter()
            .map(|(id, conn)| (conn.tx.clone(), self.user_list_for(id)))
            .collect()
    }

    fn user_list_for(&self, client_id: &str) -> Bytes {
        let mut users: Vec<UserEntry> = self
            .clients
            .iter()
            .map(|(id, conn)| UserEntry {
                is_self: id == client_id,
                online: true,
                username: conn.username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        json_frame(&json!({ "type": "user_list", "users": users }))
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
        }
    }

    pub async fn online_users(&self) -> Vec<String> {
        let relay = self.inner.read().await;
        let mut names: Vec<String> = relay
            .clients
            .values()
            .map(|conn| conn.username.clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    serve_until(listener, state, std::future::pending()).await
}

/// Accepts clients until `shutdown` resolves. Connections already accepted
/// keep running.
pub async fn serve_until(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()>,
) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("relay shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, addr) = accepted.map_err(|err| err.to_string())?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(state, stream, addr).await {
                        warn!("client {} ended with error: {}", addr, err);
                    }
                });
            }
        }
    }
}

fn client_id(addr: SocketAddr) -> ClientId {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let digest = Sha256::digest(format!("{}:{}", addr, nanos).as_bytes());
    hex::encode(&digest[..8])
}

async fn handle_client(state: AppState, stream: TcpStream, addr: SocketAddr) -> Result<(), String> {
    if let Err(err) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", addr, err);
    }
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let id = client_id(addr);
    let username = register_client(&state, &id, outbound_tx.clone()).await;
    info!("client {} connected from {} as {}", id, addr, username);
    let _ = outbound_tx.send(Bytes::from_static(WELCOME.as_bytes()));

    let mut reader = FrameReader::new();
    let mut buf = vec![0_u8; READ_BUFFER_BYTES];
    let result = loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(err) => break Err(err.to_string()),
        };
        reader.push(&buf[..n]);
        for frame in reader.pull() {
            match frame {
                Ok(RawFrame::Line(line)) => handle_line(&state, &id, &line).await,
                Ok(block @ RawFrame::Block { .. }) => forward_to_others(&state, &id, block.to_wire()).await,
                Err(err) => warn!("dropping malformed frame from {}: {}", id, err),
            }
        }
    };

    unregister_client(&state, &id).await;
    drop(outbound_tx);
    send_task.abort();
    info!("client {} disconnected", id);
    result
}

async fn register_client(
    state: &AppState,
    client_id: &str,
    tx: mpsc::UnboundedSender<Bytes>,
) -> String {
    let mut relay = state.inner.write().await;
    relay.connected_total += 1;
    let username = format!("User{}", relay.connected_total);
    relay.clients.insert(
        client_id.to_owned(),
        Connection {
            username: username.clone(),
            tx,
        },
    );
    username
}

async fn unregister_client(state: &AppState, client_id: &str) {
    let mut relay = state.inner.write().await;
    let Some(conn) = relay.clients.remove(client_id) else {
        return;
    };
    let recipients = relay.others(client_id);
    drop(relay);

    info!("{} left", conn.username);
    send_all(&recipients, system_line(&format!("{} 离开了聊天室", conn.username)));
    send_all(&recipients, user_status(&conn.username, false));
}

async fn handle_line(state: &AppState, client_id: &str, line: &[u8]) {
    match classify_line(line) {
        Classified::Json(Value::Object(fields)) => handle_json(state, client_id, fields).await,
        Classified::Json(other) => {
            let text = other.to_string();
            handle_text(state, client_id, &text).await;
        }
        Classified::LegacyText(text) => handle_text(state, client_id, text.trim()).await,
        Classified::Binary => debug!("dropping binary line of {} bytes from {}", line.len(), client_id),
    }
}

async fn handle_text(state: &AppState, client_id: &str, text: &str) {
    if text.is_empty() {
        return;
    }

    if let Some(name) = text.strip_prefix("LOGIN:") {
        login(state, client_id, name.trim()).await;
        return;
    }
    if text == "USERS" {
        let relay = state.inner.read().await;
        let reply = relay
            .clients
            .get(client_id)
            .map(|conn| (conn.tx.clone(), relay.user_list_for(client_id)));
        drop(relay);
        if let Some((tx, list)) = reply {
            let _ = tx.send(list);
        }
        return;
    }
    if let Some(name) = text.strip_prefix("name ") {
        rename(state, client_id, name.trim()).await;
        return;
    }

    let (speaker, content) = match text.strip_prefix("CHAT:") {
        Some(rest) => match rest.split_once(':') {
            Some((speaker, content)) => (speaker.to_owned(), content.to_owned()),
            None => {
                debug!("ignoring CHAT line without content from {}", client_id);
                return;
            }
        },
        None => (state.inner.read().await.username(client_id), text.to_owned()),
    };
    info!("{}: {}", speaker, content);
    let stamp = Local::now().format("%H:%M");
    let line = Bytes::from(format!("[{}] {}: {}\n", stamp, speaker, content));
    forward_to_others(state, client_id, line).await;
}

async fn login(state: &AppState, client_id: &str, requested: &str) {
    let mut relay = state.inner.write().await;
    let Some(conn) = relay.clients.get_mut(client_id) else {
        return;
    };
    if !requested.is_empty() {
        conn.username = requested.to_owned();
    }
    let username = conn.username.clone();
    let own_tx = conn.tx.clone();
    let recipients = relay.others(client_id);
    let lists = relay.user_lists();
    drop(relay);

    info!("client {} logged in as {}", client_id, username);
    let _ = own_tx.send(system_line(&format!("欢迎 {}！", username)));
    send_all(&recipients, system_line(&format!("{} 加入了聊天室", username)));
    send_all(&recipients, user_status(&username, true));
    for (tx, list) in lists {
        let _ = tx.send(list);
    }
}

async fn rename(state: &AppState, client_id: &str, requested: &str) {
    if requested.is_empty() {
        return;
    }
    let mut relay = state.inner.write().await;
    let Some(conn) = relay.clients.get_mut(client_id) else {
        return;
    };
    let old = std::mem::replace(&mut conn.username, requested.to_owned());
    let recipients = relay.others(client_id);
    let lists = relay.user_lists();
    drop(relay);

    info!("{} renamed to {}", old, requested);
    send_all(&recipients, system_line(&format!("{} 更名为 {}", old, requested)));
    for (tx, list) in lists {
        let _ = tx.send(list);
    }
}

async fn handle_json(state: &AppState, client_id: &str, mut fields: Map<String, Value>) {
    let kind = fields
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("text")
        .to_owned();

    match kind.as_str() {
        "login" => {
            let requested = fields
                .get("username")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_owned();
            rename(state, client_id, &requested).await;
        }
        "text" | "private" | "file_base64" | "image_base64" => {
            let has_sender = fields
                .get("sender")
                .and_then(Value::as_str)
                .is_some_and(|sender| !sender.is_empty());
            if !has_sender {
                let username = state.inner.read().await.username(client_id);
                fields.insert("sender".to_owned(), Value::String(username));
            }
            let target = fields
                .get("target")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|target| !target.is_empty() && *target != BROADCAST_TARGET)
                .map(str::to_owned);
            if kind != "text" && kind != "private" {
                let sender = fields.get("sender").and_then(Value::as_str).unwrap_or_default();
                let filename = fields
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                let encoded = fields
                    .get("filedata")
                    .and_then(Value::as_str)
                    .map_or(0, str::len);
                info!("{} sent {} ({} bytes encoded)", sender, filename, encoded);
            }

            let frame = json_frame(&Value::Object(fields));
            match target {
                Some(target) => forward_to_user(state, client_id, &target, frame).await,
                None if kind == "private" => {
                    warn!("private message without target from {}", client_id);
                }
                None => forward_to_others(state, client_id, frame).await,
            }
        }
        other => debug!("ignoring JSON message of type {} from {}", other, client_id),
    }
}

async fn forward_to_user(state: &AppState, client_id: &str, target: &str, frame: Bytes) {
    let (recipients, own_tx) = {
        let relay = state.inner.read().await;
        (
            relay.named(target),
            relay.clients.get(client_id).map(|conn| conn.tx.clone()),
        )
    };

    if recipients.is_empty() {
        info!("{} is not online; bouncing message from {}", target, client_id);
        if let Some(tx) = own_tx {
            let reply = json!({ "type": "error", "message": format!("用户 {} 不在线", target) });
            let _ = tx.send(json_frame(&reply));
        }
        return;
    }
    send_all(&recipients, frame);
}

async fn forward_to_others(state: &AppState, client_id: &str, frame: Bytes) {
    let recipients = state.inner.read().await.others(client_id);
    send_all(&recipients, frame);
}

fn send_all(recipients: &[mpsc::UnboundedSender<Bytes>], frame: Bytes) {
    for tx in recipients {
        let _ = tx.send(frame.clone());
    }
}

fn system_line(text: &str) -> Bytes {
    Bytes::from(format!("[系统] {}\n", text))
}

fn user_status(username: &str, online: bool) -> Bytes {
    json_frame(&json!({ "type": "user_status", "username": username, "online": online }))
}

fn json_frame(value: &Value) -> Bytes {
    match serde_json::to_string(value) {
        Ok(mut line) => {
            line.push('\n');
            Bytes::from(line)
        }
        Err(err) => {
            error!("failed to serialize message: {}", err);
            Bytes::new()
        }
    }
}
