use std::{path::PathBuf, time::Duration};

pub const DEFAULT_SERVER: &str = "127.0.0.1:8888";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the chat server.
    pub server: String,
    pub username: String,
    pub connect_timeout: Duration,
    /// Received files land in kind-specific folders below this directory.
    pub download_dir: PathBuf,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_owned(),
            username: "LANChat User".to_owned(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            download_dir: PathBuf::from("LANChat"),
            auto_reconnect: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}
