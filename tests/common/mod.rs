//! In-process fake store speaking enough of the wire protocol to drive a
//! whole cutover session: PING, AUTH, INFO, CONFIG GET/SET, SLAVEOF and
//! CLIENT LIST. State is shared behind a mutex so tests can inspect what
//! the tool configured and mutate what the "server" reports.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// One simulated replica-link client connection on a source.
#[derive(Debug, Clone)]
pub struct FakeClient {
    pub flags: String,
    pub obl: u64,
    pub oll: u64,
    pub omem: u64,
}

/// Mutable server-side state reported and configured over the protocol.
#[derive(Debug, Clone)]
pub struct StoreState {
    pub version: String,
    /// Password required by AUTH; empty means none.
    pub password: String,
    pub role: String,
    pub master_link_status: String,
    pub master_sync_in_progress: bool,
    pub master_sync_left_bytes: Option<u64>,
    pub used_memory: u64,
    /// (db name, key count) entries for the keyspace section.
    pub keyspace: Vec<(String, u64)>,
    pub config: HashMap<String, String>,
    /// Every CONFIG SET the tool issued, in order.
    pub config_writes: Vec<(String, String)>,
    /// Where SLAVEOF pointed this instance, if anywhere.
    pub master_addr: Option<(String, u16)>,
    pub clients: Vec<FakeClient>,
    /// When set, SLAVEOF immediately reports the link as up.
    pub auto_link_up: bool,
}

impl Default for StoreState {
    fn default() -> Self {
        let mut config = HashMap::new();
        config.insert("masterauth".to_string(), String::new());
        config.insert("slave-read-only".to_string(), "yes".to_string());
        Self {
            version: "2.6.14".to_string(),
            password: String::new(),
            role: "master".to_string(),
            master_link_status: "down".to_string(),
            master_sync_in_progress: false,
            master_sync_left_bytes: None,
            used_memory: 0,
            keyspace: Vec::new(),
            config,
            config_writes: Vec::new(),
            master_addr: None,
            clients: Vec::new(),
            auto_link_up: true,
        }
    }
}

/// A listening fake store instance.
pub struct FakeStore {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    /// Bind on an ephemeral port and start serving.
    pub async fn start(state: StoreState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve_connection(socket, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Read a configuration value as the tool left it.
    pub async fn config_value(&self, key: &str) -> Option<String> {
        self.state.lock().await.config.get(key).cloned()
    }
}

async fn serve_connection(socket: TcpStream, state: Arc<Mutex<StoreState>>) -> std::io::Result<()> {
    let mut conn = BufReader::new(socket);
    loop {
        let Some(args) = read_command(&mut conn).await? else {
            return Ok(());
        };
        let reply = dispatch(&args, &state).await;
        conn.get_mut().write_all(reply.as_bytes()).await?;
    }
}

/// Read one RESP array-of-bulk-strings command; `None` on clean EOF.
async fn read_command(
    conn: &mut BufReader<TcpStream>,
) -> std::io::Result<Option<Vec<String>>> {
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let line = line.trim_end();
    let count: usize = line
        .strip_prefix('*')
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let mut header = String::new();
        conn.read_line(&mut header).await?;
        let len: usize = header
            .trim_end()
            .strip_prefix('$')
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let mut buf = vec![0u8; len + 2];
        conn.read_exact(&mut buf).await?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(Some(args))
}

fn bulk(payload: &str) -> String {
    format!("${}\r\n{}\r\n", payload.len(), payload)
}

async fn dispatch(args: &[String], state: &Arc<Mutex<StoreState>>) -> String {
    let command = args
        .first()
        .map(|c| c.to_ascii_uppercase())
        .unwrap_or_default();

    match command.as_str() {
        "PING" => "+PONG\r\n".to_string(),
        "AUTH" => {
            let state = state.lock().await;
            if args.get(1).map(String::as_str) == Some(state.password.as_str()) {
                "+OK\r\n".to_string()
            } else {
                "-ERR invalid password\r\n".to_string()
            }
        }
        "INFO" => {
            let state = state.lock().await;
            let section = args.get(1).map(|s| s.to_ascii_lowercase());
            bulk(&render_info(&state, section.as_deref()))
        }
        "CONFIG" => {
            let sub = args
                .get(1)
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_default();
            match sub.as_str() {
                "GET" => {
                    let state = state.lock().await;
                    let key = args.get(2).cloned().unwrap_or_default();
                    match state.config.get(&key) {
                        Some(value) => format!("*2\r\n{}{}", bulk(&key), bulk(value)),
                        None => "*0\r\n".to_string(),
                    }
                }
                "SET" => {
                    let mut state = state.lock().await;
                    let key = args.get(2).cloned().unwrap_or_default();
                    let value = args.get(3).cloned().unwrap_or_default();
                    state.config_writes.push((key.clone(), value.clone()));
                    state.config.insert(key, value);
                    "+OK\r\n".to_string()
                }
                _ => "-ERR unknown CONFIG subcommand\r\n".to_string(),
            }
        }
        "SLAVEOF" => {
            let mut state = state.lock().await;
            let host = args.get(1).cloned().unwrap_or_default();
            let port = args.get(2).cloned().unwrap_or_default();
            if host.eq_ignore_ascii_case("no") && port.eq_ignore_ascii_case("one") {
                state.role = "master".to_string();
                state.master_addr = None;
            } else {
                state.role = "slave".to_string();
                state.master_addr = Some((host, port.parse().unwrap_or(0)));
                if state.auto_link_up {
                    state.master_link_status = "up".to_string();
                }
            }
            "+OK\r\n".to_string()
        }
        "CLIENT" => {
            let state = state.lock().await;
            let listing: String = state
                .clients
                .iter()
                .map(|c| {
                    format!(
                        "addr=127.0.0.1:50000 fd=8 name= flags={} obl={} oll={} omem={}\n",
                        c.flags, c.obl, c.oll, c.omem
                    )
                })
                .collect();
            bulk(&listing)
        }
        _ => "-ERR unknown command\r\n".to_string(),
    }
}

fn render_info(state: &StoreState, section: Option<&str>) -> String {
    let mut out = String::new();
    match section {
        Some("server") => {
            out.push_str("# Server\r\n");
            out.push_str(&format!("redis_version:{}\r\n", state.version));
        }
        Some("keyspace") => {
            out.push_str("# Keyspace\r\n");
            for (db, keys) in &state.keyspace {
                out.push_str(&format!("{db}:keys={keys},expires=0,avg_ttl=0\r\n"));
            }
        }
        _ => {
            out.push_str("# Server\r\n");
            out.push_str(&format!("redis_version:{}\r\n", state.version));
            out.push_str("# Replication\r\n");
            out.push_str(&format!("role:{}\r\n", state.role));
            if state.role == "slave" {
                out.push_str(&format!(
                    "master_link_status:{}\r\n",
                    state.master_link_status
                ));
                out.push_str(&format!(
                    "master_sync_in_progress:{}\r\n",
                    u8::from(state.master_sync_in_progress)
                ));
                if let Some(left) = state.master_sync_left_bytes {
                    out.push_str(&format!("master_sync_left_bytes:{left}\r\n"));
                }
            }
            out.push_str("# Memory\r\n");
            out.push_str(&format!("used_memory:{}\r\n", state.used_memory));
        }
    }
    out
}
