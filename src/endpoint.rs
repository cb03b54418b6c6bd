//! Endpoint handle: one exclusively-owned connection per store instance.
//!
//! Speaks the store's wire protocol (RESP) directly over a
//! [`tokio::net::TcpStream`]. Each handle owns its connection behind an
//! async mutex; read queries from different handles may run in parallel,
//! while commands on the same handle are serialized by the lock. Every
//! call is bounded by the per-call timeout fixed at connect time so one
//! unreachable endpoint cannot stall a whole polling cycle.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::EndpointSpec;

/// Errors surfaced by endpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// TCP connect or handshake with the instance failed.
    #[error("failed connecting to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    /// AUTH was rejected.
    #[error("authentication failed for {address}: {reason}")]
    AuthFailed { address: String, reason: String },

    /// Socket-level failure mid-conversation.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The reply did not conform to the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error reply.
    #[error("command failed: {0}")]
    Command(String),

    /// The call did not complete within the per-call timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

// ---------------------------------------------------------------------------
// Wire protocol
// ---------------------------------------------------------------------------

/// A single parsed protocol reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<String>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Treat an `-ERR ...` reply as a command failure, pass others through.
    fn into_result(self) -> Result<Reply, EndpointError> {
        match self {
            Reply::Error(msg) => Err(EndpointError::Command(msg)),
            other => Ok(other),
        }
    }

    fn as_bulk(&self) -> Option<&str> {
        match self {
            Reply::Bulk(Some(s)) => Some(s.as_str()),
            Reply::Simple(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Encode a command as a RESP array of bulk strings.
fn encode_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one complete reply, including nested arrays.
fn read_reply<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<Reply, EndpointError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(EndpointError::Protocol("connection closed".to_string()));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(EndpointError::Protocol("empty reply line".to_string()));
        }
        let (kind, rest) = line.split_at(1);

        match kind {
            "+" => Ok(Reply::Simple(rest.to_string())),
            "-" => Ok(Reply::Error(rest.to_string())),
            ":" => rest
                .parse::<i64>()
                .map(Reply::Integer)
                .map_err(|_| EndpointError::Protocol(format!("bad integer reply: {line}"))),
            "$" => {
                let len = rest
                    .parse::<i64>()
                    .map_err(|_| EndpointError::Protocol(format!("bad bulk length: {line}")))?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                let mut buf = vec![0u8; len as usize + 2];
                reader.read_exact(&mut buf).await?;
                buf.truncate(len as usize);
                let s = String::from_utf8_lossy(&buf).into_owned();
                Ok(Reply::Bulk(Some(s)))
            }
            "*" => {
                let len = rest
                    .parse::<i64>()
                    .map_err(|_| EndpointError::Protocol(format!("bad array length: {line}")))?;
                if len < 0 {
                    return Ok(Reply::Array(None));
                }
                let mut items = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    items.push(read_reply(reader).await?);
                }
                Ok(Reply::Array(Some(items)))
            }
            _ => Err(EndpointError::Protocol(format!("unexpected reply: {line}"))),
        }
    })
}

// ---------------------------------------------------------------------------
// INFO reply
// ---------------------------------------------------------------------------

/// Parsed `INFO` output: `key:value` lines, comment lines dropped.
#[derive(Debug, Clone, Default)]
pub struct InfoReply {
    fields: HashMap<String, String>,
}

impl InfoReply {
    /// Parse the raw bulk payload of an INFO reply.
    pub fn parse(raw: &str) -> Self {
        let mut fields = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.to_string(), value.trim().to_string());
            }
        }
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.get(field).and_then(|v| v.parse().ok())
    }

    /// Whether a flag-style field (`0`/`1`) is set.
    pub fn get_flag(&self, field: &str) -> Option<bool> {
        self.get_u64(field).map(|v| v != 0)
    }

    /// Iterate over all fields, used for keyspace aggregation.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Client connection records
// ---------------------------------------------------------------------------

/// One row of `CLIENT LIST` output, reduced to the fields the drain
/// monitor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnection {
    /// Connection flags; replicas carry `S`.
    pub flags: String,
    /// Output buffer length indicator; non-zero means the fixed reply
    /// buffer holds pending data.
    pub obl: u64,
    /// Output list length, commands queued beyond the fixed buffer.
    pub oll: u64,
    /// Output buffer memory in bytes.
    pub omem: u64,
}

impl ClientConnection {
    /// Whether this connection is a replica link.
    pub fn is_replica(&self) -> bool {
        self.flags.contains('S')
    }
}

/// Parse the bulk payload of `CLIENT LIST`: one space-separated
/// `key=value` record per line.
fn parse_client_list(raw: &str) -> Vec<ClientConnection> {
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let mut conn = ClientConnection {
                flags: String::new(),
                obl: 0,
                oll: 0,
                omem: 0,
            };
            for field in line.split_whitespace() {
                if let Some((key, value)) = field.split_once('=') {
                    match key {
                        "flags" => conn.flags = value.to_string(),
                        "obl" => conn.obl = value.parse().unwrap_or(0),
                        "oll" => conn.oll = value.parse().unwrap_or(0),
                        "omem" => conn.omem = value.parse().unwrap_or(0),
                        _ => {}
                    }
                }
            }
            conn
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// A connected store instance.
///
/// Immutable after connect except for the conversation state behind the
/// lock; the resolved server version is fetched once during the handshake.
pub struct Endpoint {
    spec: EndpointSpec,
    version: String,
    call_timeout: Duration,
    conn: Mutex<BufReader<TcpStream>>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address())
            .field("version", &self.version)
            .finish()
    }
}

impl Endpoint {
    /// Connect, authenticate if a password is configured, verify the
    /// instance answers `PING`, and resolve its server version.
    pub async fn connect(
        spec: EndpointSpec,
        call_timeout: Duration,
    ) -> Result<Self, EndpointError> {
        let address = spec.address();
        let connect = async {
            let stream = TcpStream::connect(&address).await.map_err(|e| {
                EndpointError::ConnectionFailed {
                    address: address.clone(),
                    reason: e.to_string(),
                }
            })?;
            let mut conn = BufReader::new(stream);

            if !spec.password.is_empty() {
                let reply = exchange(&mut conn, &["AUTH", spec.password.as_str()]).await?;
                if let Reply::Error(msg) = reply {
                    return Err(EndpointError::AuthFailed {
                        address: address.clone(),
                        reason: msg,
                    });
                }
            }

            exchange(&mut conn, &["PING"]).await?.into_result()?;

            let info = exchange(&mut conn, &["INFO", "server"])
                .await?
                .into_result()?;
            let raw = info.as_bulk().ok_or_else(|| {
                EndpointError::Protocol("INFO did not return a bulk reply".to_string())
            })?;
            let version = InfoReply::parse(raw)
                .get("redis_version")
                .unwrap_or("0.0.0")
                .to_string();

            Ok::<_, EndpointError>((conn, version))
        };

        let (conn, version) = tokio::time::timeout(call_timeout, connect)
            .await
            .map_err(|_| EndpointError::ConnectionFailed {
                address: spec.address(),
                reason: format!("timed out after {call_timeout:?}"),
            })??;

        Ok(Self {
            spec,
            version,
            call_timeout,
            conn: Mutex::new(conn),
        })
    }

    /// `host:port`, for display.
    pub fn address(&self) -> String {
        self.spec.address()
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    /// Password configured for this endpoint; empty string when none.
    pub fn password(&self) -> &str {
        &self.spec.password
    }

    /// Server version resolved at connect time.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Issue one command and return its reply, bounded by the call timeout.
    async fn call(&self, args: &[&str]) -> Result<Reply, EndpointError> {
        let mut conn = self.conn.lock().await;
        match tokio::time::timeout(self.call_timeout, exchange(&mut conn, args)).await {
            Ok(reply) => reply?.into_result(),
            Err(_) => {
                warn!(endpoint = %self.address(), command = %args.first().unwrap_or(&""),
                      "endpoint call timed out");
                Err(EndpointError::Timeout(self.call_timeout))
            }
        }
    }

    /// `INFO [section]`, parsed into key/value fields.
    pub async fn info(&self, section: Option<&str>) -> Result<InfoReply, EndpointError> {
        let reply = match section {
            Some(s) => self.call(&["INFO", s]).await?,
            None => self.call(&["INFO"]).await?,
        };
        let raw = reply.as_bulk().ok_or_else(|| {
            EndpointError::Protocol("INFO did not return a bulk reply".to_string())
        })?;
        Ok(InfoReply::parse(raw))
    }

    /// `CONFIG GET <key>`; `None` when the server knows no such parameter.
    pub async fn config_get(&self, key: &str) -> Result<Option<String>, EndpointError> {
        let reply = self.call(&["CONFIG", "GET", key]).await?;
        match reply {
            Reply::Array(Some(items)) if items.len() >= 2 => {
                Ok(items[1].as_bulk().map(str::to_string))
            }
            Reply::Array(_) => Ok(None),
            other => Err(EndpointError::Protocol(format!(
                "unexpected CONFIG GET reply: {other:?}"
            ))),
        }
    }

    /// `CONFIG SET <key> <value>`.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), EndpointError> {
        self.call(&["CONFIG", "SET", key, value]).await?;
        Ok(())
    }

    /// Make this instance a replica of `host:port`.
    pub async fn replica_of(&self, host: &str, port: u16) -> Result<(), EndpointError> {
        let port = port.to_string();
        self.call(&["SLAVEOF", host, port.as_str()]).await?;
        Ok(())
    }

    /// Detach this instance from any source, making it independent.
    pub async fn detach(&self) -> Result<(), EndpointError> {
        self.call(&["SLAVEOF", "NO", "ONE"]).await?;
        Ok(())
    }

    /// `CLIENT LIST`, reduced to the drain-relevant fields.
    pub async fn client_list(&self) -> Result<Vec<ClientConnection>, EndpointError> {
        let reply = self.call(&["CLIENT", "LIST"]).await?;
        let raw = reply.as_bulk().ok_or_else(|| {
            EndpointError::Protocol("CLIENT LIST did not return a bulk reply".to_string())
        })?;
        Ok(parse_client_list(raw))
    }
}

/// Write one command and read its reply on an open connection.
async fn exchange(
    conn: &mut BufReader<TcpStream>,
    args: &[&str],
) -> Result<Reply, EndpointError> {
    conn.get_mut().write_all(&encode_command(args)).await?;
    read_reply(conn).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_encode_command() {
        let encoded = encode_command(&["CONFIG", "GET", "masterauth"]);
        assert_eq!(
            encoded,
            b"*3\r\n$6\r\nCONFIG\r\n$3\r\nGET\r\n$10\r\nmasterauth\r\n"
        );
    }

    #[test]
    fn test_info_reply_parsing() {
        let raw = "# Server\r\nredis_version:2.6.14\r\n\r\n# Memory\r\nused_memory:1048576\r\nmaster_sync_in_progress:0\r\n";
        let info = InfoReply::parse(raw);
        assert_eq!(info.get("redis_version"), Some("2.6.14"));
        assert_eq!(info.get_u64("used_memory"), Some(1048576));
        assert_eq!(info.get_flag("master_sync_in_progress"), Some(false));
        assert_eq!(info.get("nonexistent"), None);
    }

    #[test]
    fn test_client_list_parsing() {
        let raw = "addr=10.0.0.1:50001 fd=8 name= flags=S obl=0 oll=5 omem=1024\n\
                   addr=10.0.0.2:50002 fd=9 name= flags=N obl=16 oll=0 omem=0\n";
        let clients = parse_client_list(raw);
        assert_eq!(clients.len(), 2);
        assert!(clients[0].is_replica());
        assert_eq!(clients[0].oll, 5);
        assert_eq!(clients[0].omem, 1024);
        assert!(!clients[1].is_replica());
        assert_eq!(clients[1].obl, 16);
    }

    #[tokio::test]
    async fn test_read_reply_kinds() {
        let payload = b"+OK\r\n-ERR nope\r\n:42\r\n$5\r\nhello\r\n$-1\r\n*2\r\n$1\r\na\r\n:1\r\n";
        let mut reader = BufReader::new(&payload[..]);

        assert_eq!(
            read_reply(&mut reader).await.unwrap(),
            Reply::Simple("OK".to_string())
        );
        assert_eq!(
            read_reply(&mut reader).await.unwrap(),
            Reply::Error("ERR nope".to_string())
        );
        assert_eq!(read_reply(&mut reader).await.unwrap(), Reply::Integer(42));
        assert_eq!(
            read_reply(&mut reader).await.unwrap(),
            Reply::Bulk(Some("hello".to_string()))
        );
        assert_eq!(read_reply(&mut reader).await.unwrap(), Reply::Bulk(None));
        assert_eq!(
            read_reply(&mut reader).await.unwrap(),
            Reply::Array(Some(vec![
                Reply::Bulk(Some("a".to_string())),
                Reply::Integer(1)
            ]))
        );
    }

    #[test]
    fn test_error_reply_becomes_command_error() {
        let err = Reply::Error("ERR unknown command".to_string())
            .into_result()
            .unwrap_err();
        assert!(matches!(err, EndpointError::Command(_)));
    }
}
