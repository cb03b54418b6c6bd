//! Session configuration and endpoint URL parsing.
//!
//! Endpoint entries are `redis://` URLs. A scheme-less entry is treated as
//! `redis://<entry>`; any other scheme is rejected before a single
//! connection attempt is made. The default port is 6379 and the password
//! comes from the URL's user-info component (`redis://:secret@host:6379`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default store port when the URL omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Errors detectable from configuration alone, before any I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// URL scheme was present but not `redis`.
    #[error("invalid scheme {scheme} for {url}, aborting. url example: redis://127.0.0.1:6379")]
    InvalidScheme { scheme: String, url: String },

    /// URL could not be parsed into host/port.
    #[error("invalid endpoint url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Source and destination lists differ in length.
    #[error("number of sources ({sources}) must match number of destinations ({destinations})")]
    CountMismatch { sources: usize, destinations: usize },
}

/// Runtime options for the polling scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CutoverOptions {
    /// How often to refresh status while waiting for operator input.
    pub poll_interval: Duration,
    /// Maximum wait for a single endpoint query or command.
    pub call_timeout: Duration,
}

impl Default for CutoverOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            call_timeout: Duration::from_millis(5000),
        }
    }
}

/// A parsed endpoint address, not yet connected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub host: String,
    pub port: u16,
    /// Empty string means no authentication.
    pub password: String,
}

impl EndpointSpec {
    /// Display identity, `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse one endpoint URL entry.
pub fn parse_endpoint_url(entry: &str) -> Result<EndpointSpec, ConfigError> {
    let rest = match entry.split_once("://") {
        Some(("redis", rest)) => rest,
        Some((scheme, _)) => {
            return Err(ConfigError::InvalidScheme {
                scheme: scheme.to_string(),
                url: entry.to_string(),
            })
        }
        None => entry,
    };

    if rest.is_empty() {
        return Err(ConfigError::InvalidUrl {
            url: entry.to_string(),
            reason: "empty host".to_string(),
        });
    }

    // Split off user-info; the password is everything after the first ':'
    // in that component (`user:pass@` or `:pass@`).
    let (userinfo, hostport) = match rest.rsplit_once('@') {
        Some((ui, hp)) => (Some(ui), hp),
        None => (None, rest),
    };
    let password = userinfo
        .and_then(|ui| ui.split_once(':').map(|(_, p)| p))
        .unwrap_or("")
        .to_string();

    let (host, port) = match hostport.rsplit_once(':') {
        Some((h, p)) => {
            let port = p.parse::<u16>().map_err(|_| ConfigError::InvalidUrl {
                url: entry.to_string(),
                reason: format!("invalid port {p:?}"),
            })?;
            (h, port)
        }
        None => (hostport, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(ConfigError::InvalidUrl {
            url: entry.to_string(),
            reason: "empty host".to_string(),
        });
    }

    Ok(EndpointSpec {
        host: host.to_string(),
        port,
        password,
    })
}

/// Parse the parallel source/destination URL lists into spec pairs.
///
/// The lists must be the same length; a mismatch is a configuration error,
/// never a migration-time fault.
pub fn parse_endpoint_lists(
    sources: &[String],
    destinations: &[String],
) -> Result<Vec<(EndpointSpec, EndpointSpec)>, ConfigError> {
    if sources.len() != destinations.len() {
        return Err(ConfigError::CountMismatch {
            sources: sources.len(),
            destinations: destinations.len(),
        });
    }

    sources
        .iter()
        .zip(destinations.iter())
        .map(|(s, d)| Ok((parse_endpoint_url(s)?, parse_endpoint_url(d)?)))
        .collect()
}
