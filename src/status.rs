//! Status aggregation: fresh per-poll endpoint queries formatted into the
//! render model the console displays.
//!
//! Nothing here is cached across polls. Version-gated fields are carried
//! as `Option` so "not applicable" stays distinguishable from zero.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::endpoint::EndpointError;
use crate::session::MigrationPair;
use crate::version::{self, supports};

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// Format a byte count using binary multiples, truncated (not rounded) to
/// the unit where the value is below 1024: `512B`, `2KB`, `5MB`, `3GB`.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes < KB {
        format!("{bytes}B")
    } else if bytes < MB {
        format!("{}KB", bytes / KB)
    } else if bytes < GB {
        format!("{}MB", bytes / MB)
    } else {
        format!("{}GB", bytes / GB)
    }
}

/// Megabytes with two decimals, used for memory figures.
pub fn format_mb(bytes: u64) -> String {
    format!("{:.2}MB", bytes as f64 / (1024.0 * 1024.0))
}

fn or_na<T: std::fmt::Display>(value: Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "N/A".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Render model
// ---------------------------------------------------------------------------

/// One displayed line for a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairLine {
    pub index: usize,
    pub text: String,
    pub is_error: bool,
}

/// Everything the console needs for one frame: a summary line, an
/// optional banner, the bold command legend, and one line per pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderModel {
    pub summary: String,
    pub banner: Option<String>,
    pub legend: String,
    pub pairs: Vec<PairLine>,
}

// ---------------------------------------------------------------------------
// Pre-start aggregate
// ---------------------------------------------------------------------------

/// Aggregate figures across all source instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryStats {
    /// Summed `used_memory` over all sources.
    pub total_memory: u64,
    /// Summed key counts over sources that support keyspace info;
    /// `None` when no source does.
    pub total_keys: Option<u64>,
    /// Number of source instances queried.
    pub instances: usize,
}

impl SummaryStats {
    pub fn summary_line(&self) -> String {
        format!(
            "Syncing {} and {} keys from {} stores",
            format_mb(self.total_memory),
            or_na(self.total_keys),
            self.instances
        )
    }
}

/// Query every source for used memory and (where supported) keyspace key
/// counts. A source that fails to answer contributes nothing to the sums;
/// the next poll retries it.
pub async fn poll_summary(pairs: &[MigrationPair]) -> SummaryStats {
    let queries = pairs.iter().map(|pair| async move {
        let info = pair.source.info(None).await?;
        let memory = info.get_u64("used_memory").unwrap_or(0);

        let keys = if supports(pair.source.version(), version::KEYSPACE_INFO) {
            let keyspace = pair.source.info(Some("keyspace")).await?;
            let mut total = 0u64;
            for (_db, value) in keyspace.iter() {
                // db0:keys=100,expires=0,avg_ttl=0
                if let Some(count) = value
                    .split(',')
                    .find_map(|part| part.strip_prefix("keys="))
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    total += count;
                }
            }
            Some(total)
        } else {
            None
        };

        Ok::<_, EndpointError>((memory, keys))
    });

    let mut stats = SummaryStats {
        instances: pairs.len(),
        ..SummaryStats::default()
    };
    for (pair, result) in pairs.iter().zip(join_all(queries).await) {
        match result {
            Ok((memory, keys)) => {
                stats.total_memory += memory;
                if let Some(count) = keys {
                    *stats.total_keys.get_or_insert(0) += count;
                }
            }
            Err(e) => {
                warn!(source = %pair.source.address(), error = %e, "summary query failed");
            }
        }
    }
    stats
}

// ---------------------------------------------------------------------------
// Per-pair sync status
// ---------------------------------------------------------------------------

/// Replication state of one destination, derived fresh each poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Replication role the destination reports.
    pub role: String,
    /// Replica-reported state of the link to its source.
    pub link_status: String,
    /// Whether an initial synchronization is still running.
    pub sync_in_progress: bool,
    /// Bytes left to transfer; absent on versions that do not report it.
    pub bytes_left: Option<u64>,
    /// Destination `used_memory` in bytes.
    pub used_memory: u64,
}

impl SyncStatus {
    /// A destination counts as synced once it is a replica with its link up.
    pub fn is_synced(&self) -> bool {
        self.is_replica() && self.link_status == "up"
    }

    /// Older servers report the replica role as `slave`.
    pub fn is_replica(&self) -> bool {
        self.role == "slave" || self.role == "replica"
    }
}

/// Result of one sync polling pass across all pairs.
#[derive(Debug, Clone, Default)]
pub struct SyncPoll {
    pub lines: Vec<PairLine>,
    /// Pairs whose destination is a replica with its link up.
    pub synced: usize,
}

async fn query_sync(pair: &MigrationPair) -> Result<SyncStatus, EndpointError> {
    let info = pair.destination.info(None).await?;
    Ok(SyncStatus {
        role: info.get("role").unwrap_or("unknown").to_string(),
        link_status: info.get("master_link_status").unwrap_or("unknown").to_string(),
        sync_in_progress: info.get_flag("master_sync_in_progress").unwrap_or(false),
        bytes_left: info.get_u64("master_sync_left_bytes"),
        used_memory: info.get_u64("used_memory").unwrap_or(0),
    })
}

/// Poll every pair's destination concurrently and format the result.
///
/// A destination that is not configured as a replica produces an error
/// line and is excluded from the synced count; it does not stop the other
/// pairs from being polled.
pub async fn poll_sync(pairs: &[MigrationPair]) -> SyncPoll {
    let results = join_all(pairs.iter().map(query_sync)).await;

    let mut poll = SyncPoll::default();
    for (pair, result) in pairs.iter().zip(results) {
        match result {
            Ok(status) if !status.is_replica() => {
                poll.lines.push(PairLine {
                    index: pair.index,
                    text: format!(
                        "Error: dest {} configured as {}",
                        pair.destination.address(),
                        status.role
                    ),
                    is_error: true,
                });
            }
            Ok(status) => {
                if status.is_synced() {
                    poll.synced += 1;
                }
                poll.lines.push(PairLine {
                    index: pair.index,
                    text: format!(
                        "{} - link status: {}, sync in progress: {}, {} left, used memory {}",
                        pair.label(),
                        status.link_status,
                        if status.sync_in_progress { "yes" } else { "no" },
                        or_na(status.bytes_left.map(format_bytes)),
                        format_mb(status.used_memory),
                    ),
                    is_error: false,
                });
            }
            Err(e) => {
                poll.lines.push(PairLine {
                    index: pair.index,
                    text: format!("Error: {} - {}", pair.label(), e),
                    is_error: true,
                });
            }
        }
    }
    poll
}

// ---------------------------------------------------------------------------
// Per-pair buffer-drain status
// ---------------------------------------------------------------------------

/// Outstanding replication buffer state on one source, plus the
/// destination's effective read-only setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStatus {
    /// Largest output-buffer byte size among the source's replica
    /// connections; requires 2.6 on the source.
    pub max_output_bytes: Option<u64>,
    /// Largest outstanding command backlog among the source's replica
    /// connections; requires 2.4 on the source.
    pub max_backlog: Option<u64>,
    /// Destination `slave-read-only` setting; requires 2.6 on the
    /// destination.
    pub read_only: Option<String>,
}

/// Backlog of one replica connection: a non-empty fixed reply buffer
/// counts as one extra pending unit on top of the queued command list.
pub fn connection_backlog(obl: u64, oll: u64) -> u64 {
    u64::from(obl > 0) + oll
}

async fn query_buffers(pair: &MigrationPair) -> Result<BufferStatus, EndpointError> {
    let src_version = pair.source.version().to_string();

    let (max_output_bytes, max_backlog) = if supports(&src_version, version::CLIENT_BACKLOG) {
        let replicas: Vec<_> = pair
            .source
            .client_list()
            .await?
            .into_iter()
            .filter(|c| c.is_replica())
            .collect();

        let backlog = replicas
            .iter()
            .map(|c| connection_backlog(c.obl, c.oll))
            .max();
        let output_bytes = if supports(&src_version, version::CLIENT_OUTPUT_BYTES) {
            replicas.iter().map(|c| c.omem).max()
        } else {
            None
        };
        (output_bytes, backlog)
    } else {
        (None, None)
    };

    let read_only = if supports(pair.destination.version(), version::READ_ONLY_CONFIG) {
        pair.destination.config_get("slave-read-only").await?
    } else {
        None
    };

    Ok(BufferStatus {
        max_output_bytes,
        max_backlog,
        read_only,
    })
}

/// Poll the drain state of every pair concurrently and format the result.
pub async fn poll_buffers(pairs: &[MigrationPair]) -> Vec<PairLine> {
    let results = join_all(pairs.iter().map(query_buffers)).await;

    pairs
        .iter()
        .zip(results)
        .map(|(pair, result)| match result {
            Ok(status) => PairLine {
                index: pair.index,
                text: format!(
                    "{}: replication buf size {}, replication buf commands: {}, dst readonly: {}",
                    pair.label(),
                    or_na(status.max_output_bytes.map(format_bytes)),
                    or_na(status.max_backlog),
                    or_na(status.read_only),
                ),
                is_error: false,
            },
            Err(e) => PairLine {
                index: pair.index,
                text: format!("Error: {} - {}", pair.label(), e),
                is_error: true,
            },
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes_truncates() {
        assert_eq!(format_bytes(0), "0B");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1023), "1023B");
        assert_eq!(format_bytes(2048), "2KB");
        assert_eq!(format_bytes(2047), "1KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 + 999), "5MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3GB");
    }

    #[test]
    fn test_format_mb() {
        assert_eq!(format_mb(10 * 1024 * 1024), "10.00MB");
        assert_eq!(format_mb(15 * 1024 * 1024), "15.00MB");
        assert_eq!(format_mb(1536 * 1024), "1.50MB");
    }

    #[test]
    fn test_connection_backlog_formula() {
        // A non-empty fixed buffer adds one pending unit on top of the
        // queued list length.
        assert_eq!(connection_backlog(16, 3), 4);
        assert_eq!(connection_backlog(0, 5), 5);
        assert_eq!(
            std::cmp::max(connection_backlog(16, 3), connection_backlog(0, 5)),
            5
        );
        assert_eq!(connection_backlog(0, 0), 0);
    }

    #[test]
    fn test_backlog_max_matches_expected() {
        // (obl>0, oll) pairs (true, 3) and (false, 5): max(1+3, 0+5) == 5,
        // and swapping the list length shows the flag contribution.
        assert_eq!(
            [connection_backlog(1, 3), connection_backlog(0, 5)]
                .into_iter()
                .max(),
            Some(5)
        );
        assert_eq!(
            [connection_backlog(1, 3), connection_backlog(0, 2)]
                .into_iter()
                .max(),
            Some(4)
        );
    }

    #[test]
    fn test_summary_line() {
        let stats = SummaryStats {
            total_memory: 15 * 1024 * 1024,
            total_keys: Some(150),
            instances: 2,
        };
        assert_eq!(stats.summary_line(), "Syncing 15.00MB and 150 keys from 2 stores");
    }

    #[test]
    fn test_summary_line_keys_unavailable() {
        let stats = SummaryStats {
            total_memory: 1024 * 1024,
            total_keys: None,
            instances: 1,
        };
        assert_eq!(stats.summary_line(), "Syncing 1.00MB and N/A keys from 1 stores");
    }

    #[test]
    fn test_sync_status_synced_requires_replica_role_and_link_up() {
        let mut status = SyncStatus {
            role: "slave".to_string(),
            link_status: "up".to_string(),
            sync_in_progress: false,
            bytes_left: None,
            used_memory: 0,
        };
        assert!(status.is_synced());

        status.link_status = "down".to_string();
        assert!(!status.is_synced());

        status.link_status = "up".to_string();
        status.role = "master".to_string();
        assert!(!status.is_synced());

        status.role = "replica".to_string();
        assert!(status.is_synced());
    }
}
