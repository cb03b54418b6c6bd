//! Server version comparison used to gate capability-dependent commands.
//!
//! Versions are dotted-decimal strings as reported by `INFO server`
//! (`redis_version:2.6.14`). Comparison walks the components pairwise over
//! the shorter of the two sequences; the first unequal pair decides.
//! Trailing components of the longer version are ignored, so `"2.6"` is
//! judged equal to `"2.6.1"`. This truncating behavior is relied on by the
//! capability gates and must not be "fixed" to a zero-padding compare:
//! downstream command gating depends on it.

use std::cmp::Ordering;

/// Compare two dotted-decimal version strings component-wise.
///
/// Components are compared as integers, not strings, so `"2.10"` sorts
/// above `"2.6"`. A component that fails to parse is treated as `0`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|p| p.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let va = parts(a);
    let vb = parts(b);

    for (pa, pb) in va.iter().zip(vb.iter()) {
        match pa.cmp(pb) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `version` satisfies the minimum `required` version.
pub fn supports(version: &str, required: &str) -> bool {
    compare_versions(version, required) != Ordering::Less
}

/// Minimum source version for keyspace key-count aggregation.
pub const KEYSPACE_INFO: &str = "2.6";
/// Minimum version for `slave-read-only` config get/set.
pub const READ_ONLY_CONFIG: &str = "2.6";
/// Minimum source version for per-connection output buffer byte sizes.
pub const CLIENT_OUTPUT_BYTES: &str = "2.6";
/// Minimum source version for per-connection output backlog counts.
pub const CLIENT_BACKLOG: &str = "2.4";
