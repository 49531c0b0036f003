//! Batch partition arithmetic
//!
//! Converts a step's partition (absolute count or percentage) into the number
//! of pods that must run the new revision before the batch is observed.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::warn;

/// Partition value meaning "every replica"
pub const FULL_PARTITION: &str = "100%";

/// Pods required by `partition` out of `total_replicas`.
///
/// Percentages round up. The result is clamped to `[0, total_replicas]`.
/// With more than one replica, any string partition other than "100%" is
/// further clamped to `total_replicas - 1`, so a non-final batch never claims
/// every replica. A partition that fails to parse counts as 0.
pub fn batch_replicas_bound(partition: &IntOrString, total_replicas: i32) -> i32 {
    let total = total_replicas.max(0);
    let scaled = match scaled_value(partition, total) {
        Ok(v) => v,
        Err(msg) => {
            warn!(partition = ?partition, error = %msg, "Invalid partition, treating as 0");
            0
        }
    };

    let mut bound = scaled.clamp(0, total);
    if let IntOrString::String(s) = partition {
        if total > 1 && s != FULL_PARTITION {
            bound = bound.min(total - 1);
        }
    }
    bound
}

fn scaled_value(partition: &IntOrString, total: i32) -> Result<i32, String> {
    match partition {
        IntOrString::Int(v) => Ok(*v),
        IntOrString::String(s) => {
            let digits = s
                .strip_suffix('%')
                .ok_or_else(|| format!("{s:?} is not a percentage"))?;
            let percent: i64 = digits
                .trim()
                .parse()
                .map_err(|e| format!("{s:?} is not a percentage: {e}"))?;
            let scaled = (percent as f64 * total as f64 / 100.0).ceil();
            Ok(scaled.clamp(i32::MIN as f64, i32::MAX as f64) as i32)
        }
    }
}
