use std::time::{SystemTime, UNIX_EPOCH};

pub mod atomic_map;
pub mod buf;
pub mod safe_converter;

/// Wall clock time in nanoseconds since the epoch, as used in FIXP timestamps
pub fn timestamp_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}
