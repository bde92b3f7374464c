/// Utility functions and helpers
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a unique ID based on timestamp and random component
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();

    let random: u32 = rand::random();
    format!("{}-{}-{:x}", prefix, timestamp, random)
}

/// Bound a string to `max_len` bytes, cutting on a char boundary.
///
/// Returns the bounded string and whether anything was cut off. Callers
/// decide whether truncation is a warning (server address) or a hard
/// rejection (monitor credentials).
pub fn truncate_to(source: &str, max_len: usize) -> (String, bool) {
    if source.len() <= max_len {
        return (source.to_string(), false);
    }

    let mut end = max_len;
    while !source.is_char_boundary(end) {
        end -= 1;
    }
    (source[..end].to_string(), true)
}

/// Format duration for human-readable output
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
