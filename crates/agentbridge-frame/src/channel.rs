//! Channel IDs carried in every frame header.
//!
//! A connection carries one exchange pattern, but CONTROL frames (subscription
//! hints) share the stream with the pattern's own frames.

/// Connection management (topic subscribe/unsubscribe hints).
pub const CONTROL: u16 = 0;

/// Action requests and their replies.
pub const COMMAND: u16 = 1;

/// Topic-tagged telemetry messages.
pub const TELEMETRY: u16 = 2;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        COMMAND => "COMMAND",
        TELEMETRY => "TELEMETRY",
        _ => "UNKNOWN",
    }
}
