//! Locally-unique tunnel id generation.
//!
//! A timestamp (seconds, little-endian) plus a monotonically-incrementing
//! counter, base32-encoded (no padding) and lowercased, prefixed with
//! [`TUNNEL_PREFIX`]. The tunnel reconciler garbage-collects dangling
//! links by this prefix, so it must never change independently of the
//! reconciler.
//!
//! Not safe for concurrent use — the counter is a plain `Cell`, not an
//! atomic. [`UidGenerator`] is owned exclusively by the event processor's
//! single task ("produced from exactly one thread").

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;

/// Prefix for every kernel link this agent creates; also used by the
/// tunnel reconciler to recognize dangling tunnels to delete.
pub const TUNNEL_PREFIX: &str = "shiba.";

/// A 4-byte timestamp plus a 2-byte counter is exactly 6 bytes, which
/// `BASE32_NOPAD` encodes to exactly 10 characters with no `=` padding —
/// the `shiba.` + 10-char base32 id the reconciler installs as a kernel
/// interface name. A single counter byte (the original's scheme) wraps
/// every 256 calls, which collides well within 10,000 rapid calls in one
/// second; widened to 2 bytes here so the counter doesn't wrap inside
/// that call volume while still landing on the spec'd 10-character id.
pub struct UidGenerator {
    counter: Cell<u16>,
}

impl Default for UidGenerator {
    fn default() -> Self {
        UidGenerator::new()
    }
}

impl UidGenerator {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u16)
            .unwrap_or(0);
        UidGenerator {
            counter: Cell::new(seed),
        }
    }

    /// Returns a new `shiba.<base32>` tunnel id, exactly 10 base32
    /// characters after the prefix.
    pub fn next(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let mut bytes = now.to_le_bytes().to_vec();
        let counter = self.counter.get().wrapping_add(1);
        self.counter.set(counter);
        bytes.extend_from_slice(&counter.to_le_bytes());
        let encoded = BASE32_NOPAD.encode(&bytes).to_lowercase();
        format!("{TUNNEL_PREFIX}{encoded}")
    }
}
