//! Short opaque ids for records, episodes, messages and candidates.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use engram_core::current_unix_timestamp_ms;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns `<prefix>_<8 hex chars>` unique across restarts: the digest mixes
/// wall-clock, pid and a process-local counter.
pub fn short_id(prefix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(current_unix_timestamp_ms().to_le_bytes());
    hasher.update(u64::from(std::process::id()).to_le_bytes());
    hasher.update(ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    let digest = hasher.finalize();

    let mut id = String::with_capacity(prefix.len() + 9);
    id.push_str(prefix);
    id.push('_');
    for byte in digest.iter().take(4) {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn unit_short_ids_carry_prefix_and_do_not_collide() {
        let ids: HashSet<String> = (0..64).map(|_| short_id("ent")).collect();
        assert_eq!(ids.len(), 64);
        for id in &ids {
            assert!(id.starts_with("ent_"));
            assert_eq!(id.len(), "ent_".len() + 8);
        }
    }
}
