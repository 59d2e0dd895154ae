//! Foundational low-level utilities shared across engram crates.
//!
//! Provides atomic file-write helpers, time utilities used by staleness and
//! pruning calculations, and a cross-platform process-liveness probe.

pub mod atomic_io;
pub mod process;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use process::process_alive;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, days_to_ms};

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;

    #[test]
    fn time_utils_second_and_millisecond_clocks_agree() {
        let now_s = current_unix_timestamp();
        let now_ms = current_unix_timestamp_ms();
        let now_ms_s = now_ms / 1_000;
        assert!(now_ms_s >= now_s);
        assert!(now_ms_s <= now_s.saturating_add(1));
    }

    #[test]
    fn days_to_ms_converts_whole_days() {
        assert_eq!(days_to_ms(0), 0);
        assert_eq!(days_to_ms(1), 86_400_000);
        assert_eq!(days_to_ms(7), 7 * 86_400_000);
    }

    #[test]
    fn write_text_atomic_writes_and_replaces_content() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("state.json");
        write_text_atomic(&path, "{\"episode\":null}").expect("write");
        assert_eq!(read_to_string(&path).expect("read"), "{\"episode\":null}");

        // Rewriting replaces the whole document and leaves no temp files.
        write_text_atomic(&path, "{\"episode\":{}}").expect("rewrite");
        assert_eq!(read_to_string(&path).expect("read"), "{\"episode\":{}}");
        let entries = std::fs::read_dir(tempdir.path()).expect("read dir").count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn process_alive_sees_own_process() {
        assert!(process_alive(std::process::id()));
    }
}
