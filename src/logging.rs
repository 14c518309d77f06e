//! env_logger setup for the sidecar: stderr only, local time, target stripping.
//! stdout carries the RPC stream, so nothing here may write to it.

use std::io::Write;

use time::{OffsetDateTime, UtcOffset};
use time::macros::format_description;

const TARGET_PREFIX: &str = "compresso::";

fn short_target(target: &str) -> &str {
    target
        .strip_prefix(TARGET_PREFIX)
        .or_else(|| target.strip_prefix("compresso_core::"))
        .unwrap_or(target)
}

fn default_level() -> log::LevelFilter {
    #[cfg(debug_assertions)]
    {
        log::LevelFilter::Debug
    }
    #[cfg(not(debug_assertions))]
    {
        log::LevelFilter::Info
    }
}

/// `HH:MM:SS` of `now` shifted to `offset`.
fn timestamp(now: OffsetDateTime, offset: UtcOffset) -> String {
    now.to_offset(offset)
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| "??:??:??".into())
}

/// Install the global logger. `RUST_LOG` overrides the default level.
/// Calling it twice is harmless.
///
/// Call before any other thread is spawned: the local offset can only be
/// read while the process is single-threaded on Unix, so it is captured
/// here once and reused for every record.
pub fn init() {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(default_level())
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format(move |buf, record| {
            let ts = timestamp(OffsetDateTime::now_utc(), offset);
            writeln!(
                buf,
                "{ts}  {level:5}  {target}  {message}",
                level = record.level(),
                target = short_target(record.target()),
                message = record.args()
            )
        });
    let _ = builder.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_crate_prefix() {
        assert_eq!(short_target("compresso::batch"), "batch");
        assert_eq!(short_target("compresso_core::fs"), "fs");
        assert_eq!(short_target("tokio::runtime"), "tokio::runtime");
    }

    #[test]
    fn timestamp_uses_the_captured_offset() {
        use time::macros::{datetime, offset};
        let now = datetime!(2026-10-19 23:30:05 UTC);
        assert_eq!(timestamp(now, offset!(+2)), "01:30:05");
        assert_eq!(timestamp(now, offset!(-5:30)), "18:00:05");
        assert_eq!(timestamp(now, UtcOffset::UTC), "23:30:05");
    }

    #[test]
    fn timestamp_is_stable_on_worker_threads() {
        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        let from_worker = std::thread::spawn(move || timestamp(OffsetDateTime::now_utc(), offset))
            .join()
            .unwrap();
        assert_eq!(from_worker.len(), 8);
        assert_ne!(from_worker, "??:??:??");
    }

    #[test]
    fn init_twice_does_not_panic() {
        init();
        init();
        log::debug!(target: "compresso::logging", "logger ready");
    }
}
