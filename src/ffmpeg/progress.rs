use regex::Regex;
use std::sync::LazyLock;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration: (\d+):(\d{2}):(\d{2}(?:\.\d+)?)").expect("invalid duration regex")
});
static OUT_TIME_US_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^out_time_(?:ms|us)=(-?\d+)$").expect("invalid time regex"));
static OUT_TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^out_time=(-?\d+):(\d{2}):(\d{2}(?:\.\d+)?)$").expect("invalid out_time regex")
});

/// One meaningful line of `-progress` output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressLine {
    /// Seconds of output encoded so far.
    Elapsed(f64),
    /// `progress=end`: the encoder has flushed its last frame.
    End,
}

/// Parse a single `key=value` line from `-progress -`.
///
/// FFmpeg writes `out_time_ms` in microseconds (the name is historical), so
/// both `out_time_ms` and `out_time_us` are divided by 1e6. Negative or
/// `N/A` timestamps, emitted before the first frame, are ignored.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let line = line.trim();
    if line == "progress=end" {
        return Some(ProgressLine::End);
    }
    if let Some(caps) = OUT_TIME_US_RE.captures(line) {
        let micros: i64 = caps[1].parse().ok()?;
        if micros < 0 {
            return None;
        }
        return Some(ProgressLine::Elapsed(micros as f64 / 1_000_000.0));
    }
    if let Some(caps) = OUT_TIME_RE.captures(line) {
        let secs = hms_to_seconds(&caps[1], &caps[2], &caps[3])?;
        if secs < 0.0 {
            return None;
        }
        return Some(ProgressLine::Elapsed(secs));
    }
    None
}

/// Total duration from the `Duration: HH:MM:SS.xx` banner that `ffmpeg -i`
/// prints to stderr.
pub fn parse_duration_banner(output: &str) -> Option<f64> {
    let caps = DURATION_RE.captures(output)?;
    hms_to_seconds(&caps[1], &caps[2], &caps[3])
}

fn hms_to_seconds(hours: &str, minutes: &str, seconds: &str) -> Option<f64> {
    let hours: f64 = hours.parse().ok()?;
    let minutes: f64 = minutes.parse().ok()?;
    let seconds: f64 = seconds.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
