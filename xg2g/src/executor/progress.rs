//! Parser for ffmpeg's `-progress` key=value stream.
//!
//! ffmpeg writes one `key=value` pair per line and terminates every block
//! with `progress=continue` (or `progress=end` for the last one). A sample
//! is emitted whenever the `progress` key is seen.

use std::time::Duration;

use super::ProgressSample;

/// Incremental parser over progress lines.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressSample,
    finished: bool,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line. Returns a sample when a block is complete.
    pub fn feed(&mut self, line: &str) -> Option<ProgressSample> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            // out_time_ms is microseconds as well, despite the name.
            "out_time_us" | "out_time_ms" => {
                if let Some(us) = parse_micros(value) {
                    self.current.out_time = Duration::from_micros(us);
                }
            }
            "out_time" => {
                if let Some(time) = parse_time(value) {
                    self.current.out_time = time;
                }
            }
            "total_size" => {
                if let Ok(size) = value.parse::<u64>() {
                    self.current.total_size = size;
                }
            }
            "speed" => {
                self.current.speed = parse_speed(value);
            }
            "progress" => {
                if value == "end" {
                    self.finished = true;
                }
                return Some(self.current.clone());
            }
            _ => {}
        }
        None
    }

    /// Whether `progress=end` has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// ffmpeg reports `N/A` or a negative sentinel before the first frame.
fn parse_micros(value: &str) -> Option<u64> {
    let v: i64 = value.parse().ok()?;
    u64::try_from(v).ok()
}

/// Parse `HH:MM:SS.micro`.
pub fn parse_time(value: &str) -> Option<Duration> {
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    let whole = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
    Duration::from_secs(whole).checked_add(Duration::from_secs_f64(seconds))
}

/// Parse `1.02x`; `N/A` yields `None`.
pub fn parse_speed(value: &str) -> Option<f64> {
    let speed: f64 = value.strip_suffix('x')?.trim().parse().ok()?;
    speed.is_finite().then_some(speed)
}
