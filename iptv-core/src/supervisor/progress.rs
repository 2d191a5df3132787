//! Parsing of the transcoder's `-progress pipe:1` output.
//!
//! The stream is a sequence of `key=value` lines grouped into blocks, each
//! block terminated by `progress=continue` or `progress=end`.

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub frame: Option<u64>,
    pub speed: Option<f64>,
    pub drop_frames: Option<u64>,
    pub finished: bool,
}

#[derive(Debug, Default)]
pub struct ProgressParser {
    current: Progress,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line; returns the completed block when the line closes it.
    pub fn feed(&mut self, line: &str) -> Option<Progress> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key.trim() {
            "frame" => self.current.frame = value.parse().ok(),
            "drop_frames" => self.current.drop_frames = value.parse().ok(),
            "speed" => self.current.speed = parse_speed(value),
            "progress" => {
                let mut block = std::mem::take(&mut self.current);
                block.finished = value == "end";
                return Some(block);
            }
            _ => {}
        }
        None
    }
}

/// Parses `1.02x`, ` 0.98x` or `1.5`. `N/A` and negatives yield `None`.
pub fn parse_speed(value: &str) -> Option<f64> {
    let value = value.trim().trim_end_matches('x').trim();
    let speed: f64 = value.parse().ok()?;
    (speed.is_finite() && speed >= 0.0).then_some(speed)
}
