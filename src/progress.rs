//! Transfer progress display.
//!
//! A single-line stderr rate meter shown while pack data streams in:
//! humanized byte count, elapsed time, and current throughput, refreshed
//! at most once per second. Active only at normal verbosity when stderr
//! is a terminal; cleared when the transfer finishes.

use std::io::IsTerminal;
use std::time::Instant;

/// Formats a byte count with decimal (divisor 1000) scaling.
#[must_use]
pub fn humanize(bytes: u64) -> String {
    if bytes < 1000 {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in ["kB", "MB", "GB", "TB"] {
        if value < 1000.0 {
            break;
        }
        value /= 1000.0;
        unit = next;
    }
    if value < 10.0 {
        format!("{value:.1}{unit}")
    } else {
        format!("{value:.0}{unit}")
    }
}

/// Once-per-second transfer meter.
#[derive(Debug)]
pub struct RateMeter {
    enabled: bool,
    started: Option<Instant>,
    last: Option<Instant>,
    last_total: u64,
    width: usize,
    drawn: bool,
}

impl RateMeter {
    /// Meter for the given verbosity; silent unless verbosity is exactly
    /// 1 and stderr is a TTY.
    #[must_use]
    pub fn new(verbosity: u8) -> Self {
        Self {
            enabled: verbosity == 1 && std::io::stderr().is_terminal(),
            started: None,
            last: None,
            last_total: 0,
            width: 0,
            drawn: false,
        }
    }

    /// Updates the meter with the total bytes received so far.
    pub fn tick(&mut self, total: u64) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let started = *self.started.get_or_insert(now);

        let secs = match self.last {
            None => 1.0,
            Some(last) => {
                let elapsed = now.duration_since(last).as_secs_f64();
                if elapsed < 1.0 {
                    return;
                }
                elapsed
            }
        };

        let throughput = ((total - self.last_total) as f64 / secs) as u64;
        let elapsed = now.duration_since(started).as_secs() + 1;
        let line = format!(
            "  {} in {}m{:02}s, {}/s now",
            humanize(total),
            elapsed / 60,
            elapsed % 60,
            humanize(throughput)
        );
        eprint!("{:<width$}\r", line, width = self.width);
        self.width = line.len();
        self.drawn = true;
        self.last = Some(now);
        self.last_total = total;
    }

    /// Erases the meter line.
    pub fn finish(&mut self) {
        if self.enabled && self.drawn {
            eprint!("\r\x1b[0K\r");
            self.drawn = false;
        }
    }
}
