//! Terminal progress display for update runs
//!
//! Status messages and the byte counter share one line at the bottom,
//! cargo-style; the final line is colored by outcome.

use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::{Duration, Instant};

use crate::updater::UpdateState;

pub struct UploadProgress {
    bar: ProgressBar,
    total_bytes: u64,
    start_time: Instant,
}

impl UploadProgress {
    pub fn new(total_bytes: u64) -> Self {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> ")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            total_bytes,
            start_time: Instant::now(),
        }
    }

    /// Feed one state change from the updater
    pub fn apply(&self, state: &UpdateState) {
        match state {
            UpdateState::Processing(msg) => self.bar.set_message(msg.clone()),
            UpdateState::Updating { sent, total, .. } => {
                self.bar.set_message("Uploading".to_string());
                if *total != self.bar.length().unwrap_or(0) {
                    self.bar.set_length(*total);
                }
                self.bar.set_position((*sent).min(*total));
            }
            UpdateState::Success => self.finish_success(),
            UpdateState::Error(msg) => self.finish_error(msg),
        }
    }

    pub fn finish_success(&self) {
        let elapsed = self.start_time.elapsed();
        let throughput = self.total_bytes as f64 / elapsed.as_secs_f64().max(0.001) / 1024.0;
        self.bar.finish_with_message(format!(
            "{} {:.1} KB in {:.1}s ({:.1} KB/s)",
            "Updated".with(Color::Green).bold(),
            self.total_bytes as f64 / 1024.0,
            elapsed.as_secs_f64(),
            throughput
        ));
    }

    pub fn finish_error(&self, msg: &str) {
        self.bar
            .abandon_with_message(format!("{} {}", "Failed".with(Color::Red).bold(), msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_image_position_is_exact() {
        let total = (1u64 << 24) + 1;
        let progress = UploadProgress::new(total);
        progress.apply(&UpdateState::Updating {
            sent: total,
            total,
            message: String::new(),
        });
        assert_eq!(progress.bar.position(), total);

        progress.apply(&UpdateState::Updating {
            sent: total - 1,
            total,
            message: String::new(),
        });
        assert_eq!(progress.bar.position(), total - 1);
    }
}
