use std::time::Duration;

use dsopt_client::{ProgressSink, ProgressUpdate};
use indicatif::{ProgressBar, ProgressStyle};

/// Terminal progress bar fed by a run-check.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(run_id: &str) -> Self {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        bar.set_style(style);
        bar.set_prefix(run_id.to_string());
        bar.enable_steady_tick(Duration::from_millis(200));
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn update(&mut self, update: &ProgressUpdate) {
        self.bar.set_position(update.percent.clamp(0.0, 100.0) as u64);
        self.bar.set_message(update.status.clone());
    }

    fn finish(&mut self) {
        self.bar.abandon();
    }
}
