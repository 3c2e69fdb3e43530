//! Terminal rendering of socket-upload progress as a single indicatif line on stderr.

use indicatif::{ProgressBar, ProgressStyle};
use ratted_core::{ProgressEvent, ProgressSink};

pub fn format_line(event: &ProgressEvent) -> String {
    format!(
        "Uploaded {} / {} bytes ({:.2}%) at {:.2} Mbps ETA: {}",
        event.total_received,
        event.total_size,
        event.percentage,
        event.upload_speed_mbps,
        event.estimated_time
    )
}

fn line_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// Shows the server-reported progress line; the bar is created on the first event.
#[derive(Default)]
pub struct TerminalProgress {
    bar: Option<ProgressBar>,
}

impl TerminalProgress {
    #[cfg(test)]
    fn with_bar(bar: ProgressBar) -> Self {
        Self { bar: Some(bar) }
    }

    fn bar(&mut self) -> &ProgressBar {
        self.bar.get_or_insert_with(|| {
            let bar = ProgressBar::new_spinner();
            bar.set_style(line_style());
            bar
        })
    }
}

impl ProgressSink for TerminalProgress {
    fn on_progress(&mut self, event: &ProgressEvent) {
        let bar = self.bar();
        bar.set_message(format_line(event));
        bar.tick();
    }

    fn on_stream_finished(&mut self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }
}
