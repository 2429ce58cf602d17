use indicatif::{ProgressBar, ProgressStyle};

/// Receives progress updates from long-running iterations.
pub trait ProgressReporter {
    fn start(&mut self, total: usize);

    /// `position` items are done; `label` describes the current one.
    fn advance(&mut self, position: usize, label: &str);

    fn finish(&mut self);
}

/// Discards all updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn start(&mut self, _total: usize) {}

    fn advance(&mut self, _position: usize, _label: &str) {}

    fn finish(&mut self) {}
}

/// Terminal progress bar.
#[derive(Debug, Default)]
pub struct BarProgress {
    bar: Option<ProgressBar>,
}

impl BarProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for BarProgress {
    fn start(&mut self, total: usize) {
        let pb = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        self.bar = Some(pb);
    }

    fn advance(&mut self, position: usize, label: &str) {
        if let Some(pb) = &self.bar {
            pb.set_position(position as u64);
            pb.set_message(label.to_string());
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_with_message("done");
        }
    }
}
