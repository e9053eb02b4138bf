//! Terminal progress for scan runs, rendered with indicatif.
//!
//! [`Progress`] turns the engine's [`ScanEvent`]s into one bar per stage:
//! a spinner while counting, then bars for scanning, cache lookups and
//! classification. [`spawn`] runs it as a task fed by the engine's channel.

use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::engine::{ScanEvent, Stage};

/// Progress renderer.
pub struct Progress {
    multi: MultiProgress,
    current: Option<ProgressBar>,
    quiet: bool,
}

impl Progress {
    /// Create a renderer. A quiet renderer draws nothing.
    ///
    /// ```
    /// use imgtriage::progress::Progress;
    ///
    /// let progress = Progress::new(true);
    /// ```
    #[must_use]
    pub fn new(quiet: bool) -> Self {
        Self {
            multi: MultiProgress::new(),
            current: None,
            quiet,
        }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.green} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg} (ETA: {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█>-")
    }

    fn replace_bar(&mut self, bar: ProgressBar) {
        if let Some(previous) = self.current.take() {
            previous.finish();
        }
        self.current = Some(self.multi.add(bar));
    }

    /// Apply one event.
    pub fn handle(&mut self, event: &ScanEvent) {
        if self.quiet {
            return;
        }
        match event {
            ScanEvent::Stage { stage, provider } => {
                let label = match provider {
                    Some(p) => format!("{p}: {stage}"),
                    None => stage.to_string(),
                };
                match stage {
                    Stage::Idle => {}
                    Stage::Counting => {
                        let bar = ProgressBar::new_spinner();
                        bar.set_style(Self::spinner_style());
                        bar.set_message("Counting files");
                        bar.enable_steady_tick(Duration::from_millis(100));
                        self.replace_bar(bar);
                    }
                    Stage::Scanning | Stage::CacheChecking | Stage::Classifying => {
                        let bar = ProgressBar::new(0);
                        bar.set_style(Self::bar_style());
                        bar.set_message(label);
                        self.replace_bar(bar);
                    }
                    Stage::Done => self.finish(),
                }
            }
            ScanEvent::Scan(snapshot) => {
                if let Some(bar) = &self.current {
                    bar.set_length(snapshot.total as u64);
                    bar.set_position(snapshot.scanned as u64);
                    bar.set_message(format!("{} images", snapshot.images()));
                }
            }
            ScanEvent::CacheCheck {
                checked,
                total,
                cached,
            } => {
                if let Some(bar) = &self.current {
                    bar.set_length(*total as u64);
                    bar.set_position(*checked as u64);
                    bar.set_message(format!("{cached} cached"));
                }
            }
            ScanEvent::Analysis {
                path,
                done,
                total,
                failed,
            } => {
                if let Some(bar) = &self.current {
                    bar.set_length(*total as u64);
                    bar.set_position(*done as u64);
                    let name = truncate_path(&path.to_string_lossy(), 30);
                    if *failed > 0 {
                        bar.set_message(format!("{name} ({failed} failed)"));
                    } else {
                        bar.set_message(name);
                    }
                }
            }
            ScanEvent::PassAborted { provider, reason } => {
                let _ = self
                    .multi
                    .println(format!("{provider} pass aborted: {reason}"));
            }
        }
    }

    /// Finish the current bar.
    pub fn finish(&mut self) {
        if let Some(bar) = self.current.take() {
            bar.finish();
        }
    }
}

/// Render events from a fresh channel on a tokio task.
///
/// The task ends once every sender is dropped.
#[must_use]
pub fn spawn(quiet: bool) -> (UnboundedSender<ScanEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut progress = Progress::new(quiet);
        while let Some(event) = rx.recv().await {
            progress.handle(&event);
        }
        progress.finish();
    });
    (tx, handle)
}

/// Shorten a path for display in the progress bar.
fn truncate_path(path: &str, max_len: usize) -> String {
    if path.chars().count() <= max_len {
        return path.to_string();
    }
    let file_name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let chars: Vec<char> = file_name.chars().collect();
    if chars.len() + 4 > max_len {
        let tail: String = chars[chars.len().saturating_sub(max_len - 3)..]
            .iter()
            .collect();
        return format!("...{tail}");
    }
    format!(".../{file_name}")
}
