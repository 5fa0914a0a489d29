//! Progress reporting for install transactions
//!
//! The installer reports [`ProgressEvent`]s at fetch, stage, commit, link and
//! rollback boundaries. Events are delivered on the caller's thread, so a
//! callback does not need to be `Send`.

use indicatif::{ProgressBar, ProgressStyle};
use std::cell::RefCell;
use std::env;
use std::io::{self, IsTerminal, Write};
use std::time::Instant;

/// Transaction phase an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Fetch,
    Stage,
    Commit,
    Link,
    Rollback,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Fetch => "fetch",
            Phase::Stage => "stage",
            Phase::Commit => "commit",
            Phase::Link => "link",
            Phase::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub package: String,
    pub phase: Phase,
    /// Payload size for fetch events
    pub bytes: Option<u64>,
}

impl ProgressEvent {
    pub fn new(package: impl Into<String>, phase: Phase) -> Self {
        Self {
            package: package.into(),
            phase,
            bytes: None,
        }
    }

    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }
}

pub trait ProgressCallback {
    fn on_event(&self, event: &ProgressEvent);
}

/// Callback that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

impl<F: Fn(&ProgressEvent)> ProgressCallback for F {
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Progress state for terminal indicators
#[derive(Debug, Clone, Copy)]
pub enum ProgressState {
    Off = 0,
    Normal = 2,
    Error = 3,
}

/// Set terminal progress using OSC 9;4
///
/// This works in Ghostty, Windows Terminal, ConEmu, and is gracefully ignored
/// by terminals that don't support it.
pub fn set_terminal_progress(progress: u8, state: ProgressState) {
    let progress = progress.min(100);
    print!("\x1b]9;4;{};{}\x1b\\", state as u8, progress);
    let _ = io::stdout().flush();
}

/// Clear terminal progress
pub fn clear_terminal_progress() {
    set_terminal_progress(0, ProgressState::Off);
}

/// Helper to check if we should show progress indicators
pub fn should_show_progress() -> bool {
    // Don't show if output is not a TTY (piped, redirected)
    if !io::stdout().is_terminal() {
        return false;
    }

    // Don't show if NO_COLOR is set
    env::var("NO_COLOR").is_err()
}

/// Counts finished steps and mirrors the percentage to the terminal
pub struct ProgressManager {
    start_time: Instant,
    total_items: usize,
    current_item: usize,
    native: bool,
}

impl ProgressManager {
    pub fn new(total: usize, native: bool) -> Self {
        let manager = Self {
            start_time: Instant::now(),
            total_items: total,
            current_item: 0,
            native,
        };
        manager.update_terminal_progress();
        manager
    }

    pub fn inc(&mut self) {
        self.current_item += 1;
        self.update_terminal_progress();
    }

    /// Get current progress percentage (0-100)
    pub fn percent(&self) -> u8 {
        if self.total_items == 0 {
            return 0;
        }
        ((self.current_item as f64 / self.total_items as f64) * 100.0).min(100.0) as u8
    }

    /// Format elapsed time as string
    pub fn format_elapsed(&self) -> String {
        let elapsed = self.start_time.elapsed();
        let ms = elapsed.as_millis();
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", elapsed.as_secs_f64())
        }
    }

    pub fn finish_error(&mut self) {
        if self.native {
            set_terminal_progress(100, ProgressState::Error);
            // Keep error state visible
            std::thread::sleep(std::time::Duration::from_millis(200));
            clear_terminal_progress();
            self.native = false;
        }
    }

    fn update_terminal_progress(&self) {
        if self.native {
            set_terminal_progress(self.percent(), ProgressState::Normal);
        }
    }
}

impl Drop for ProgressManager {
    fn drop(&mut self) {
        // Always clean up terminal progress on drop
        if self.native {
            clear_terminal_progress();
        }
    }
}

/// Progress bar for the `keg` CLI.
///
/// One step per staged package and one per committed package.
pub struct IndicatifProgress {
    bar: ProgressBar,
    manager: RefCell<ProgressManager>,
}

impl IndicatifProgress {
    pub fn new(packages: usize) -> Self {
        let visible = should_show_progress();
        let total = packages * 2;
        let bar = if visible {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }

        Self {
            bar,
            manager: RefCell::new(ProgressManager::new(total, visible)),
        }
    }

    pub fn elapsed(&self) -> String {
        self.manager.borrow().format_elapsed()
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    pub fn fail(&self) {
        self.bar.abandon();
        self.manager.borrow_mut().finish_error();
    }
}

impl ProgressCallback for IndicatifProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match event.phase {
            Phase::Fetch => {
                self.bar.set_message(format!("⬇ {}", event.package));
            }
            Phase::Stage | Phase::Commit => {
                self.bar
                    .set_message(format!("{} {}", event.phase.as_str(), event.package));
                self.bar.inc(1);
                self.manager.borrow_mut().inc();
            }
            Phase::Link => {
                self.bar.set_message(format!("🔗 {}", event.package));
            }
            Phase::Rollback => {
                self.bar
                    .println(format!("  rolling back {}", event.package));
            }
        }
    }
}
