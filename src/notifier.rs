//! Progress reporting for a scan.
//!
//! [`Notifier`] switches on one verbosity level:
//! - [`VerbosityLevel::Quiet`] shows a live spinner and a layer progress bar
//!   on stderr; text logs are left to the global logger (warnings only).
//! - [`VerbosityLevel::Info`]/[`VerbosityLevel::Debug`]/[`VerbosityLevel::Trace`]
//!   forward every message to the `log` facade.
//!
//! The binary installs `env_logger` with [`VerbosityLevel::to_log_level`], so
//! the two always agree on what is shown.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::cell::RefCell;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VerbosityLevel {
    Quiet = 0, // Progress UI, no text logs
    Info = 1,
    Debug = 2,
    Trace = 3,
}

impl From<u8> for VerbosityLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => VerbosityLevel::Quiet,
            1 => VerbosityLevel::Info,
            2 => VerbosityLevel::Debug,
            _ => VerbosityLevel::Trace,
        }
    }
}

impl VerbosityLevel {
    pub fn to_log_level(self) -> LevelFilter {
        match self {
            VerbosityLevel::Quiet => LevelFilter::Warn,
            VerbosityLevel::Info => LevelFilter::Info,
            VerbosityLevel::Debug => LevelFilter::Debug,
            VerbosityLevel::Trace => LevelFilter::Trace,
        }
    }
}

pub struct Notifier {
    verbosity: VerbosityLevel,
    multi_progress: Option<MultiProgress>,
    active_spinner: RefCell<Option<ProgressBar>>,
}

impl Notifier {
    pub fn new(verbosity_level: u8) -> Self {
        let verbosity = VerbosityLevel::from(verbosity_level);
        let multi_progress = if verbosity == VerbosityLevel::Quiet {
            Some(MultiProgress::new())
        } else {
            None
        };

        Self {
            verbosity,
            multi_progress,
            active_spinner: RefCell::new(None),
        }
    }

    /// A notifier that only forwards to `log`; used by tests and library
    /// callers that bring their own UI.
    pub fn silent() -> Self {
        Self::new(VerbosityLevel::Info as u8)
    }

    pub fn info(&self, message: &str) {
        match &self.multi_progress {
            Some(multi_progress) => {
                // Lazy initialize spinner on first info call
                if self.active_spinner.borrow().is_none() {
                    let spinner_style = ProgressStyle::default_spinner()
                        .template("{spinner:.green} {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner());
                    let spinner = multi_progress.add(ProgressBar::new_spinner());
                    spinner.set_style(spinner_style);
                    spinner.enable_steady_tick(Duration::from_millis(100));
                    *self.active_spinner.borrow_mut() = Some(spinner);
                }

                if let Some(spinner) = self.active_spinner.borrow().as_ref() {
                    spinner.set_message(message.to_string());
                }
            }
            None => log::info!("{}", message),
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            log::debug!("{}", message);
        }
    }

    pub fn warn(&self, message: &str) {
        log::warn!("{}", message);
    }

    pub fn create_progress_bar(&self, length: u64, message: &str) -> Option<ProgressBar> {
        let multi_progress = self.multi_progress.as_ref()?;
        let progress_style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");

        let progress_bar = multi_progress.add(ProgressBar::new(length));
        progress_bar.set_style(progress_style);
        progress_bar.set_message(message.to_string());
        Some(progress_bar)
    }

    /// Textual progress for the non-quiet modes.
    pub fn progress(&self, current: u64, total: u64, message: &str) {
        if self.verbosity != VerbosityLevel::Quiet {
            log::info!("{}: {}/{}", message, current, total);
        }
    }

    /// Clears the spinner once the scan is over.
    pub fn finish(&self) {
        if let Some(spinner) = self.active_spinner.borrow_mut().take() {
            spinner.finish_and_clear();
        }
    }
}
