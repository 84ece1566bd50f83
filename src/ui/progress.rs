//! Spinners and live pool status with CI fallback

use super::context::UiContext;
use crate::pool::PoolStats;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.is_interactive(),
        }
    }

    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else {
            eprintln!("{} {}", style("...").dim(), message);
        }
    }

    pub fn stop(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.stop(message),
            None => eprintln!("{} {}", style("[OK]").green(), message),
        }
    }

    pub fn stop_error(&mut self, message: &str) {
        match self.spinner.take() {
            Some(spinner) => spinner.error(message),
            None => eprintln!("{} {}", style("[FAIL]").red(), message),
        }
    }
}

/// One-line live view of every pool while `strata pool run` is up
///
/// Plain mode prints a line only when the summary changes.
pub struct PoolMonitor {
    bar: Option<ProgressBar>,
    last: String,
}

impl PoolMonitor {
    pub fn new(ctx: &UiContext) -> Self {
        let bar = ctx.is_interactive().then(|| {
            let bar = ProgressBar::new_spinner();
            let template =
                ProgressStyle::default_spinner().template("  {spinner:.cyan} {msg}  {elapsed:.dim}");
            if let Ok(template) = template {
                bar.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "));
            }
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });
        Self {
            bar,
            last: String::new(),
        }
    }

    pub fn update(&mut self, stats: &[PoolStats]) {
        let line = summarize(stats);
        if line == self.last {
            return;
        }
        match self.bar {
            Some(ref bar) => bar.set_message(line.clone()),
            None => eprintln!("  {} {}", style("[POOL]").cyan(), line),
        }
        self.last = line;
    }

    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

/// `node 2 ready/1 in use (max 5), python 0 ready/0 in use (max 3)`
fn summarize(stats: &[PoolStats]) -> String {
    if stats.is_empty() {
        return "no pools".to_string();
    }
    stats
        .iter()
        .map(|s| {
            let mut part = format!(
                "{} {} ready/{} in use (max {})",
                s.category, s.available, s.acquired, s.max_size
            );
            if s.pending > 0 {
                part.push_str(&format!(", {} pending", s.pending));
            }
            part
        })
        .collect::<Vec<_>>()
        .join(", ")
}
