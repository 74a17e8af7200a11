//! Display utilities for progress bars and formatting helpers.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use pb_io::{InstallProgress, ProgressCallback};

type Bars = Arc<Mutex<HashMap<String, ProgressBar>>>;

/// Progress styles used by install/upgrade operations.
pub struct ProgressStyles {
    pub spinner: ProgressStyle,
    pub done: ProgressStyle,
}

impl Default for ProgressStyles {
    fn default() -> Self {
        Self {
            spinner: ProgressStyle::default_spinner()
                .template("    {prefix:<20} {spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            done: ProgressStyle::default_spinner()
                .template("    {prefix:<20} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        }
    }
}

pub fn header(message: impl std::fmt::Display) -> String {
    format!("{} {}", style("==>").cyan().bold(), message)
}

fn bar_key(name: &str, artifact: &str) -> String {
    format!("{name}/{artifact}")
}

/// Render progress events: a spinner per download, a line per milestone.
/// `Detail` events are only shown when `verbose` is set.
pub fn create_progress_callback(
    multi: MultiProgress,
    styles: ProgressStyles,
    verbose: bool,
) -> (Arc<ProgressCallback>, Bars) {
    let bars: Bars = Arc::new(Mutex::new(HashMap::new()));
    let bars_clone = bars.clone();
    let ProgressStyles { spinner, done } = styles;

    let callback: Arc<ProgressCallback> = Arc::new(Box::new(move |event| {
        let mut bars = bars_clone.lock().unwrap_or_else(PoisonError::into_inner);
        let line = |text: String| {
            let _ = multi.println(text);
        };

        match event {
            InstallProgress::Fetching { name } => {
                line(header(format!("Fetching {}", style(&name).bold())));
            }
            InstallProgress::DownloadStarted { name, artifact } => {
                let pb = multi.add(ProgressBar::new_spinner());
                pb.set_style(spinner.clone());
                pb.set_prefix(artifact.clone());
                pb.set_message("downloading...");
                pb.enable_steady_tick(Duration::from_millis(80));
                bars.insert(bar_key(&name, &artifact), pb);
            }
            InstallProgress::DownloadCompleted {
                name,
                artifact,
                bytes,
                cached,
            } => {
                let key = bar_key(&name, &artifact);
                let pb = bars.entry(key).or_insert_with(|| {
                    let pb = multi.add(ProgressBar::new_spinner());
                    pb.set_prefix(artifact.clone());
                    pb
                });
                pb.set_style(done.clone());
                let how = if cached { "cached" } else { "downloaded" };
                pb.finish_with_message(format!(
                    "{} {how} ({})",
                    style("✓").green(),
                    format_bytes(bytes)
                ));
            }
            InstallProgress::Poured { name } => {
                if let Some(pb) = bars.get(&bar_key(&name, &name)) {
                    pb.set_message(format!("{} poured", style("✓").green()));
                }
            }
            InstallProgress::InstallStarted { name, version } => {
                if verbose {
                    line(format!("    Installing {name} {version}"));
                }
            }
            InstallProgress::InstallCompleted { name, version } => {
                line(format!(
                    "    {} {} {}",
                    style("✓").green(),
                    style(&name).bold(),
                    style(&version).dim()
                ));
            }
            InstallProgress::UpgradeCompleted { name, from, to } => {
                line(format!(
                    "    {} {} {} → {}",
                    style("✓").green(),
                    style(&name).bold(),
                    style(&from).red(),
                    style(&to).green()
                ));
            }
            InstallProgress::WouldUpgrade { name, from, to } => {
                line(format!(
                    "    {} {} → {}",
                    style(&name).bold(),
                    style(&from).red(),
                    style(&to).green()
                ));
            }
            InstallProgress::Skipped { name, reason } => {
                line(format!("    {} {}: {reason}", style("→").dim(), name));
            }
            InstallProgress::Detail { name, message } => {
                if verbose {
                    line(format!("    {} {name}: {message}", style("·").dim()));
                }
            }
            InstallProgress::CleanupCompleted {
                name,
                removed,
                bytes_freed,
                dry_run,
            } => {
                let verb = if dry_run { "Would remove" } else { "Removed" };
                let mut text = format!("    {verb} {name} {}", removed.join(", "));
                if !dry_run {
                    text.push_str(&format!(" ({} freed)", format_bytes(bytes_freed)));
                }
                line(style(text).dim().to_string());
            }
        }
    }));

    (callback, bars)
}

/// Finish any remaining progress bars.
pub fn finish_progress_bars(bars: &Bars) {
    let bars = bars.lock().unwrap_or_else(PoisonError::into_inner);
    for pb in bars.values() {
        if !pb.is_finished() {
            pb.finish();
        }
    }
}

/// Format bytes into a human-readable string (e.g., "1.5 GB").
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}
