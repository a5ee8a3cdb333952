//! CLI output formatting

use chrono::Local;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Timestamp prefix for operator-facing status lines
pub fn timestamp() -> String {
    Local::now().format("[%F %T]").to_string()
}

/// Print a timestamped status line
pub fn status(message: &str) {
    println!("{} {}", style(timestamp()).dim(), message);
}

/// Create a progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_bar_length() {
        let bar = create_progress_bar(7);
        assert_eq!(bar.length(), Some(7));
        bar.finish_and_clear();
    }

    #[test]
    fn test_timestamp_shape() {
        let ts = timestamp();
        // [YYYY-MM-DD HH:MM:SS]
        assert!(ts.starts_with('['));
        assert!(ts.ends_with(']'));
        assert_eq!(ts.len(), 21);
    }
}
