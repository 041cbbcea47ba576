//! Formatted output helpers for CLI commands.
//!
//! Provides ANSI styling constants, progress bars and the run summary
//! rendering.

use std::time::Duration;

use woodwork_runtime::backend::RunSummary;

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const RED: &str = "\x1b[31m";
pub const YELLOW: &str = "\x1b[33m";
pub const RESET: &str = "\x1b[0m";

const BAR_WIDTH: usize = 20;

/// A horizontal rule of `width` box-drawing characters.
#[must_use]
pub fn rule(width: usize) -> String {
    "\u{2550}".repeat(width)
}

/// Renders `percent` as a fixed-width bar, e.g. `[#####---------------]  25%`.
#[must_use]
pub fn progress_bar(percent: u8) -> String {
    let percent = percent.min(100);
    let filled = usize::from(percent) * BAR_WIDTH / 100;
    format!(
        "[{}{}] {percent:>3}%",
        "#".repeat(filled),
        "-".repeat(BAR_WIDTH - filled)
    )
}

/// Formats a duration as seconds with one decimal, e.g. "1.5s".
#[must_use]
pub fn format_duration(elapsed: Duration) -> String {
    format!("{:.1}s", elapsed.as_secs_f64())
}

/// Human-readable summary lines for a finished run.
#[must_use]
pub fn summary_lines(summary: &RunSummary) -> Vec<String> {
    let mut lines = vec![
        format!("backend:    {}", summary.backend),
        format!("iterations: {}", summary.iterations),
        format!("exit:       {}", summary.exit),
    ];
    if summary.close_failures > 0 {
        lines.push(format!("close failures: {}", summary.close_failures));
    }
    if let Some(stats) = &summary.bus {
        lines.push(format!(
            "bus:        {} emitted, {} delivered, {} retried, {} dead-lettered",
            stats.emitted, stats.delivered, stats.retried, stats.dead_lettered
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use woodwork_runtime::backend::ExitReason;
    use woodwork_runtime::bus::event::BusStats;

    use super::*;

    #[test]
    fn progress_bar_scales_to_width() {
        assert_eq!(progress_bar(0), "[--------------------]   0%");
        assert_eq!(progress_bar(50), "[##########----------]  50%");
        assert_eq!(progress_bar(100), "[####################] 100%");
    }

    #[test]
    fn progress_bar_clamps_overflow() {
        assert_eq!(progress_bar(250), progress_bar(100));
    }

    #[test]
    fn format_duration_uses_one_decimal() {
        assert_eq!(format_duration(Duration::from_millis(1_540)), "1.5s");
    }

    #[test]
    fn summary_includes_bus_counters() {
        let summary = RunSummary {
            backend: "message-bus",
            iterations: 3,
            exit: ExitReason::ExitToken,
            close_failures: 0,
            bus: Some(BusStats {
                emitted: 3,
                delivered: 6,
                retried: 1,
                dead_lettered: 0,
            }),
        };
        let lines = summary_lines(&summary);
        assert_eq!(lines.len(), 4);
        assert!(lines[3].contains("6 delivered"));
        assert!(lines[2].contains("exit token received"));
    }
}
