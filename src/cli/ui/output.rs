use console::style;

use crate::ai::SessionSummary;

/// Console output for command results. Log lines go through `tracing`;
/// this is what the user asked for.
pub struct Output {
    quiet: bool,
}

impl Output {
    pub fn new() -> Self {
        Self { quiet: false }
    }

    /// Suppress everything but errors.
    pub fn quiet(quiet: bool) -> Self {
        Self { quiet }
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("✓").green(), message);
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red(), message);
    }

    pub fn warning(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("⚠").yellow(), message);
        }
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("ℹ").blue(), message);
        }
    }

    pub fn section(&self, message: &str) {
        if !self.quiet {
            println!("\n{}", style(message).bold());
            println!("{}", "─".repeat(40));
        }
    }

    pub fn field(&self, label: &str, value: impl std::fmt::Display) {
        if !self.quiet {
            println!("  {:<18} {}", style(label).dim(), value);
        }
    }

    pub fn session(&self, summary: &SessionSummary) {
        self.section("Session");
        self.field("Id", &summary.session_id);
        self.field(
            "Items",
            format!("{}/{}", summary.finished_items, summary.expected_items),
        );
        self.field("Failed attempts", summary.failed_attempts);
        self.field("API calls", summary.api_calls);
        self.field("Cache hits", summary.cache_hits);
        self.field(
            "Tokens",
            format!(
                "{} ({} in, {} out)",
                summary.total_tokens, summary.input_tokens, summary.output_tokens
            ),
        );
        self.field("Avg latency", format!("{:.0}ms", summary.avg_latency_ms));
        self.field(
            "Duration",
            format!("{:.1}s", summary.total_duration_ms as f64 / 1000.0),
        );
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
