//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No services found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(&items) {
                println!("{}", json);
            }
        }
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format milliseconds, switching to seconds past one second
pub fn format_ms(ms: f64) -> String {
    if ms >= 1000.0 {
        format!("{:.2}s", ms / 1000.0)
    } else {
        format!("{:.1}ms", ms)
    }
}

/// Format an allocation; infinity means no pool meets the target
pub fn format_allocation(allocation: f64) -> String {
    if allocation.is_infinite() {
        "unreachable".to_string()
    } else {
        format!("{}", allocation)
    }
}

/// Color an observed response time against its target
pub fn color_response_time(observed_ms: f64, target_ms: f64) -> String {
    let formatted = format_ms(observed_ms);
    if observed_ms <= target_ms {
        formatted.green().to_string()
    } else if observed_ms <= target_ms * 1.5 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ms() {
        assert_eq!(format_ms(96.0), "96.0ms");
        assert_eq!(format_ms(2500.0), "2.50s");
    }

    #[test]
    fn test_format_allocation() {
        assert_eq!(format_allocation(3.0), "3");
        assert_eq!(format_allocation(f64::INFINITY), "unreachable");
    }
}
