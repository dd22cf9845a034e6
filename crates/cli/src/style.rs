//! Shared styling utilities for terminal output.

use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Banner shown before any output of a dry run.
pub fn dry_run_banner() -> String {
    let style = Style::new().yellow().bold();
    style.apply_to("DRY RUN: nothing will be written").to_string()
}

/// Colored label for a planned operation verb.
pub fn verb(verb: &str) -> String {
    let style = match verb {
        "CREATE" | "ADD" => Style::new().green(),
        "UPDATE" | "UPSERT" | "MARK" => Style::new().cyan(),
        "DELETE" | "REMOVE" => Style::new().red(),
        _ => Style::new(),
    };
    style.apply_to(verb).to_string()
}
