//! Output formatting utilities for the CLI.

use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};
use console::StyledObject;
use serde::Serialize;

/// Result of a CLI command, rendered for humans or as JSON.
pub trait CommandOutput: Serialize {
    /// Text shown in a terminal.
    fn to_human(&self) -> String;
    /// JSON form, for `--json`.
    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Print a command result in the selected mode.
pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

/// Create a borderless list table with the given headers.
pub fn list_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h.to_uppercase()).set_alignment(CellAlignment::Left)),
        );
    table
}

/// Render the table with a count header.
pub fn render_list(entity_name: &str, table: &Table, total: usize) -> String {
    if total == 0 {
        return format!("No {entity_name}s found.");
    }
    let noun = if total == 1 {
        entity_name.to_string()
    } else {
        format!("{entity_name}s")
    };
    format!("{} {noun}:\n{table}", console::style(total).bold())
}

/// Color a status value. `console` drops styling when stdout is not a tty.
pub fn style_status(status: &str) -> StyledObject<&str> {
    let styled = console::style(status);
    match status.to_lowercase().as_str() {
        "completed" => styled.green().bold(),
        "running" => styled.yellow(),
        "queued" | "new" => styled.blue(),
        "failed" => styled.red().bold(),
        "stopped" => styled.dim(),
        _ => styled,
    }
}
