//! Output formatting for sbl-flash (text or json)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text and tables
    #[default]
    Text,
    /// One JSON document per command
    Json,
}

pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Whether progress bars and chatter should be shown
    pub fn interactive(&self) -> bool {
        !self.quiet && !self.is_json()
    }

    pub fn success(&self, msg: &str) {
        if self.interactive() {
            println!("{}", msg.green());
        }
    }

    pub fn info(&self, msg: &str) {
        if self.interactive() {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print rows as a table in text mode
    pub fn table<T: Tabled>(&self, rows: &[T]) {
        if self.is_json() || self.quiet {
            return;
        }
        if rows.is_empty() {
            println!("No data");
        } else {
            println!("{}", Table::new(rows).with(Style::rounded()));
        }
    }

    /// Print the command's result document in json mode
    pub fn json<T: Serialize>(&self, value: &T) {
        if !self.is_json() {
            return;
        }
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => self.error(&format!("Failed to serialize output: {}", e)),
        }
    }
}
