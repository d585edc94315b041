// Terminal output for dssh: progress banners, host tables, transfer progress

use std::io::{IsTerminal, Write};
use std::sync::Arc;

use colored::*;
use console::measure_text_width;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use crate::executor::{RunSummary, Task};
use crate::output::errors::DsshError;

/// Columns assumed when the terminal size cannot be read
pub const FALLBACK_WIDTH: usize = 80;

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Writes operator-facing progress to stderr (or a caller-supplied writer)
#[derive(Clone)]
pub struct TerminalOutput {
    sink: Sink,
    width: Option<usize>,
    is_tty: bool,
}

impl TerminalOutput {
    pub fn new() -> Self {
        let is_tty = std::io::stderr().is_terminal();

        // Respect NO_COLOR environment variable (https://no-color.org/)
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput {
            sink: Arc::new(Mutex::new(Box::new(std::io::stderr()))),
            width: None,
            is_tty,
        }
    }

    /// Capture output in `writer` at a fixed width, without colors or progress bars
    pub fn with_writer(writer: Box<dyn Write + Send>, width: usize) -> Self {
        TerminalOutput {
            sink: Arc::new(Mutex::new(writer)),
            width: Some(width),
            is_tty: false,
        }
    }

    pub fn width(&self) -> usize {
        self.width.unwrap_or_else(terminal_width)
    }

    fn line(&self, text: impl AsRef<str>) {
        let mut sink = self.sink.lock();
        // Losing a progress line is not worth failing the run over
        let _ = writeln!(sink, "{}", text.as_ref());
        let _ = sink.flush();
    }

    /// `-----> [i / n] user@host:port message <-----` padded to the terminal width
    pub fn print_banner(&self, task: &Task, total: usize) {
        let line = banner_line(
            task.index,
            total,
            &task.target.summary(),
            &task.message,
            self.width(),
        );
        self.line(line.green().bold().to_string());
    }

    pub fn print_task_error(&self, task: &Task, total: usize, err: &DsshError) {
        self.line(format!(
            "{} [{} / {}] {}",
            "[ERROR]".red().bold(),
            task.index + 1,
            total,
            task.target.summary()
        ));
        self.line(err.to_string().trim_end());
    }

    /// Remote exit status is informational only
    pub fn print_exit_status(&self, task: &Task, code: i32) {
        self.line(format!(
            "{} {} exited with status {}",
            "[EXIT]".yellow().bold(),
            task.target.summary(),
            code
        ));
    }

    /// Failed tasks of a run that kept going
    pub fn print_recap(&self, summary: &RunSummary) {
        if !summary.has_failures() {
            return;
        }
        self.line(format!(
            "{} {} of {} tasks failed",
            "RECAP".yellow().bold(),
            summary.failed.len(),
            summary.total
        ));
        for failure in &summary.failed {
            self.line(format!(
                "  {} [{}] {}",
                "-".dimmed(),
                failure.index + 1,
                failure.target
            ));
        }
    }

    /// `src => dest` ahead of a file copy
    pub fn print_transfer(&self, src: &str, dest: &str) {
        self.line(format!("{} {} {}", src, "=>".dimmed(), dest));
    }

    /// Byte progress bar for one file, hidden when not on a terminal
    pub fn transfer_bar(&self, len: u64, name: &str) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .map(|s| s.progress_chars("=>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_prefix(name.to_string());
        pb
    }
}

impl Default for TerminalOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Current terminal width, or [`FALLBACK_WIDTH`]
pub fn terminal_width() -> usize {
    match crossterm::terminal::size() {
        Ok((cols, _)) if cols > 0 => cols as usize,
        _ => FALLBACK_WIDTH,
    }
}

/// Banner text filled with dashes up to the next multiple of `width`
pub fn banner_line(index: usize, total: usize, summary: &str, message: &str, width: usize) -> String {
    let mut text = format!("-----> [{} / {}] {}", index + 1, total, summary);
    if !message.is_empty() {
        text.push(' ');
        text.push_str(message);
    }
    text.push_str(" <-----");

    let width = width.max(1);
    let fill = (width - measure_text_width(&text) % width) % width;
    text.push_str(&"-".repeat(fill));
    text
}

/// Left-aligned columns separated by two spaces
pub fn format_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| measure_text_width(h)).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(measure_text_width(cell));
        }
    }

    let render = |cells: Vec<&str>| -> String {
        let line = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| {
                let pad = width.saturating_sub(measure_text_width(cell));
                format!("{}{}", cell, " ".repeat(pad))
            })
            .collect::<Vec<_>>()
            .join("  ");
        line.trim_end().to_string()
    };

    let mut out = render(headers.to_vec());
    out.push('\n');
    for row in rows {
        out.push_str(&render(row.iter().map(String::as_str).collect()));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_banner_fills_to_width() {
        let line = banner_line(0, 2, "ops@10.0.0.5:22", "", 40);
        assert_eq!(line, "-----> [1 / 2] ops@10.0.0.5:22 <--------");
        assert_eq!(measure_text_width(&line), 40);

        let line = banner_line(1, 2, "ops@10.0.0.5:22", "jump: a@b:22 command: uptime", 40);
        assert!(line.starts_with("-----> [2 / 2] ops@10.0.0.5:22 jump: a@b:22 command: uptime <-----"));
        assert_eq!(measure_text_width(&line) % 40, 0);
    }

    #[test]
    fn test_banner_exact_width_not_padded() {
        let line = banner_line(0, 1, "h", "", 23);
        assert_eq!(line, "-----> [1 / 1] h <-----");
    }

    #[test]
    fn test_format_table() {
        let table = format_table(
            &["NAME", "ADDR"],
            &[
                vec!["web".to_string(), "10.0.0.5".to_string()],
                vec!["database".to_string(), "10.0.0.6".to_string()],
            ],
        );
        assert_eq!(
            table,
            "NAME      ADDR\nweb       10.0.0.5\ndatabase  10.0.0.6\n"
        );
    }
}
