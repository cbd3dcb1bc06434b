//! Operator-facing status lines: right-aligned coloured label, then message.

use anstyle::{AnsiColor, Style};
use is_terminal::IsTerminal;
use std::fmt::Display;
use std::io::{self, Write};
use std::time::{Duration, Instant};

const STATUS_WIDTH: usize = 12;

#[derive(Debug, Clone, Copy)]
enum StatusKind {
    Pending,
    Success,
    Info,
    Warn,
    Error,
}

impl StatusKind {
    fn to_stderr(self) -> bool {
        matches!(self, StatusKind::Warn | StatusKind::Error)
    }

    fn style(self) -> Style {
        let color = match self {
            StatusKind::Pending => AnsiColor::Cyan,
            StatusKind::Success => AnsiColor::Green,
            StatusKind::Info => AnsiColor::Blue,
            StatusKind::Warn => AnsiColor::Yellow,
            StatusKind::Error => AnsiColor::Red,
        };
        Style::new().bold().fg_color(Some(color.into()))
    }
}

fn color_enabled(stderr: bool) -> bool {
    let terminal = if stderr {
        io::stderr().is_terminal()
    } else {
        io::stdout().is_terminal()
    };
    terminal && std::env::var_os("NO_COLOR").is_none()
}

fn render(kind: StatusKind, label: &str, message: &str, color: bool) -> String {
    let padded = format!("{label:>STATUS_WIDTH$}");
    let head = if color {
        let style = kind.style();
        format!("{}{padded}{}", style.render(), style.render_reset())
    } else {
        padded
    };

    let mut out = String::new();
    for (idx, line) in message.split('\n').enumerate() {
        if idx == 0 {
            out.push_str(&format!("{head} {line}\n"));
        } else {
            out.push_str(&format!("{:>STATUS_WIDTH$} {line}\n", ""));
        }
    }
    out
}

fn write_status(kind: StatusKind, label: &str, message: &str) {
    let stderr = kind.to_stderr();
    let text = render(kind, label, message, color_enabled(stderr));
    if stderr {
        let mut handle = io::stderr().lock();
        let _ = handle.write_all(text.as_bytes());
        let _ = handle.flush();
    } else {
        let mut handle = io::stdout().lock();
        let _ = handle.write_all(text.as_bytes());
        let _ = handle.flush();
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        match secs % 60 {
            0 => format!("{}m", secs / 60),
            rest => format!("{}m {rest}s", secs / 60),
        }
    } else if duration.as_secs_f64() >= 1.0 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

pub fn status(label: &str, message: impl Display) {
    write_status(StatusKind::Pending, label, &message.to_string());
}

pub fn info(message: impl Display) {
    write_status(StatusKind::Info, "Info", &message.to_string());
}

pub fn warn(message: impl Display) {
    write_status(StatusKind::Warn, "Warning", &message.to_string());
}

pub fn error(message: impl Display) {
    write_status(StatusKind::Error, "Error", &message.to_string());
}

pub fn success(label: &str, message: impl Display) {
    write_status(StatusKind::Success, label, &message.to_string());
}

/// A running step. Reports completion with its elapsed time; dropping it
/// unfinished reports the step as aborted.
pub struct Progress {
    label: String,
    message: String,
    started: Instant,
    complete: bool,
}

impl Progress {
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        let label = label.into();
        let message = message.into();
        write_status(StatusKind::Pending, &label, &message);

        Self {
            label,
            message,
            started: Instant::now(),
            complete: false,
        }
    }

    pub fn success(mut self, detail: Option<String>) {
        self.complete = true;
        let mut combined = self.message.clone();
        if let Some(detail) = detail.filter(|detail| !detail.is_empty()) {
            combined.push(' ');
            combined.push_str(&detail);
        }
        combined.push_str(" in ");
        combined.push_str(&format_duration(self.started.elapsed()));

        write_status(StatusKind::Success, "Finished", &combined);
    }

    pub fn fail(mut self, error: impl Display) {
        self.complete = true;
        let combined = format!(
            "{} after {}: {}",
            self.message,
            format_duration(self.started.elapsed()),
            error
        );
        write_status(StatusKind::Error, &self.label, &combined);
    }

    pub fn skip(mut self, reason: impl Display) {
        self.complete = true;
        let combined = format!("{} ({})", self.message, reason);
        write_status(StatusKind::Info, "Skipped", &combined);
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        if !self.complete {
            let combined = format!("{} (aborted)", self.message);
            write_status(StatusKind::Warn, "Cancelled", &combined);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pads_label() {
        let line = render(StatusKind::Pending, "Build", "make -j4", false);
        assert_eq!(line, "       Build make -j4\n");
    }

    #[test]
    fn test_render_indents_continuation_lines() {
        let text = render(StatusKind::Error, "Error", "first\nsecond", false);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "       Error first");
        assert_eq!(lines[1], format!("{} second", " ".repeat(STATUS_WIDTH)));
    }

    #[test]
    fn test_render_with_color_wraps_label() {
        let text = render(StatusKind::Success, "Finished", "done", true);
        assert!(text.starts_with("\u{1b}["));
        assert!(text.contains("Finished"));
        assert!(text.ends_with(" done\n"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m");
    }
}
