//! Primary output channel and progress display.
//!
//! Whether output is interactive is decided once, by the caller, and passed
//! in. Progress is drawn on stderr and hidden in machine mode.

use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::error::Result;
use crate::job::Job;

pub struct Console {
    interactive: bool,
    json: bool,
    out: Box<dyn Write + Send>,
}

impl Console {
    pub fn new(interactive: bool, json: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            interactive: interactive && !json,
            json,
            out,
        }
    }

    /// Console on stdout; interactive when stdout is a terminal and `json`
    /// was not requested.
    pub fn stdout(json: bool) -> Self {
        let interactive = std::io::stdout().is_terminal();
        Self::new(interactive, json, Box::new(std::io::stdout()))
    }

    /// Console writing into a shared in-memory buffer.
    pub fn buffered(interactive: bool, json: bool) -> (Self, Captured) {
        let captured = Captured::default();
        let console = Self::new(interactive, json, Box::new(captured.clone()));
        (console, captured)
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// `--json` was requested.
    pub fn is_json(&self) -> bool {
        self.json
    }

    /// Write without a newline and flush, so tokens appear as they arrive.
    pub fn print(&mut self, text: &str) -> Result<()> {
        self.out.write_all(text.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    pub fn println(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{text}")?;
        self.out.flush()?;
        Ok(())
    }

    /// Pretty-printed JSON followed by a newline.
    pub fn print_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string_pretty(value)?;
        self.println(&text)
    }

    /// Progress display for `job`; hidden unless interactive.
    pub fn progress(&self, job: &Job) -> JobProgress {
        let bar = if self.interactive {
            let bar = ProgressBar::new_spinner();
            bar.set_style(spinner_style());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            ProgressBar::hidden()
        };
        let mut progress = JobProgress { bar, sized: false };
        progress.update(job);
        progress
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Spinner that turns into a bar once the job reports `(current, total)`.
pub struct JobProgress {
    bar: ProgressBar,
    sized: bool,
}

impl JobProgress {
    pub fn update(&mut self, job: &Job) {
        if let Some(progress) = job.progress() {
            if !self.sized {
                self.bar.set_style(bar_style());
                self.sized = true;
            }
            self.bar.set_length(progress.total);
            self.bar.set_position(progress.current.min(progress.total));
        }
        self.bar.set_message(format!("{} {}", job.status.symbol(), job.status));
    }

    pub fn clear(self) {
        self.bar.finish_and_clear();
    }
}

/// Cloneable handle to the bytes a buffered [`Console`] wrote.
#[derive(Debug, Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self
            .0
            .lock()
            .map_err(|_| std::io::Error::other("capture buffer poisoned"))?;
        inner.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes;
    use crate::job::Status;

    #[test]
    fn test_json_forces_machine_mode() {
        let (console, _) = Console::buffered(true, true);
        assert!(!console.is_interactive());
        assert!(console.is_json());

        let (console, _) = Console::buffered(true, false);
        assert!(console.is_interactive());
    }

    #[test]
    fn test_buffered_output() {
        let (mut console, captured) = Console::buffered(false, false);
        console.print("Hel").unwrap();
        console.print("lo").unwrap();
        console.println("").unwrap();
        console.print_json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(captured.contents(), "Hello\n{\n  \"a\": 1\n}\n");
    }

    #[test]
    fn test_hidden_progress_accepts_updates() {
        let (console, captured) = Console::buffered(false, false);
        let mut job = fakes::job("p1", Status::Processing);
        let mut progress = console.progress(&job);
        job.logs = Some(" 50%|█████     | 5/10".to_string());
        progress.update(&job);
        progress.clear();
        assert_eq!(captured.contents(), "");
    }
}
