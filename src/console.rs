//! Terminal front end: progress reporting and credential prompts.

use crate::config::{Assertion, Machine};
use crate::engine::{AssertionResult, Reporter};
use crate::error::{Error, Result};
use crate::target::AuthPrompter;
use crossterm::style::Stylize;
use dialoguer::{Input, Password};
use std::io::{self, Write};
use tracing::warn;

/// Replace spaces so names stay single tokens in the output
pub fn sanitize_name(name: &str) -> String {
    name.replace(' ', "_")
}

/// Line-oriented [`Reporter`] writing coloured status to `W`.
///
/// An assertion's line is opened when it starts and completed with its
/// result. If nested assertions start in between, the open line is closed as
/// `RUNNING` and the final result gets a line of its own.
pub struct ConsoleReporter<W: Write> {
    out: W,
    /// `(group, assertion)` whose line is still open
    pending: Option<(String, String)>,
}

impl ConsoleReporter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out, pending: None }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn close_pending(&mut self) -> io::Result<()> {
        if self.pending.take().is_some() {
            writeln!(self.out, "{}", "RUNNING".yellow())?;
        }
        Ok(())
    }

    fn write_machine(
        &mut self,
        name: &str,
        connected: bool,
        error: Option<&Error>,
    ) -> io::Result<()> {
        self.close_pending()?;
        let name = sanitize_name(name);
        match (connected, error) {
            (_, Some(err)) => writeln!(self.out, "{} ({})", "ERROR".yellow(), err)?,
            (true, None) => writeln!(self.out, "{}", "CONNECTED".green())?,
            (false, None) => write!(self.out, "Connecting to {}: ", name.cyan())?,
        }
        self.out.flush()
    }

    fn write_assertion(
        &mut self,
        group: &str,
        name: &str,
        result: Option<AssertionResult>,
        error: Option<&Error>,
    ) -> io::Result<()> {
        let key = (group.to_string(), name.to_string());
        let Some(result) = result else {
            self.close_pending()?;
            write!(self.out, "{}", label(group, name))?;
            self.pending = Some(key);
            return self.out.flush();
        };

        if self.pending.as_ref() == Some(&key) {
            self.pending = None;
        } else {
            self.close_pending()?;
            write!(self.out, "{}", label(group, name))?;
        }
        match result {
            AssertionResult::Noop => write!(self.out, "{}", result.to_string().green())?,
            AssertionResult::Applied => write!(self.out, "{}", result.to_string().yellow())?,
            AssertionResult::Failed => write!(self.out, "{}", result.to_string().red())?,
            AssertionResult::Error | AssertionResult::ApplyError => {
                write!(self.out, "{}", result.to_string().red())?;
                if let Some(err) = error {
                    write!(self.out, " ({})", err)?;
                }
            }
        }
        writeln!(self.out)?;
        self.out.flush()
    }
}

/// `  group.name: `, indented one level per nested group segment
fn label(group: &str, name: &str) -> String {
    let depth = group.matches('/').count();
    format!(
        "{:indent$}{}.{}: ",
        "",
        sanitize_name(group),
        sanitize_name(name),
        indent = 2 + depth * 2
    )
}

impl<W: Write> Reporter for ConsoleReporter<W> {
    fn machine_status(&mut self, name: &str, _machine: &Machine, connected: bool, error: Option<&Error>) {
        if let Err(e) = self.write_machine(name, connected, error) {
            warn!("Failed to write machine status: {}", e);
        }
    }

    fn assertion_status(
        &mut self,
        group: &str,
        name: &str,
        _assertion: &Assertion,
        result: Option<AssertionResult>,
        error: Option<&Error>,
    ) {
        if let Err(e) = self.write_assertion(group, name, result, error) {
            warn!("Failed to write assertion status: {}", e);
        }
    }
}

/// Prompts for credentials on the controlling terminal
#[derive(Debug, Default)]
pub struct TerminalPrompter;

fn prompt_text(prompt: &str) -> &str {
    prompt.trim_end().trim_end_matches(':')
}

fn prompt_error(err: dialoguer::Error) -> Error {
    Error::Io(io::Error::other(err))
}

impl AuthPrompter for TerminalPrompter {
    fn password(&mut self, prompt: &str) -> Result<String> {
        Password::new()
            .with_prompt(prompt_text(prompt))
            .allow_empty_password(true)
            .interact()
            .map_err(prompt_error)
    }

    fn keyboard_interactive(
        &mut self,
        user: &str,
        instruction: &str,
        questions: &[String],
        echos: &[bool],
    ) -> Result<Vec<String>> {
        if !instruction.is_empty() {
            eprintln!("{} ({})", instruction, user);
        }
        questions
            .iter()
            .enumerate()
            .map(|(i, question)| {
                let text = prompt_text(question);
                if echos.get(i).copied().unwrap_or(false) {
                    Input::<String>::new()
                        .with_prompt(text)
                        .allow_empty(true)
                        .interact_text()
                        .map_err(prompt_error)
                } else {
                    Password::new()
                        .with_prompt(text)
                        .allow_empty_password(true)
                        .interact()
                        .map_err(prompt_error)
                }
            })
            .collect()
    }
}
