//! Shared test doubles: an in-memory target, a connector handing them out and
//! a reporter that records every event.

#![allow(dead_code)]

use machassert::config::{Assertion, Machine};
use machassert::engine::{AssertionResult, Reporter};
use machassert::error::{Error, Result};
use machassert::target::{AuthPrompter, Connector, FileSink, Target};
use md5::{Digest, Md5};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Write};
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct MemoryState {
    pub files: BTreeMap<String, Vec<u8>>,
    /// Paths whose reads fail with a permission error
    pub broken: BTreeSet<String>,
    pub writes: Vec<String>,
    pub closes: usize,
    pub fail_close: bool,
}

/// Target backed by a shared map of path -> contents.
///
/// Clones share state, so a test keeps one handle while the engine owns another.
#[derive(Debug, Clone)]
pub struct MemoryTarget {
    name: String,
    pub state: Rc<RefCell<MemoryState>>,
}

impl MemoryTarget {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Rc::default(),
        }
    }

    pub fn with_file(self, path: &str, contents: &[u8]) -> Self {
        self.state
            .borrow_mut()
            .files
            .insert(path.to_string(), contents.to_vec());
        self
    }

    pub fn with_broken(self, path: &str) -> Self {
        self.state.borrow_mut().broken.insert(path.to_string());
        self
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.borrow().files.get(path).cloned()
    }

    pub fn closes(&self) -> usize {
        self.state.borrow().closes
    }

    fn contents(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.state.borrow();
        if state.broken.contains(path) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{path}: permission denied"),
            )));
        }
        state.files.get(path).cloned().ok_or_else(|| Error::not_found(path))
    }
}

struct MemorySink {
    state: Rc<RefCell<MemoryState>>,
    path: String,
    buf: Vec<u8>,
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileSink for MemorySink {
    fn finish(self: Box<Self>) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.writes.push(self.path.clone());
        state.files.insert(self.path, self.buf);
        Ok(())
    }
}

impl Target for MemoryTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn open_for_read(&mut self, path: &str) -> Result<Box<dyn Read>> {
        Ok(Box::new(Cursor::new(self.contents(path)?)))
    }

    fn open_for_write(&mut self, path: &str) -> Result<Box<dyn FileSink>> {
        Ok(Box::new(MemorySink {
            state: Rc::clone(&self.state),
            path: path.to_string(),
            buf: Vec::new(),
        }))
    }

    fn hash(&mut self, path: &str) -> Result<Vec<u8>> {
        Ok(Md5::digest(self.contents(path)?).to_vec())
    }

    fn contains_pattern(&mut self, path: &str, pattern: &str) -> Result<bool> {
        let re = regex::Regex::new(pattern).map_err(|e| Error::Io(io::Error::other(e)))?;
        let contents = self.contents(path)?;
        Ok(String::from_utf8_lossy(&contents)
            .lines()
            .any(|line| re.is_match(line)))
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.closes += 1;
        if state.fail_close {
            return Err(Error::Io(io::Error::other("close failed")));
        }
        Ok(())
    }
}

/// Hands out pre-registered [`MemoryTarget`]s by machine name
#[derive(Default)]
pub struct MemoryConnector {
    pub targets: BTreeMap<String, MemoryTarget>,
    pub connected: Vec<String>,
}

impl MemoryConnector {
    pub fn with(mut self, target: MemoryTarget) -> Self {
        self.targets.insert(target.name.clone(), target);
        self
    }
}

impl Connector for MemoryConnector {
    fn connect(
        &mut self,
        name: &str,
        _machine: &Machine,
        _prompter: &mut dyn AuthPrompter,
    ) -> Result<Box<dyn Target>> {
        self.connected.push(name.to_string());
        match self.targets.get(name) {
            Some(target) => Ok(Box::new(target.clone())),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{name}: connection refused"),
            ))),
        }
    }
}

/// Prompter for runs that must never ask for credentials
pub struct NoPrompter;

impl AuthPrompter for NoPrompter {
    fn password(&mut self, _prompt: &str) -> Result<String> {
        panic!("unexpected password prompt")
    }

    fn keyboard_interactive(
        &mut self,
        _user: &str,
        _instruction: &str,
        _questions: &[String],
        _echos: &[bool],
    ) -> Result<Vec<String>> {
        panic!("unexpected keyboard-interactive prompt")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Machine {
        name: String,
        connected: bool,
        error: Option<String>,
    },
    Assertion {
        group: String,
        name: String,
        result: Option<AssertionResult>,
        error: Option<String>,
    },
}

#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<Event>,
}

impl RecordingReporter {
    /// Final results as `(group, name, result)`, in completion order
    pub fn results(&self) -> Vec<(String, String, AssertionResult)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Assertion {
                    group,
                    name,
                    result: Some(result),
                    ..
                } => Some((group.clone(), name.clone(), *result)),
                _ => None,
            })
            .collect()
    }

    /// Assertion names in the order they started
    pub fn started(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Assertion {
                    name, result: None, ..
                } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn machine_status(&mut self, name: &str, _machine: &Machine, connected: bool, error: Option<&Error>) {
        self.events.push(Event::Machine {
            name: name.to_string(),
            connected,
            error: error.map(ToString::to_string),
        });
    }

    fn assertion_status(
        &mut self,
        group: &str,
        name: &str,
        _assertion: &Assertion,
        result: Option<AssertionResult>,
        error: Option<&Error>,
    ) {
        self.events.push(Event::Assertion {
            group: group.to_string(),
            name: name.to_string(),
            result,
            error: error.map(ToString::to_string),
        });
    }
}
