//! Assertion engine: applies assertion groups to machines.
//!
//! The [`Executor`] walks machines one at a time: connect, evaluate every
//! group in order, close. Within a group assertions run in
//! [`order::sorted`] order. The first error anywhere stops the whole run
//! after the current connection is closed; nothing is retried or rolled back.
//!
//! Progress is reported through [`Reporter`]; the engine itself never writes
//! to the terminal.

pub mod actions;
pub mod evaluator;
pub mod order;

pub use actions::MAX_NESTING_DEPTH;
pub use evaluator::{check, evaluate};

use crate::config::{Assertion, AssertionGroup, Machine, MachineSpec};
use crate::error::{Error, Result};
use crate::target::{AuthPrompter, BackendConnector, Connector, Target};
use serde::Serialize;
use std::collections::BTreeMap;
use strum::Display;
use tracing::{info, warn};

/// Outcome classification of one assertion evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
pub enum AssertionResult {
    /// Already satisfied, nothing ran
    #[strum(serialize = "OK")]
    Noop,
    /// Not satisfied; remediation ran without error
    #[strum(serialize = "APPLIED")]
    Applied,
    /// Remediation signalled failure (FAIL action)
    #[strum(serialize = "FAILED")]
    Failed,
    /// The assertion could not be evaluated
    #[strum(serialize = "ERR")]
    Error,
    /// Remediation itself failed
    #[strum(serialize = "APPLY_ERR")]
    ApplyError,
}

/// Result of evaluating one assertion, with the error that ended it if any
#[derive(Debug)]
pub struct Evaluation {
    pub result: AssertionResult,
    pub error: Option<Error>,
}

impl Evaluation {
    fn done(result: AssertionResult) -> Self {
        Self {
            result,
            error: None,
        }
    }

    fn failed(result: AssertionResult, error: Error) -> Self {
        Self {
            result,
            error: Some(error),
        }
    }

    /// The result, or the error that ended the evaluation
    pub fn into_result(self) -> Result<AssertionResult> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

/// Receives progress from the engine
pub trait Reporter {
    /// Called before (`connected = false`, no error) and after each connection attempt
    fn machine_status(&mut self, name: &str, machine: &Machine, connected: bool, error: Option<&Error>);

    /// Called before evaluation with `result = None`, and after with the final outcome
    fn assertion_status(
        &mut self,
        group: &str,
        name: &str,
        assertion: &Assertion,
        result: Option<AssertionResult>,
        error: Option<&Error>,
    );
}

/// State threaded through one machine's evaluation
pub struct Scope<'r> {
    reporter: &'r mut dyn Reporter,
    /// Current ASSERT nesting level, 0 at the top of a group
    depth: usize,
}

impl<'r> Scope<'r> {
    pub fn new(reporter: &'r mut dyn Reporter) -> Self {
        Self { reporter, depth: 0 }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Evaluate `assertions` in order, stopping at the first error
pub fn run_assertions(
    target: &mut dyn Target,
    group: &str,
    assertions: &BTreeMap<String, Assertion>,
    scope: &mut Scope<'_>,
) -> Result<()> {
    for (name, assertion) in order::sorted(assertions) {
        scope
            .reporter
            .assertion_status(group, name, assertion, None, None);
        let evaluation = evaluate(target, group, name, assertion, scope);
        scope.reporter.assertion_status(
            group,
            name,
            assertion,
            Some(evaluation.result),
            evaluation.error.as_ref(),
        );
        if let Some(err) = evaluation.error {
            return Err(err);
        }
    }
    Ok(())
}

/// Applies assertion groups to every machine of a spec
#[derive(Debug, Clone)]
pub struct Executor {
    machines: MachineSpec,
    groups: Vec<AssertionGroup>,
}

impl Executor {
    pub fn new(machines: MachineSpec, groups: Vec<AssertionGroup>) -> Self {
        Self { machines, groups }
    }

    pub fn machines(&self) -> &MachineSpec {
        &self.machines
    }

    pub fn groups(&self) -> &[AssertionGroup] {
        &self.groups
    }

    /// Run against real backends: local host or SSH
    pub fn run(&self, reporter: &mut dyn Reporter, prompter: &mut dyn AuthPrompter) -> Result<()> {
        self.run_with(&mut BackendConnector, reporter, prompter)
    }

    /// Run, opening targets through `connector`
    pub fn run_with(
        &self,
        connector: &mut dyn Connector,
        reporter: &mut dyn Reporter,
        prompter: &mut dyn AuthPrompter,
    ) -> Result<()> {
        info!(
            "Running {} assertion group(s) against {} machine(s) of {:?}",
            self.groups.len(),
            self.machines.machines.len(),
            self.machines.name
        );

        for (name, machine) in &self.machines.machines {
            reporter.machine_status(name, machine, false, None);
            let connection = connector.connect(name, machine, prompter);
            reporter.machine_status(name, machine, connection.is_ok(), connection.as_ref().err());
            let mut target = connection?;

            let outcome = self.run_machine(target.as_mut(), reporter);
            let closed = target.close();
            if let Err(err) = outcome {
                if let Err(close_err) = closed {
                    warn!("{}: close after error failed: {}", name, close_err);
                }
                return Err(err);
            }
            closed?;
            info!("{}: all assertions hold", name);
        }
        Ok(())
    }

    fn run_machine(&self, target: &mut dyn Target, reporter: &mut dyn Reporter) -> Result<()> {
        let mut scope = Scope::new(reporter);
        for group in &self.groups {
            run_assertions(target, &group.name, &group.assertions, &mut scope)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_labels() {
        assert_eq!(AssertionResult::Noop.to_string(), "OK");
        assert_eq!(AssertionResult::Applied.to_string(), "APPLIED");
        assert_eq!(AssertionResult::Failed.to_string(), "FAILED");
        assert_eq!(AssertionResult::Error.to_string(), "ERR");
        assert_eq!(AssertionResult::ApplyError.to_string(), "APPLY_ERR");
    }

    #[test]
    fn test_evaluation_into_result() {
        assert_eq!(
            Evaluation::done(AssertionResult::Noop).into_result().unwrap(),
            AssertionResult::Noop
        );
        let err = Evaluation::failed(AssertionResult::Failed, Error::AssertionsFailed)
            .into_result()
            .unwrap_err();
        assert!(err.is_assertion_failure());
    }
}
