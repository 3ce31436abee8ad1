//! Remediation actions.

use super::{Scope, run_assertions};
use crate::config::{Action, Assertion};
use crate::error::{Error, Result};
use crate::paths;
use crate::target::Target;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use tracing::{debug, info};

/// Deepest chain of ASSERT actions the engine will follow
pub const MAX_NESTING_DEPTH: usize = 16;

/// Run one action against `target`.
///
/// `parent` is the `group/assertion` the action belongs to; nested
/// assertions are reported under it.
pub fn dispatch(
    target: &mut dyn Target,
    action: &Action,
    parent: &str,
    scope: &mut Scope<'_>,
) -> Result<()> {
    match action {
        Action::Unset => Ok(()),
        Action::Fail => Err(Error::AssertionsFailed),
        Action::CopyFile {
            source_path,
            destination_path,
        } => copy_file(target, source_path, destination_path),
        Action::Assert { assertions } => assert_nested(target, parent, assertions, scope),
        Action::Unrecognised(kind) => Err(Error::UnrecognisedActionKind(kind.clone())),
    }
}

/// Stream a local file onto the target.
///
/// The source is opened first, so a missing source never touches the
/// destination.
fn copy_file(target: &mut dyn Target, source: &str, destination: &str) -> Result<()> {
    let mut input = File::open(paths::expand(source))?;
    let mut output = target.open_for_write(destination)?;
    let copied = io::copy(&mut input, &mut output)?;
    output.finish()?;
    info!("{}: copied {} ({} bytes) to {}", target.name(), source, copied, destination);
    Ok(())
}

fn assert_nested(
    target: &mut dyn Target,
    parent: &str,
    assertions: &BTreeMap<String, Assertion>,
    scope: &mut Scope<'_>,
) -> Result<()> {
    if scope.depth >= MAX_NESTING_DEPTH {
        return Err(Error::NestingTooDeep(MAX_NESTING_DEPTH));
    }
    debug!("{}: evaluating {} nested assertions", parent, assertions.len());
    scope.depth += 1;
    let outcome = run_assertions(target, parent, assertions, scope);
    scope.depth -= 1;
    outcome
}
