//! Deciding whether an assertion holds, and remediating when it doesn't.

use super::{AssertionResult, Evaluation, Scope, actions};
use crate::config::{Assertion, AssertionKind};
use crate::error::{Error, Result};
use crate::paths;
use crate::target::Target;
use md5::{Digest, Md5};
use std::fs::File;
use std::io;
use tracing::debug;

/// Evaluate `assertion` on `target`, running its actions if it does not hold.
///
/// `group` and `name` locate the assertion for nested reporting. The first
/// action that fails stops the sequence: the result is [`AssertionResult::Failed`]
/// for the FAIL sentinel and [`AssertionResult::ApplyError`] for anything else.
pub fn evaluate(
    target: &mut dyn Target,
    group: &str,
    name: &str,
    assertion: &Assertion,
    scope: &mut Scope<'_>,
) -> Evaluation {
    let result = match check(target, assertion) {
        Ok(result) => result,
        Err(err) => return Evaluation::failed(AssertionResult::Error, err),
    };
    if result != AssertionResult::Applied {
        return Evaluation::done(result);
    }

    debug!("{}.{} does not hold on {}, applying actions", group, name, target.name());
    let parent = format!("{group}/{name}");
    for action in &assertion.actions {
        if let Err(err) = actions::dispatch(target, action, &parent, scope) {
            let result = if err.is_assertion_failure() {
                AssertionResult::Failed
            } else {
                AssertionResult::ApplyError
            };
            return Evaluation::failed(result, err);
        }
    }
    Evaluation::done(AssertionResult::Applied)
}

/// Check `assertion` without remediating.
///
/// Returns [`AssertionResult::Noop`] when it holds and
/// [`AssertionResult::Applied`] when it needs remediation.
pub fn check(target: &mut dyn Target, assertion: &Assertion) -> Result<AssertionResult> {
    let holds = match &assertion.kind {
        AssertionKind::FileExists => exists(target, &assertion.file_path)?,
        AssertionKind::FileAbsent => !exists(target, &assertion.file_path)?,
        AssertionKind::HashEquals => {
            let actual = target.hash(&assertion.file_path)?;
            hex::encode(actual).eq_ignore_ascii_case(assertion.hash.trim())
        }
        AssertionKind::MatchesLocalFile => {
            exists(target, &assertion.file_path)? && {
                let expected = local_md5(&assertion.base_path)?;
                target.hash(&assertion.file_path)? == expected
            }
        }
        AssertionKind::RegexMatches => {
            target.contains_pattern(&assertion.file_path, &assertion.regex)?
        }
        AssertionKind::Unknown(kind) => return Err(Error::UnknownAssertionKind(kind.clone())),
    };
    Ok(if holds {
        AssertionResult::Noop
    } else {
        AssertionResult::Applied
    })
}

/// True if `path` can be opened on the target, false if it does not exist
fn exists(target: &mut dyn Target, path: &str) -> Result<bool> {
    match target.open_for_read(path) {
        Ok(_reader) => Ok(true),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err),
    }
}

/// MD5 of a file on the local filesystem, whatever the target is
pub fn local_md5(path: &str) -> Result<Vec<u8>> {
    let mut file = File::open(paths::expand(path)).map_err(|e| Error::from_io(e, path))?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_vec())
}
