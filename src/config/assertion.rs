//! Assertion specs: what must hold on a machine, and what to do when it doesn't.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use super::{Format, read_document};

/// Order given to assertions that do not set one. Lower runs first.
pub const DEFAULT_ORDER: i64 = 1000;

/// Hex digits in an MD5 digest
const MD5_HEX_LEN: usize = 32;

/// A named set of assertions, usually one per file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionGroup {
    pub name: String,
    #[serde(default, rename = "assert")]
    pub assertions: BTreeMap<String, Assertion>,
}

impl AssertionGroup {
    /// Create an empty group
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assertions: BTreeMap::new(),
        }
    }

    /// Add an assertion, replacing any existing one with the same name
    pub fn with(mut self, name: impl Into<String>, assertion: Assertion) -> Self {
        self.assertions.insert(name.into(), assertion);
        self
    }

    /// Load, normalize and validate an assertions file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let group: Self = read_document(path)?;
        group.prepared().with_context(|| format!("Invalid assertions in {}", path.display()))
    }

    /// Parse, normalize and validate assertions from a string
    pub fn parse(content: &str, format: Format) -> Result<Self> {
        format.parse::<Self>(content)?.prepared()
    }

    fn prepared(mut self) -> Result<Self> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Fill in defaults: order 1000 and a FAIL action where none are given
    pub fn normalize(&mut self) {
        for assertion in self.assertions.values_mut() {
            assertion.normalize();
        }
    }

    /// Check every assertion carries the parameters its kind needs
    pub fn validate(&self) -> Result<()> {
        validate_assertions(&self.assertions)
    }
}

fn validate_assertions(assertions: &BTreeMap<String, Assertion>) -> Result<()> {
    for (name, assertion) in assertions {
        if name.trim().is_empty() {
            bail!("name must be specified for an assertion");
        }
        assertion
            .validate()
            .with_context(|| format!("assertion {name:?}"))?;
    }
    Ok(())
}

/// What an assertion checks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AssertionKind {
    /// `exists`: the file can be read
    FileExists,
    /// `!exists`: the file does not exist
    FileAbsent,
    /// `md5_match`: the file's MD5 equals `hash`
    HashEquals,
    /// `file_match`: the file matches the local reference file at `base_path`
    MatchesLocalFile,
    /// `regex_contents_match`: some line of the file matches `regex`
    RegexMatches,
    /// Anything else, kept verbatim for error reporting
    Unknown(String),
}

impl AssertionKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::FileExists => "exists",
            Self::FileAbsent => "!exists",
            Self::HashEquals => "md5_match",
            Self::MatchesLocalFile => "file_match",
            Self::RegexMatches => "regex_contents_match",
            Self::Unknown(kind) => kind,
        }
    }
}

impl From<String> for AssertionKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "exists" => Self::FileExists,
            "!exists" => Self::FileAbsent,
            "md5_match" => Self::HashEquals,
            "file_match" => Self::MatchesLocalFile,
            "regex_contents_match" => Self::RegexMatches,
            _ => Self::Unknown(kind),
        }
    }
}

impl From<AssertionKind> for String {
    fn from(kind: AssertionKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single declarative check of file state on a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub kind: AssertionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    /// Hex-encoded MD5 digest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: String,
    /// Local reference file for `file_match`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub base_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub regex: String,
    /// Remediation, run in sequence when the assertion does not hold
    #[serde(default, rename = "or", deserialize_with = "super::one_or_many")]
    pub actions: Vec<Action>,
}

impl Assertion {
    /// Create an assertion of `kind` against `file_path` with no actions
    pub fn new(kind: AssertionKind, file_path: impl Into<String>) -> Self {
        Self {
            kind,
            order: None,
            file_path: file_path.into(),
            hash: String::new(),
            base_path: String::new(),
            regex: String::new(),
            actions: Vec::new(),
        }
    }

    pub fn file_exists(file_path: impl Into<String>) -> Self {
        Self::new(AssertionKind::FileExists, file_path)
    }

    pub fn file_absent(file_path: impl Into<String>) -> Self {
        Self::new(AssertionKind::FileAbsent, file_path)
    }

    pub fn hash_equals(file_path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            ..Self::new(AssertionKind::HashEquals, file_path)
        }
    }

    pub fn matches_local_file(file_path: impl Into<String>, base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::new(AssertionKind::MatchesLocalFile, file_path)
        }
    }

    pub fn regex_matches(file_path: impl Into<String>, regex: impl Into<String>) -> Self {
        Self {
            regex: regex.into(),
            ..Self::new(AssertionKind::RegexMatches, file_path)
        }
    }

    pub fn with_order(mut self, order: i64) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    /// Order used for sorting; unset means [`DEFAULT_ORDER`]
    pub fn effective_order(&self) -> i64 {
        self.order.unwrap_or(DEFAULT_ORDER)
    }

    /// Apply defaults to this assertion and any nested under its actions
    pub fn normalize(&mut self) {
        if self.order.is_none() {
            self.order = Some(DEFAULT_ORDER);
        }
        if self.actions.is_empty() {
            self.actions.push(Action::Fail);
        }
        for action in &mut self.actions {
            match action {
                Action::Unset => *action = Action::Fail,
                Action::Assert { assertions } => {
                    assertions.values_mut().for_each(Assertion::normalize);
                }
                _ => {}
            }
        }
    }

    /// Check the kind-specific parameters and every action
    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            AssertionKind::FileExists | AssertionKind::FileAbsent => {
                if self.file_path.is_empty() {
                    bail!("file_path must be specified for exists and !exists assertions");
                }
            }
            AssertionKind::HashEquals => {
                if self.hash.is_empty() || self.file_path.is_empty() {
                    bail!("hash/file_path must be specified for md5_match assertions");
                }
                let hash = self.hash.trim();
                if hash.len() != MD5_HEX_LEN || hex::decode(hash).is_err() {
                    bail!("hash must be a {MD5_HEX_LEN}-digit hex MD5 digest for md5_match assertions");
                }
            }
            AssertionKind::MatchesLocalFile => {
                if self.base_path.is_empty() || self.file_path.is_empty() {
                    bail!("base_path/file_path must be specified for file_match assertions");
                }
            }
            AssertionKind::RegexMatches => {
                if self.regex.is_empty() || self.file_path.is_empty() {
                    bail!("regex/file_path must be specified for regex_contents_match assertions");
                }
            }
            AssertionKind::Unknown(kind) => bail!("unsupported assertion type/kind: {kind}"),
        }

        for action in &self.actions {
            action.validate()?;
        }
        Ok(())
    }
}

/// Remediation step run when an assertion does not hold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ActionDocument", into = "ActionDocument")]
pub enum Action {
    /// No kind given; normalized into [`Action::Fail`]
    Unset,
    /// `FAIL`: stop the run
    Fail,
    /// `COPY`: copy a local file onto the target
    CopyFile {
        source_path: String,
        destination_path: String,
    },
    /// `ASSERT`: evaluate a nested set of assertions
    Assert {
        assertions: BTreeMap<String, Assertion>,
    },
    /// Any other kind, kept verbatim for error reporting
    Unrecognised(String),
}

impl Action {
    pub fn copy_file(source_path: impl Into<String>, destination_path: impl Into<String>) -> Self {
        Self::CopyFile {
            source_path: source_path.into(),
            destination_path: destination_path.into(),
        }
    }

    pub fn assert(assertions: impl IntoIterator<Item = (String, Assertion)>) -> Self {
        Self::Assert {
            assertions: assertions.into_iter().collect(),
        }
    }

    /// Kind keyword as written in assertion files
    pub fn kind(&self) -> &str {
        match self {
            Self::Unset => "",
            Self::Fail => "FAIL",
            Self::CopyFile { .. } => "COPY",
            Self::Assert { .. } => "ASSERT",
            Self::Unrecognised(kind) => kind,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Unset | Self::Fail => {}
            Self::CopyFile {
                source_path,
                destination_path,
            } => {
                if source_path.is_empty() || destination_path.is_empty() {
                    bail!("source_path/destination_path must be specified for COPY actions");
                }
            }
            Self::Assert { assertions } => {
                if assertions.is_empty() {
                    bail!("at least one assertion must exist for ASSERT actions");
                }
                validate_assertions(assertions).context("nested ASSERT action")?;
            }
            Self::Unrecognised(kind) => bail!("unsupported action type/kind: {kind}"),
        }
        Ok(())
    }
}

/// Flat on-disk shape of an action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ActionDocument {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    source_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    destination_path: String,
    #[serde(default, rename = "assert", skip_serializing_if = "BTreeMap::is_empty")]
    assertions: BTreeMap<String, Assertion>,
}

impl From<ActionDocument> for Action {
    fn from(doc: ActionDocument) -> Self {
        match doc.action.as_str() {
            "" => Self::Unset,
            "FAIL" => Self::Fail,
            "COPY" => Self::CopyFile {
                source_path: doc.source_path,
                destination_path: doc.destination_path,
            },
            "ASSERT" => Self::Assert {
                assertions: doc.assertions,
            },
            _ => Self::Unrecognised(doc.action),
        }
    }
}

impl From<Action> for ActionDocument {
    fn from(action: Action) -> Self {
        let mut doc = Self {
            action: action.kind().to_string(),
            ..Self::default()
        };
        match action {
            Action::CopyFile {
                source_path,
                destination_path,
            } => {
                doc.source_path = source_path;
                doc.destination_path = destination_path;
            }
            Action::Assert { assertions } => doc.assertions = assertions,
            Action::Unset | Action::Fail | Action::Unrecognised(_) => {}
        }
        doc
    }
}
