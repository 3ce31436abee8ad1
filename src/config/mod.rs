//! Assertion and machine specifications.
//!
//! Files are read as HCL or TOML when they carry a `.hcl` or `.toml`
//! extension and as JSON otherwise. Every loader normalizes the parsed spec (default order, default
//! FAIL action, implied auth kinds) and validates it before handing it out,
//! so the engine only ever sees well-formed specs.

mod assertion;
mod machine;

pub use assertion::{Action, Assertion, AssertionGroup, AssertionKind, DEFAULT_ORDER};
pub use machine::{AuthKind, HostKeyPolicy, Machine, MachineAuth, MachineKind, MachineSpec};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;

/// On-disk encoding of a spec file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Toml,
    Hcl,
}

impl Format {
    /// Pick the format from a file extension (`.toml`, `.hcl` or anything else)
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Self::Toml,
            Some(ext) if ext.eq_ignore_ascii_case("hcl") => Self::Hcl,
            _ => Self::Json,
        }
    }

    /// Decode `content` in this format
    pub fn parse<T: DeserializeOwned>(self, content: &str) -> Result<T> {
        match self {
            Self::Json => serde_json::from_str(content).context("Failed to parse JSON"),
            Self::Toml => toml::from_str(content).context("Failed to parse TOML"),
            Self::Hcl => hcl::from_str(content).context("Failed to parse HCL"),
        }
    }
}

/// Accept a single value where a list is expected.
///
/// HCL decodes one `or { ... }` or `auth { ... }` block as an object and
/// repeated blocks as an array.
fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(values) => values,
        OneOrMany::One(value) => vec![value],
    })
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Format::from_path(path)
        .parse(&content)
        .with_context(|| format!("Invalid spec file {}", path.display()))
}
