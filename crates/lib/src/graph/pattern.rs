//! Target patterns used to select part of a graph.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::action::Target;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid target pattern `{input}`: {reason}")]
pub struct PatternError {
  pub input: String,
  pub reason: String,
}

/// A pattern matching a set of targets.
///
/// | Pattern        | Matches                                  |
/// |----------------|------------------------------------------|
/// | `//pkg:name`   | exactly that target                      |
/// | `//pkg:all`    | every target in `pkg`                    |
/// | `//pkg:`       | same as `//pkg:all`                      |
/// | `//pkg/...`    | every target in `pkg` or below it        |
/// | `//...`        | every target                             |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPattern {
  Exact(Target),
  Package(String),
  Recursive(String),
}

impl TargetPattern {
  pub fn parse(input: &str) -> Result<Self, PatternError> {
    let err = |reason: &str| PatternError {
      input: input.to_string(),
      reason: reason.to_string(),
    };

    let rest = input.strip_prefix("//").ok_or_else(|| err("must start with `//`"))?;

    if rest == "..." {
      return Ok(TargetPattern::Recursive(String::new()));
    }
    if let Some(prefix) = rest.strip_suffix("/...") {
      if prefix.is_empty() || prefix.contains(':') {
        return Err(err("recursive patterns take a package path"));
      }
      // Validate the package path by parsing a throwaway target in it.
      Target::new(prefix, "_").map_err(|e| err(e.reason))?;
      return Ok(TargetPattern::Recursive(prefix.to_string()));
    }

    if let Some((package, name)) = rest.split_once(':')
      && (name.is_empty() || name == "all")
    {
      Target::new(package, "_").map_err(|e| err(e.reason))?;
      return Ok(TargetPattern::Package(package.to_string()));
    }

    Target::parse(input)
      .map(TargetPattern::Exact)
      .map_err(|e| err(e.reason))
  }

  pub fn matches(&self, target: &Target) -> bool {
    match self {
      TargetPattern::Exact(t) => t == target,
      TargetPattern::Package(package) => target.package() == package,
      TargetPattern::Recursive(prefix) => {
        prefix.is_empty()
          || target.package() == prefix
          || target
            .package()
            .strip_prefix(prefix.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
      }
    }
  }
}

impl fmt::Display for TargetPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TargetPattern::Exact(t) => write!(f, "{}", t),
      TargetPattern::Package(package) => write!(f, "//{}:all", package),
      TargetPattern::Recursive(prefix) if prefix.is_empty() => f.write_str("//..."),
      TargetPattern::Recursive(prefix) => write!(f, "//{}/...", prefix),
    }
  }
}

impl FromStr for TargetPattern {
  type Err = PatternError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    TargetPattern::parse(s)
  }
}
