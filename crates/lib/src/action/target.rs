//! Stable action identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing a target name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid target `{input}`: {reason}")]
pub struct TargetError {
  pub input: String,
  pub reason: &'static str,
}

/// Fully-qualified identity of an action: `//package:name`.
///
/// Targets are compared by package first, then name, so sorting a set of
/// targets groups them by package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Target {
  package: String,
  name: String,
}

impl Target {
  /// Create a target from its package path and name.
  pub fn new(package: &str, name: &str) -> Result<Self, TargetError> {
    let input = format!("//{}:{}", package, name);
    validate_package(package, &input)?;
    validate_name(name, &input)?;
    Ok(Self {
      package: package.to_string(),
      name: name.to_string(),
    })
  }

  /// Parse `//pkg:name`, or `//pkg` which names the target after the last
  /// package segment (`//foo/bar` is `//foo/bar:bar`).
  pub fn parse(input: &str) -> Result<Self, TargetError> {
    let err = |reason| TargetError {
      input: input.to_string(),
      reason,
    };

    let rest = input.strip_prefix("//").ok_or_else(|| err("must start with `//`"))?;

    match rest.split_once(':') {
      Some((package, name)) => {
        validate_package(package, input)?;
        validate_name(name, input)?;
        Ok(Self {
          package: package.to_string(),
          name: name.to_string(),
        })
      }
      None => {
        if rest.is_empty() {
          return Err(err("missing package and name"));
        }
        validate_package(rest, input)?;
        let name = rest.rsplit('/').next().unwrap_or(rest);
        Ok(Self {
          package: rest.to_string(),
          name: name.to_string(),
        })
      }
    }
  }

  pub fn package(&self) -> &str {
    &self.package
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn fully_qualified_name(&self) -> String {
    self.to_string()
  }
}

fn validate_package(package: &str, input: &str) -> Result<(), TargetError> {
  let err = |reason| TargetError {
    input: input.to_string(),
    reason,
  };

  if package.is_empty() {
    return Ok(());
  }
  if package.chars().any(|c| c.is_whitespace() || c == ':') {
    return Err(err("package contains whitespace or `:`"));
  }
  for segment in package.split('/') {
    match segment {
      "" => return Err(err("package has an empty path segment")),
      "." | ".." | "..." => return Err(err("package has a relative path segment")),
      _ => {}
    }
  }
  Ok(())
}

fn validate_name(name: &str, input: &str) -> Result<(), TargetError> {
  let err = |reason| TargetError {
    input: input.to_string(),
    reason,
  };

  if name.is_empty() {
    return Err(err("name is empty"));
  }
  if name.chars().any(|c| c.is_whitespace() || c == ':') {
    return Err(err("name contains whitespace or `:`"));
  }
  Ok(())
}

impl fmt::Display for Target {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "//{}:{}", self.package, self.name)
  }
}

impl FromStr for Target {
  type Err = TargetError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Target::parse(s)
  }
}

impl TryFrom<String> for Target {
  type Error = TargetError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Target::parse(&value)
  }
}

impl From<Target> for String {
  fn from(target: Target) -> Self {
    target.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_full_form() {
    let t = Target::parse("//lib/core:core_test").unwrap();
    assert_eq!(t.package(), "lib/core");
    assert_eq!(t.name(), "core_test");
    assert_eq!(t.to_string(), "//lib/core:core_test");
  }

  #[test]
  fn parse_short_form_uses_last_segment() {
    let t = Target::parse("//lib/core").unwrap();
    assert_eq!(t, Target::new("lib/core", "core").unwrap());
  }

  #[test]
  fn parse_root_package() {
    let t = Target::parse("//:all_docs").unwrap();
    assert_eq!(t.package(), "");
    assert_eq!(t.to_string(), "//:all_docs");
  }

  #[test]
  fn parse_rejects_malformed() {
    for bad in ["lib:core", "//", "//lib:", "//lib//x:y", "//a/../b:c", "//a b:c", "//a:b:c"] {
      assert!(Target::parse(bad).is_err(), "expected `{}` to be rejected", bad);
    }
  }

  #[test]
  fn ordering_groups_by_package() {
    let mut targets = vec![
      Target::parse("//b:a").unwrap(),
      Target::parse("//a:z").unwrap(),
      Target::parse("//a:b").unwrap(),
    ];
    targets.sort();
    let names: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
    assert_eq!(names, vec!["//a:b", "//a:z", "//b:a"]);
  }

  #[test]
  fn serde_as_string() {
    let t = Target::parse("//app:main").unwrap();
    let json = serde_json::to_string(&t).unwrap();
    assert_eq!(json, "\"//app:main\"");
    let back: Target = serde_json::from_str(&json).unwrap();
    assert_eq!(back, t);

    assert!(serde_json::from_str::<Target>("\"app:main\"").is_err());
  }
}
