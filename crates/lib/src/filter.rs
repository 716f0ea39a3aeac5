//! Include/exclude filtering for directory copies.
//!
//! The same rules apply to host directory reads, directory mounts and
//! `CopyOutput`, always evaluated against paths relative to the copied root:
//!
//! - a path is excluded if it, or any of its ancestors, matches an exclude
//!   pattern;
//! - otherwise, when include patterns are given, it is kept only if it or an
//!   ancestor matches one of them;
//! - otherwise it is kept.
//!
//! Patterns are globs anchored at the copied root. A trailing `/` restricts a
//! pattern to directories, a leading `./` or `/` is ignored, and `**`
//! crosses path separators (`*` does not).

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
  case_sensitive: true,
  require_literal_separator: true,
  require_literal_leading_dot: false,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
  #[error("invalid pattern {pattern:?}: {message}")]
  InvalidPattern { pattern: String, message: String },
}

/// Include and exclude patterns as written by the caller.
///
/// Part of operation parameters, so it takes part in fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CopyFilter {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub include: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub exclude: Vec<String>,
}

impl CopyFilter {
  pub fn exclude<I, S>(patterns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      include: Vec::new(),
      exclude: patterns.into_iter().map(Into::into).collect(),
    }
  }

  pub fn with_include<I, S>(mut self, patterns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.include = patterns.into_iter().map(Into::into).collect();
    self
  }

  pub fn is_empty(&self) -> bool {
    self.include.is_empty() && self.exclude.is_empty()
  }

  pub fn compile(&self) -> Result<FilterMatcher, FilterError> {
    Ok(FilterMatcher {
      include: compile_rules(&self.include)?,
      exclude: compile_rules(&self.exclude)?,
    })
  }
}

#[derive(Debug, Clone)]
struct Rule {
  pattern: Pattern,
  dir_only: bool,
}

fn compile_rules(patterns: &[String]) -> Result<Vec<Rule>, FilterError> {
  let mut rules = Vec::with_capacity(patterns.len());
  for raw in patterns {
    let mut text = raw.trim();
    while let Some(rest) = text.strip_prefix("./") {
      text = rest;
    }
    let text = text.trim_start_matches('/');
    let dir_only = text.ends_with('/');
    let text = text.trim_end_matches('/');
    if text.is_empty() || text == "." {
      continue;
    }

    let pattern = Pattern::new(text).map_err(|e| FilterError::InvalidPattern {
      pattern: raw.clone(),
      message: e.to_string(),
    })?;
    rules.push(Rule { pattern, dir_only });
  }
  Ok(rules)
}

/// Compiled form of a [`CopyFilter`].
#[derive(Debug, Clone, Default)]
pub struct FilterMatcher {
  include: Vec<Rule>,
  exclude: Vec<Rule>,
}

impl FilterMatcher {
  /// Whether `rel_path` (relative, `/`-separated) survives the filter.
  /// Pass `is_dir` for links that resolve to a directory too, so that
  /// directory-only patterns catch them.
  pub fn allows(&self, rel_path: &str, is_dir: bool) -> bool {
    !self.is_excluded(rel_path, is_dir) && self.is_included(rel_path, is_dir)
  }

  pub fn is_excluded(&self, rel_path: &str, is_dir: bool) -> bool {
    any_rule_matches(&self.exclude, rel_path, is_dir)
  }

  pub fn is_included(&self, rel_path: &str, is_dir: bool) -> bool {
    self.include.is_empty() || any_rule_matches(&self.include, rel_path, is_dir)
  }

  pub fn has_includes(&self) -> bool {
    !self.include.is_empty()
  }
}

fn any_rule_matches(rules: &[Rule], rel_path: &str, is_dir: bool) -> bool {
  if rules.is_empty() {
    return false;
  }

  let rel_path = rel_path.trim_matches('/');
  let mut candidates: Vec<(&str, bool)> = rel_path
    .match_indices('/')
    .map(|(idx, _)| (&rel_path[..idx], true))
    .collect();
  candidates.push((rel_path, is_dir));

  candidates.iter().any(|(candidate, candidate_is_dir)| {
    rules
      .iter()
      .any(|rule| (*candidate_is_dir || !rule.dir_only) && rule.pattern.matches_with(candidate, MATCH_OPTIONS))
  })
}
