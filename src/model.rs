//! Core data model.
//!
//! A call names a remote function and the shape its return value is decoded
//! into. A target selects minions. A batch spec decides how many of the
//! selected minions may be outstanding at once. A job is one accepted
//! dispatch of a call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::marker::PhantomData;
use std::str::FromStr;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Minion id as reported by the master.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for WorkerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Job id assigned by the master (a "jid").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Call
// ---------------------------------------------------------------------------

/// Positional and keyword arguments of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub positional: Vec<serde_json::Value>,
    pub keyword: serde_json::Map<String, serde_json::Value>,
}

/// A remote function invocation whose per-minion return decodes into `T`.
///
/// Built once by the caller and never mutated afterwards.
pub struct Call<T> {
    function: String,
    args: CallArgs,
    returns: PhantomData<fn() -> T>,
}

impl<T> Call<T> {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: CallArgs::default(),
            returns: PhantomData,
        }
    }

    pub fn arg(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.args.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.keyword.insert(key.into(), value.into());
        self
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &CallArgs {
        &self.args
    }
}

impl<T> Clone for Call<T> {
    fn clone(&self) -> Self {
        Self {
            function: self.function.clone(),
            args: self.args.clone(),
            returns: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Call<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("function", &self.function)
            .field("args", &self.args)
            .field("returns", &std::any::type_name::<T>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Which minions a call is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "expr", rename_all = "snake_case")]
pub enum Target {
    /// Shell-style glob over minion ids (`web*`, `db-?`).
    Glob(String),
    /// Explicit minion ids.
    List(Vec<String>),
    /// Glob and `L@a,b` list terms combined with `and`, `or`, `not`.
    Compound(String),
}

impl Target {
    /// Every minion.
    pub fn all() -> Self {
        Target::Glob("*".to_string())
    }

    pub fn list<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Target::List(ids.into_iter().map(Into::into).collect())
    }

    /// Does this target select `worker`? Fails on malformed compound expressions.
    pub fn matches(&self, worker: &str) -> Result<bool> {
        match self {
            Target::Glob(pattern) => Ok(glob_match(pattern, worker)),
            Target::List(ids) => Ok(ids.iter().any(|id| id == worker)),
            Target::Compound(expr) => {
                let tokens: Vec<&str> = expr.split_whitespace().collect();
                if tokens.is_empty() {
                    return Err(Error::Config("empty compound target".to_string()));
                }
                let mut parser = CompoundParser {
                    tokens: &tokens,
                    pos: 0,
                    worker,
                };
                let matched = parser.or_expr()?;
                if parser.pos != tokens.len() {
                    return Err(Error::Config(format!(
                        "unexpected '{}' in compound target",
                        tokens[parser.pos]
                    )));
                }
                Ok(matched)
            }
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Glob(pattern) => write!(f, "glob:{pattern}"),
            Target::List(ids) => write!(f, "list:{}", ids.join(",")),
            Target::Compound(expr) => write!(f, "compound:{expr}"),
        }
    }
}

/// Precedence: `or` binds loosest, then `and`, then prefix `not`.
struct CompoundParser<'a> {
    tokens: &'a [&'a str],
    pos: usize,
    worker: &'a str,
}

impl<'a> CompoundParser<'a> {
    fn or_expr(&mut self) -> Result<bool> {
        let mut value = self.and_expr()?;
        while self.peek() == Some("or") {
            self.pos += 1;
            let rhs = self.and_expr()?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn and_expr(&mut self) -> Result<bool> {
        let mut value = self.not_expr()?;
        while self.peek() == Some("and") {
            self.pos += 1;
            let rhs = self.not_expr()?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn not_expr(&mut self) -> Result<bool> {
        if self.peek() == Some("not") {
            self.pos += 1;
            return Ok(!self.not_expr()?);
        }
        self.term()
    }

    fn term(&mut self) -> Result<bool> {
        let Some(token) = self.peek() else {
            return Err(Error::Config(
                "compound target ends with an operator".to_string(),
            ));
        };
        if matches!(token, "and" | "or") {
            return Err(Error::Config(format!(
                "operator '{token}' without left operand"
            )));
        }
        self.pos += 1;
        if let Some(list) = token.strip_prefix("L@") {
            return Ok(list.split(',').any(|id| id == self.worker));
        }
        if let Some(pattern) = token.strip_prefix("G@") {
            return Err(Error::Config(format!(
                "grain matching is not supported: G@{pattern}"
            )));
        }
        Ok(glob_match(token, self.worker))
    }

    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }
}

/// Shell-style match supporting `*` and `?` over the whole input.
pub fn glob_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    // Iterative matcher with single backtrack point for the last `*`.
    let (mut p, mut i) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == input[i]) {
            p += 1;
            i += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, i));
            p += 1;
        } else if let Some((sp, si)) = star {
            p = sp + 1;
            i = si + 1;
            star = Some((sp, si + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

/// How the matched minions are split into sequential batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSpec {
    /// One batch holding every matched minion.
    #[default]
    Unbatched,
    /// At most this many minions per batch.
    Amount(usize),
    /// This percentage (1..=100) of the matched minions per batch, rounded up.
    Percent(u8),
}

impl BatchSpec {
    pub fn amount(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("batch size must be at least 1".to_string()));
        }
        Ok(BatchSpec::Amount(size))
    }

    pub fn percent(pct: u8) -> Result<Self> {
        if !(1..=100).contains(&pct) {
            return Err(Error::Config(format!(
                "batch percentage must be within 1..=100, got {pct}"
            )));
        }
        Ok(BatchSpec::Percent(pct))
    }

    /// Number of minions per batch for a fleet of `total` matched minions.
    pub fn batch_size(&self, total: usize) -> usize {
        let size = match *self {
            BatchSpec::Unbatched => total,
            BatchSpec::Amount(n) => n,
            BatchSpec::Percent(pct) => (total * pct as usize).div_ceil(100),
        };
        size.max(1)
    }

    /// Split `workers` into ordered batches, keeping match order.
    pub fn partition(&self, workers: &[WorkerId]) -> Vec<Vec<WorkerId>> {
        if workers.is_empty() {
            return Vec::new();
        }
        workers
            .chunks(self.batch_size(workers.len()))
            .map(<[WorkerId]>::to_vec)
            .collect()
    }
}

impl FromStr for BatchSpec {
    type Err = Error;

    /// Parses the master's batch notation: `"3"` or `"25%"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u8 = pct
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid batch percentage: {s}")))?;
            BatchSpec::percent(pct)
        } else {
            let size: usize = s
                .parse()
                .map_err(|_| Error::Config(format!("invalid batch size: {s}")))?;
            BatchSpec::amount(size)
        }
    }
}

impl std::fmt::Display for BatchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchSpec::Unbatched => write!(f, "unbatched"),
            BatchSpec::Amount(n) => write!(f, "{n}"),
            BatchSpec::Percent(pct) => write!(f, "{pct}%"),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One accepted dispatch. Immutable once returned by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Minions the master actually sent the job to.
    pub workers: Vec<WorkerId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<WorkerId> {
        names.iter().map(|n| WorkerId::from(*n)).collect()
    }

    #[test]
    fn glob_matches_wildcards() {
        assert!(glob_match("*", "minion1"));
        assert!(glob_match("minion?", "minion1"));
        assert!(glob_match("web*-prod", "web12-prod"));
        assert!(!glob_match("web*-prod", "web12-dev"));
        assert!(!glob_match("minion?", "minion10"));
    }

    #[test]
    fn compound_respects_precedence() {
        let target = Target::Compound("web* or db* and not L@db2".to_string());
        assert!(target.matches("web1").unwrap());
        assert!(target.matches("db1").unwrap());
        assert!(!target.matches("db2").unwrap());
        assert!(!target.matches("cache1").unwrap());
    }

    #[test]
    fn compound_list_terms_and_negation() {
        let target = Target::Compound("L@web1,web3 or not web* and not L@db1".to_string());
        assert!(target.matches("web1").unwrap());
        assert!(target.matches("web3").unwrap());
        assert!(!target.matches("web2").unwrap());
        assert!(target.matches("db2").unwrap());
        assert!(!target.matches("db1").unwrap());
        assert!(Target::Compound("G@os:Linux".to_string()).matches("web1").is_err());
        assert!(Target::Compound("and web1".to_string()).matches("web1").is_err());
    }

    #[test]
    fn compound_rejects_dangling_operator() {
        let target = Target::Compound("web* and".to_string());
        assert!(target.matches("web1").is_err());
    }

    #[test]
    fn percent_batches_round_up() {
        let workers = ids(&["a", "b", "c", "d", "e"]);
        let batches = BatchSpec::Percent(30).partition(&workers);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], ids(&["a", "b"]));
        assert_eq!(batches[2], ids(&["e"]));
    }

    #[test]
    fn tiny_percentage_still_makes_progress() {
        let workers = ids(&["a", "b", "c"]);
        assert_eq!(BatchSpec::Percent(1).batch_size(workers.len()), 1);
        assert_eq!(BatchSpec::Percent(1).partition(&workers).len(), 3);
    }

    #[test]
    fn unbatched_is_single_batch() {
        let workers = ids(&["a", "b", "c"]);
        assert_eq!(BatchSpec::Unbatched.partition(&workers), vec![workers]);
        assert!(BatchSpec::Unbatched.partition(&[]).is_empty());
    }

    #[test]
    fn batch_spec_parses_master_notation() {
        assert_eq!("3".parse::<BatchSpec>().unwrap(), BatchSpec::Amount(3));
        assert_eq!("25%".parse::<BatchSpec>().unwrap(), BatchSpec::Percent(25));
        assert!("0".parse::<BatchSpec>().is_err());
        assert!("150%".parse::<BatchSpec>().is_err());
        assert!("lots".parse::<BatchSpec>().is_err());
    }
}
