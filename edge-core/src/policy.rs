//! Access policies: an explicit capability value type.
//!
//! A policy is a list of [`Statement`]s. Evaluation is a pure function of
//! `(action, method, path)`: an explicit `Deny` wins, otherwise any matching
//! `Allow` permits, otherwise the request is implicitly denied.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Enumerated actions a caller can be granted on the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Action {
    /// Forward a request to a backend pool.
    Invoke,
    /// Flush cached responses at the edge.
    InvalidateCache,
    /// Manage long-lived client connections.
    ManageConnections,
}

/// HTTP verb a statement applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[non_exhaustive]
pub enum Verb {
    Get,
    Post,
    Put,
    Patch,
    Head,
    Delete,
    Options,
    /// Wildcard, serialized as `"*"`.
    #[serde(rename = "*")]
    Any,
}

impl Verb {
    /// `true` when this verb covers the request method.
    #[must_use]
    pub fn covers(self, method: &str) -> bool {
        match self {
            Self::Any => true,
            other => method.parse::<Verb>().is_ok_and(|m| m == other),
        }
    }
}

impl FromStr for Verb {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            "*" => Ok(Self::Any),
            other => Err(CoreError::InvalidPolicy { reason: format!("unknown verb '{other}'") }),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Any => "*",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

/// One grant or denial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Statement {
    pub effect: Effect,
    #[serde(default = "default_actions")]
    pub actions: Vec<Action>,
    pub verb: Verb,
    /// Path pattern; `*` matches any run of characters, `/` included.
    pub resource: String,
}

fn default_actions() -> Vec<Action> {
    vec![Action::Invoke]
}

impl Statement {
    #[must_use]
    pub fn allow(verb: Verb, resource: impl Into<String>) -> Self {
        Self {
            effect: Effect::Allow,
            actions: default_actions(),
            verb,
            resource: resource.into(),
        }
    }

    #[must_use]
    pub fn deny(verb: Verb, resource: impl Into<String>) -> Self {
        Self {
            effect: Effect::Deny,
            actions: default_actions(),
            verb,
            resource: resource.into(),
        }
    }

    fn applies(&self, action: Action, method: &str, path: &str) -> bool {
        self.actions.contains(&action)
            && self.verb.covers(method)
            && glob_match(&self.resource, path)
    }
}

/// Capability set granted to a group or caller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessPolicy {
    statements: Vec<Statement>,
}

impl AccessPolicy {
    #[must_use]
    pub fn new(statements: Vec<Statement>) -> Self {
        Self { statements }
    }

    /// Any method on any path.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::new(vec![Statement::allow(Verb::Any, "*")])
    }

    /// Denies everything explicitly, overriding any other grant.
    #[must_use]
    pub fn deny_all() -> Self {
        Self::new(vec![Statement::deny(Verb::Any, "*")])
    }

    #[must_use]
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Decide whether `action` on `method path` is permitted.
    #[must_use]
    pub fn permits(&self, action: Action, method: &str, path: &str) -> bool {
        let mut allowed = false;
        for statement in self.statements.iter().filter(|s| s.applies(action, method, path)) {
            match statement.effect {
                Effect::Deny => return false,
                Effect::Allow => allowed = true,
            }
        }
        allowed
    }

    /// Reject resources that cannot be a path pattern.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidPolicy`] for an empty statement list entry
    /// or a resource that is neither `*` nor starts with `/`.
    pub fn validate(&self) -> Result<(), CoreError> {
        for statement in &self.statements {
            if statement.actions.is_empty() {
                return Err(CoreError::InvalidPolicy {
                    reason: format!("statement on '{}' grants no actions", statement.resource),
                });
            }
            let r = statement.resource.as_str();
            if !(r.starts_with('/') || r.starts_with('*')) {
                return Err(CoreError::InvalidPolicy {
                    reason: format!("resource '{r}' must start with '/' or '*'"),
                });
            }
        }
        Ok(())
    }
}

/// Wildcard match where `*` matches any (possibly empty) run of characters.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            resume = ti;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}
