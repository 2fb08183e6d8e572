//! Transport subject matching with `*` and `>` wildcards.
//!
//! Subjects are `.`-separated tokens. `*` stands for exactly one token and
//! `>` for one or more trailing tokens; `>` is only valid as the final token.
//! Wildcard subjects are compiled once to an anchored regular expression.

use std::fmt;

use regex::Regex;

/// Errors raised while compiling a subject.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    #[error("subject must not be empty")]
    Empty,
    #[error("subject `{0}` contains an empty token")]
    EmptyToken(String),
    #[error("subject `{0}`: `>` is only valid as the final token")]
    TailWildcardNotLast(String),
    #[error("subject `{subject}` failed to compile: {reason}")]
    Compile { subject: String, reason: String },
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact,
    Wildcard(Regex),
}

/// A compiled subject: either a literal or an anchored wildcard expression.
#[derive(Debug, Clone)]
pub struct Subject {
    raw: String,
    matcher: Matcher,
}

impl Subject {
    /// Compiles `subject`.
    ///
    /// # Errors
    ///
    /// Returns a [`SubjectError`] for empty subjects, empty tokens, or a `>`
    /// that is not the final token.
    pub fn parse(subject: &str) -> Result<Self, SubjectError> {
        if subject.is_empty() {
            return Err(SubjectError::Empty);
        }

        let tokens: Vec<&str> = subject.split('.').collect();
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(SubjectError::EmptyToken(subject.to_string()));
        }

        let last = tokens.len() - 1;
        let mut wildcard = false;
        let mut parts = Vec::with_capacity(tokens.len());
        for (i, token) in tokens.iter().enumerate() {
            match *token {
                "*" => {
                    wildcard = true;
                    parts.push("[^.]+".to_string());
                }
                ">" if i == last => {
                    wildcard = true;
                    parts.push(".+".to_string());
                }
                ">" => return Err(SubjectError::TailWildcardNotLast(subject.to_string())),
                literal => parts.push(regex::escape(literal)),
            }
        }

        let matcher = if wildcard {
            let expr = format!("^{}$", parts.join(r"\."));
            let regex = Regex::new(&expr).map_err(|e| SubjectError::Compile {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
            Matcher::Wildcard(regex)
        } else {
            Matcher::Exact
        };

        Ok(Self {
            raw: subject.to_string(),
            matcher,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self.matcher, Matcher::Wildcard(_))
    }

    /// Returns `true` when the concrete `subject` is selected by `self`.
    #[must_use]
    pub fn matches(&self, subject: &str) -> bool {
        match &self.matcher {
            Matcher::Exact => self.raw == subject,
            Matcher::Wildcard(regex) => regex.is_match(subject),
        }
    }
}

impl PartialEq for Subject {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Subject {}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
