//! Subject validation and pattern matching.
//!
//! Subjects are `.`-delimited tokens. Patterns may use `*` to match exactly
//! one token and a trailing `>` to match one or more remaining tokens.
//! Matching is a single left-to-right pass over the tokens.

use crate::error::{Error, Result};
use std::fmt;

/// Matches exactly one token.
pub const WILDCARD_SINGLE: &str = "*";

/// Matches one or more trailing tokens.
pub const WILDCARD_TAIL: &str = ">";

const SEPARATOR: char = '.';

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Literal(String),
    Single,
    Tail,
}

/// A parsed subscription pattern.
#[derive(Clone, PartialEq, Eq)]
pub struct Pattern {
    raw: String,
    tokens: Vec<Token>,
}

impl Pattern {
    /// Parse and validate a pattern.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        let mut saw_tail = false;

        for token in split_tokens(raw)? {
            if saw_tail {
                return Err(Error::InvalidSubject(format!(
                    "{raw}: no token may follow '{WILDCARD_TAIL}'"
                )));
            }
            let parsed = match token {
                WILDCARD_SINGLE => Token::Single,
                WILDCARD_TAIL => {
                    saw_tail = true;
                    Token::Tail
                }
                literal => {
                    if literal.contains(['*', '>']) {
                        return Err(Error::InvalidSubject(format!(
                            "{raw}: wildcard must be a whole token"
                        )));
                    }
                    Token::Literal(literal.to_string())
                }
            };
            tokens.push(parsed);
        }

        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern contains no wildcard.
    pub fn is_literal(&self) -> bool {
        self.tokens.iter().all(|t| matches!(t, Token::Literal(_)))
    }

    /// Check whether a concrete subject matches this pattern.
    pub fn matches(&self, subject: &str) -> bool {
        let mut parts = subject.split(SEPARATOR);

        for token in &self.tokens {
            match token {
                Token::Tail => return parts.next().is_some_and(|p| !p.is_empty()),
                Token::Single => match parts.next() {
                    Some(p) if !p.is_empty() => {}
                    _ => return false,
                },
                Token::Literal(lit) => match parts.next() {
                    Some(p) if p == lit => {}
                    _ => return false,
                },
            }
        }

        parts.next().is_none()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pattern({})", self.raw)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Validate a concrete subject used for publishing.
pub fn validate_subject(subject: &str) -> Result<()> {
    for token in split_tokens(subject)? {
        if token.contains(['*', '>']) {
            return Err(Error::InvalidSubject(format!(
                "{subject}: wildcards are not allowed when publishing"
            )));
        }
    }
    Ok(())
}

/// Validate a single subject token (service names, methods, bucket names).
pub fn validate_token(token: &str) -> Result<()> {
    if token.is_empty()
        || token.contains(SEPARATOR)
        || token.contains(['*', '>'])
        || token.chars().any(char::is_whitespace)
    {
        return Err(Error::InvalidSubject(format!("invalid token {token:?}")));
    }
    Ok(())
}

fn split_tokens(raw: &str) -> Result<Vec<&str>> {
    if raw.is_empty() {
        return Err(Error::InvalidSubject("empty subject".into()));
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(Error::InvalidSubject(format!("{raw:?} contains whitespace")));
    }
    let tokens: Vec<&str> = raw.split(SEPARATOR).collect();
    if tokens.iter().any(|t| t.is_empty()) {
        return Err(Error::InvalidSubject(format!("{raw}: empty token")));
    }
    Ok(tokens)
}
