//! Routing keys, binding patterns and topic matching.
//!
//! A routing key is a dot-separated list of segments such as
//! `bolsa.cotacoes.acoes.petr4`. A binding pattern has the same shape but may
//! use two wildcard segments:
//!
//! - `*` matches exactly one segment
//! - `#` matches zero or more segments
//!
//! A pattern matches a key only when the whole key is consumed. Patterns are
//! evaluated independently of each other; there is no precedence.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::error::RoutingKeyError;

/// Longest routing key accepted, in bytes.
pub const MAX_KEY_LEN: usize = 255;

fn is_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn validate_segment(raw: &str, segment: &str) -> Result<(), RoutingKeyError> {
    if segment.is_empty() {
        return Err(RoutingKeyError::EmptySegment {
            key: raw.to_string(),
        });
    }
    match segment.chars().find(|c| !is_segment_char(*c)) {
        Some(ch) => Err(RoutingKeyError::InvalidCharacter {
            segment: segment.to_string(),
            ch,
        }),
        None => Ok(()),
    }
}

fn check_length(raw: &str) -> Result<(), RoutingKeyError> {
    if raw.is_empty() {
        return Err(RoutingKeyError::Empty);
    }
    if raw.len() > MAX_KEY_LEN {
        return Err(RoutingKeyError::TooLong { max: MAX_KEY_LEN });
    }
    Ok(())
}

/// A validated routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey {
    raw: String,
}

impl RoutingKey {
    pub fn parse(raw: &str) -> Result<Self, RoutingKeyError> {
        check_length(raw)?;
        for segment in raw.split('.') {
            validate_segment(raw, segment)?;
        }
        Ok(Self {
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.split('.')
    }

    /// The segment at `index`, if the key is long enough.
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments().nth(index)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = RoutingKeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.raw
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Token {
    Word(String),
    Star,
    Hash,
}

/// A binding pattern, e.g. `bolsa.cotacoes.#` or `bolsa.*.venda.*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BindingPattern {
    raw: String,
    tokens: Vec<Token>,
}

impl BindingPattern {
    pub fn parse(raw: &str) -> Result<Self, RoutingKeyError> {
        check_length(raw)?;
        let mut tokens = Vec::new();
        for segment in raw.split('.') {
            let token = match segment {
                "*" => Token::Star,
                "#" => Token::Hash,
                s if s.contains(['*', '#']) => {
                    return Err(RoutingKeyError::MisplacedWildcard {
                        segment: s.to_string(),
                    });
                }
                s => {
                    validate_segment(raw, s)?;
                    Token::Word(s.to_string())
                }
            };
            // `#.#` matches exactly what `#` matches
            if token == Token::Hash && tokens.last() == Some(&Token::Hash) {
                continue;
            }
            tokens.push(token);
        }
        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the whole of `key` is consumed by this pattern.
    pub fn matches(&self, key: &RoutingKey) -> bool {
        let segments: Vec<&str> = key.segments().collect();
        matches_from(&self.tokens, &segments)
    }
}

/// `reach[j]` holds when the tokens seen so far consume exactly the first
/// `j` segments. One pass per token keeps this O(tokens × segments).
fn matches_from(tokens: &[Token], segments: &[&str]) -> bool {
    let mut reach = vec![false; segments.len() + 1];
    reach[0] = true;

    for token in tokens {
        let mut next = vec![false; segments.len() + 1];
        match token {
            Token::Hash => {
                let mut seen = false;
                for (j, slot) in next.iter_mut().enumerate() {
                    seen |= reach[j];
                    *slot = seen;
                }
            }
            Token::Star => {
                for j in 0..segments.len() {
                    next[j + 1] = reach[j];
                }
            }
            Token::Word(word) => {
                for (j, segment) in segments.iter().enumerate() {
                    next[j + 1] = reach[j] && *segment == word.as_str();
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reach = next;
    }

    reach[segments.len()]
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for BindingPattern {
    type Error = RoutingKeyError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<BindingPattern> for String {
    fn from(pattern: BindingPattern) -> Self {
        pattern.raw
    }
}

/// Association between a queue and a pattern on one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub pattern: BindingPattern,
}

impl Binding {
    pub fn new(queue: &str, pattern: BindingPattern) -> Self {
        Self {
            queue: queue.to_string(),
            pattern,
        }
    }
}

/// Names of the queues with at least one binding matching `key`.
///
/// A queue appears once no matter how many of its bindings match.
pub fn match_bindings<'a>(
    key: &RoutingKey,
    bindings: impl IntoIterator<Item = &'a Binding>,
) -> BTreeSet<String> {
    bindings
        .into_iter()
        .filter(|binding| binding.pattern.matches(key))
        .map(|binding| binding.queue.clone())
        .collect()
}
