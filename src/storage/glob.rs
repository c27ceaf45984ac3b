//! Shell-style glob patterns for KEYS.
//!
//! Supported syntax: `*`, `?`, `[abc]`, `[a-z]`, `[^x]` / `[!x]`, `\` escapes
//! and `{alt1,alt2}` alternation groups. Patterns are translated to an
//! anchored `regex::Regex` once and then matched against every key.

use regex::Regex;
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GlobError {
    #[error("unterminated character class")]
    UnterminatedClass,

    #[error("unterminated alternation group")]
    UnterminatedGroup,

    #[error("alternation groups cannot nest")]
    NestedGroup,

    #[error("pattern ends with an escape")]
    TrailingEscape,

    #[error(transparent)]
    Regex(#[from] regex::Error),
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        let regex = Regex::new(&translate(pattern)?)?;
        Ok(Self { regex })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

/// Translate a glob into an anchored regex source string.
fn translate(pattern: &str) -> Result<String, GlobError> {
    let mut regex = String::from("(?s)^");
    let mut in_group = false;
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let escaped = chars.next().ok_or(GlobError::TrailingEscape)?;
                push_literal(&mut regex, escaped);
            }
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => translate_class(&mut chars, &mut regex)?,
            '{' if in_group => return Err(GlobError::NestedGroup),
            '{' => {
                regex.push_str("(?:");
                in_group = true;
            }
            '}' if in_group => {
                regex.push(')');
                in_group = false;
            }
            ',' if in_group => regex.push('|'),
            other => push_literal(&mut regex, other),
        }
    }

    if in_group {
        return Err(GlobError::UnterminatedGroup);
    }
    regex.push('$');
    Ok(regex)
}

/// Translate the body of `[...]`; the opening bracket is already consumed.
fn translate_class(chars: &mut Peekable<Chars<'_>>, regex: &mut String) -> Result<(), GlobError> {
    regex.push('[');
    if matches!(chars.peek(), Some('^') | Some('!')) {
        chars.next();
        regex.push('^');
    }

    let mut empty = true;
    loop {
        match chars.next() {
            None => return Err(GlobError::UnterminatedClass),
            Some(']') if !empty => break,
            Some('\\') => {
                let escaped = chars.next().ok_or(GlobError::TrailingEscape)?;
                push_class_char(regex, escaped);
            }
            Some('-') if !empty && chars.peek().is_some_and(|&c| c != ']') => {
                regex.push('-');
            }
            Some(c) => push_class_char(regex, c),
        }
        empty = false;
    }

    regex.push(']');
    Ok(())
}

fn push_literal(regex: &mut String, c: char) {
    let mut buf = [0u8; 4];
    regex.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

fn push_class_char(regex: &mut String, c: char) {
    if matches!(c, '\\' | '[' | ']' | '^' | '-' | '&' | '~') {
        regex.push('\\');
    }
    regex.push(c);
}
