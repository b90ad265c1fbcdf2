//! `name=value` directive lists used by DIGEST-MD5 challenges and responses
//! (RFC 2831 §7.1): comma separated, values either tokens or quoted strings
//! with backslash escapes, empty list elements allowed.

use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    #[error("directive at offset {0} has no name")]
    EmptyName(usize),
    #[error("directive {0:?} has no '=' separator")]
    MissingEquals(String),
    #[error("unterminated quoted string in directive {0:?}")]
    UnterminatedQuote(String),
    #[error("unexpected character {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("directive {0:?} appears more than once")]
    Duplicate(String),
}

/// Parsed directives in input order. Names are lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    entries: Vec<(String, String)>,
}

impl Directives {
    /// Parses a directive list, rejecting duplicated names.
    ///
    /// # Errors
    ///
    /// Returns `DirectiveError` describing the first structural problem.
    pub fn parse(input: &str) -> Result<Self, DirectiveError> {
        let mut entries: Vec<(String, String)> = Vec::new();
        let mut chars = input.char_indices().peekable();

        loop {
            // Skip separators and whitespace between elements.
            while let Some(&(_, c)) = chars.peek() {
                if c == ',' || c.is_ascii_whitespace() {
                    chars.next();
                } else {
                    break;
                }
            }
            let Some(&(start, _)) = chars.peek() else {
                break;
            };

            let mut name = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c == '=' || c == ',' || c.is_ascii_whitespace() {
                    break;
                }
                name.push(c.to_ascii_lowercase());
                chars.next();
            }
            if name.is_empty() {
                return Err(DirectiveError::EmptyName(start));
            }

            while chars.peek().is_some_and(|&(_, c)| c.is_ascii_whitespace()) {
                chars.next();
            }
            if chars.next_if(|&(_, c)| c == '=').is_none() {
                return Err(DirectiveError::MissingEquals(name));
            }
            while chars.peek().is_some_and(|&(_, c)| c.is_ascii_whitespace()) {
                chars.next();
            }

            let mut value = String::new();
            if chars.next_if(|&(_, c)| c == '"').is_some() {
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(DirectiveError::UnterminatedQuote(name));
                }
                while chars.peek().is_some_and(|&(_, c)| c.is_ascii_whitespace()) {
                    chars.next();
                }
                if let Some(&(offset, found)) = chars.peek() {
                    if found != ',' {
                        return Err(DirectiveError::Unexpected { found, offset });
                    }
                }
            } else {
                while let Some(&(offset, c)) = chars.peek() {
                    if c == ',' {
                        break;
                    }
                    if c == '"' {
                        return Err(DirectiveError::Unexpected { found: c, offset });
                    }
                    value.push(c);
                    chars.next();
                }
                value.truncate(value.trim_end().len());
            }

            if entries.iter().any(|(existing, _)| *existing == name) {
                return Err(DirectiveError::Duplicate(name));
            }
            entries.push((name, value));
        }

        Ok(Self { entries })
    }

    /// Value of `name` (lower-case).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Appends `name="value"` with quotes and backslashes escaped.
pub(crate) fn push_quoted(out: &mut String, name: &str, value: &str) {
    if !out.is_empty() {
        out.push(',');
    }
    let _ = write!(out, "{name}=\"");
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}

/// Appends `name=value` with no quoting.
pub(crate) fn push_token(out: &mut String, name: &str, value: &str) {
    if !out.is_empty() {
        out.push(',');
    }
    let _ = write!(out, "{name}={value}");
}
