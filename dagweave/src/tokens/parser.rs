//! Hand-written scanner for `@Alias.path[0].field` references.
//!
//! ```text
//! token    := '@' ident segment*
//! segment  := '.' ident | '[' digit+ ']'
//! ident    := [A-Za-z_] [A-Za-z0-9_-]*      (trailing '-' is not consumed)
//! ```
//!
//! An `@` only opens a token at the start of the text or after a character
//! that is not alphanumeric, so `user@example.com` is left alone. A `.` or
//! `[` that does not start a valid segment ends the token and stays in the
//! surrounding text.

use super::{PathSegment, TokenError, TokenPath};

/// A token found in a string, with its byte range.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
    pub path: TokenPath,
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}

/// Length of the identifier starting at `pos`, or 0.
fn ident_len(bytes: &[u8], pos: usize) -> usize {
    if pos >= bytes.len() || !is_ident_start(bytes[pos]) {
        return 0;
    }
    let mut end = pos + 1;
    while end < bytes.len() && is_ident_char(bytes[end]) {
        end += 1;
    }
    while end > pos + 1 && bytes[end - 1] == b'-' {
        end -= 1;
    }
    end - pos
}

/// Length of a `[digits]` index starting at `pos`, with the parsed index.
fn index_at(bytes: &[u8], pos: usize) -> Option<(usize, usize)> {
    if bytes.get(pos) != Some(&b'[') {
        return None;
    }
    let mut end = pos + 1;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == pos + 1 || bytes.get(end) != Some(&b']') {
        return None;
    }
    // Digits are ASCII, so the slice is valid UTF-8
    let digits = std::str::from_utf8(&bytes[pos + 1..end]).ok()?;
    let index = digits.parse::<usize>().ok()?;
    Some((end + 1 - pos, index))
}

/// Reads as many segments as possible starting at `pos`. Returns the
/// segments and the position after the last one consumed.
fn read_segments(text: &str, mut pos: usize) -> (Vec<PathSegment>, usize) {
    let bytes = text.as_bytes();
    let mut segments = Vec::new();
    loop {
        match bytes.get(pos) {
            Some(b'.') => {
                let len = ident_len(bytes, pos + 1);
                if len == 0 {
                    break;
                }
                segments.push(PathSegment::Field(text[pos + 1..pos + 1 + len].to_string()));
                pos += 1 + len;
            }
            Some(b'[') => match index_at(bytes, pos) {
                Some((len, index)) => {
                    segments.push(PathSegment::Index(index));
                    pos += len;
                }
                None => break,
            },
            _ => break,
        }
    }
    (segments, pos)
}

/// Finds every token in `text`, left to right, without overlap.
pub fn scan(text: &str) -> Vec<TokenSpan> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        if bytes[pos] != b'@' {
            pos += 1;
            continue;
        }
        if pos > 0 && bytes[pos - 1].is_ascii_alphanumeric() {
            pos += 1;
            continue;
        }
        let alias_len = ident_len(bytes, pos + 1);
        if alias_len == 0 {
            pos += 1;
            continue;
        }
        let alias = text[pos + 1..pos + 1 + alias_len].to_string();
        let (segments, end) = read_segments(text, pos + 1 + alias_len);
        spans.push(TokenSpan {
            start: pos,
            end,
            path: TokenPath { alias, segments },
        });
        pos = end;
    }
    spans
}

impl TokenPath {
    /// Parses a complete token such as `@Summarizer.sections[0].text`.
    pub fn parse(token: &str) -> Result<Self, TokenError> {
        let rest = token
            .strip_prefix('@')
            .ok_or_else(|| TokenError::MissingAt(token.to_string()))?;
        let alias_len = ident_len(rest.as_bytes(), 0);
        if alias_len == 0 {
            return Err(TokenError::InvalidAlias(token.to_string()));
        }
        let (segments, end) = read_segments(rest, alias_len);
        if end != rest.len() {
            return Err(TokenError::TrailingInput {
                input: token.to_string(),
                offset: end + 1,
            });
        }
        Ok(Self {
            alias: rest[..alias_len].to_string(),
            segments,
        })
    }

    /// Parses a bare path such as `meta.scores[1]` or `[0].name`.
    pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, TokenError> {
        let bytes = path.as_bytes();
        let (mut segments, start) = match ident_len(bytes, 0) {
            0 => (Vec::new(), 0),
            len => (vec![PathSegment::Field(path[..len].to_string())], len),
        };
        let (rest, end) = read_segments(path, start);
        if end != path.len() {
            return Err(TokenError::TrailingInput {
                input: path.to_string(),
                offset: end,
            });
        }
        segments.extend(rest);
        if segments.is_empty() {
            return Err(TokenError::EmptyPath);
        }
        Ok(segments)
    }
}
