//! Parser for Steam `appmanifest_*.acf` files (Valve's KeyValues text format).
//!
//! The format is a nested tree of quoted strings: a key followed by either a
//! quoted value or a `{ ... }` sub-section. We tokenize the whole document and
//! build the tree, then answer field lookups against it, so a missing field
//! comes back as a precise error naming the field rather than a slicing panic.

use std::fmt;

use crate::store::Fingerprint;

/// Parsed identity and version data for one installed app. Transient; only
/// the fingerprint is ever persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    pub app_id: String,
    pub install_dir: String,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    MissingField(&'static str),
    MissingSection(&'static str),
    Syntax(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MissingField(name) => write!(f, "missing field {:?}", name),
            ParseError::MissingSection(name) => write!(f, "missing section {:?}", name),
            ParseError::Syntax(msg) => write!(f, "syntax error: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, PartialEq)]
enum Token {
    Str(String),
    Open,
    Close,
}

#[derive(Debug)]
enum Value {
    Str(String),
    Section(Vec<(String, Value)>),
}

fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => tokens.push(Token::Open),
            '}' => tokens.push(Token::Close),
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => {
                            // KeyValues escapes: \" \\ \n \t
                            match chars.next() {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(other) => s.push(other),
                                None => {
                                    return Err(ParseError::Syntax(
                                        "unterminated string".to_string(),
                                    ))
                                }
                            }
                        }
                        Some(other) => s.push(other),
                        None => {
                            return Err(ParseError::Syntax("unterminated string".to_string()))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '/' if chars.peek() == Some(&'/') => {
                // Line comment
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => {}
            other => {
                return Err(ParseError::Syntax(format!("unexpected character {:?}", other)));
            }
        }
    }

    Ok(tokens)
}

/// Parse key/value pairs until a closing brace (or end of input at the top
/// level, where `expect_close` is false).
fn parse_pairs<I>(tokens: &mut I, expect_close: bool) -> Result<Vec<(String, Value)>, ParseError>
where
    I: Iterator<Item = Token>,
{
    let mut pairs = Vec::new();

    loop {
        let key = match tokens.next() {
            Some(Token::Str(key)) => key,
            Some(Token::Close) if expect_close => return Ok(pairs),
            None if !expect_close => return Ok(pairs),
            Some(tok) => {
                return Err(ParseError::Syntax(format!("expected key, found {:?}", tok)))
            }
            None => return Err(ParseError::Syntax("unexpected end of input".to_string())),
        };

        match tokens.next() {
            Some(Token::Str(value)) => pairs.push((key, Value::Str(value))),
            Some(Token::Open) => {
                let section = parse_pairs(tokens, true)?;
                pairs.push((key, Value::Section(section)));
            }
            Some(Token::Close) => {
                return Err(ParseError::Syntax(format!("key {:?} has no value", key)))
            }
            None => {
                return Err(ParseError::Syntax(format!("key {:?} has no value", key)))
            }
        }
    }
}

/// Depth-first search for the first scalar value under the given label.
/// ACF key casing varies across Steam client versions ("LastUpdated" vs
/// "lastupdated"), so lookups are case-insensitive.
fn find_value<'a>(pairs: &'a [(String, Value)], label: &str) -> Option<&'a str> {
    for (key, value) in pairs {
        match value {
            Value::Str(s) if key.eq_ignore_ascii_case(label) => return Some(s),
            Value::Section(inner) => {
                if let Some(found) = find_value(inner, label) {
                    return Some(found);
                }
            }
            _ => {}
        }
    }
    None
}

/// Depth-first search for the first sub-section under the given label.
fn find_section<'a>(pairs: &'a [(String, Value)], label: &str) -> Option<&'a [(String, Value)]> {
    for (key, value) in pairs {
        if let Value::Section(inner) = value {
            if key.eq_ignore_ascii_case(label) {
                return Some(inner);
            }
            if let Some(found) = find_section(inner, label) {
                return Some(found);
            }
        }
    }
    None
}

fn require<'a>(
    pairs: &'a [(String, Value)],
    label: &'static str,
) -> Result<&'a str, ParseError> {
    find_value(pairs, label).ok_or(ParseError::MissingField(label))
}

/// Parse one appmanifest blob into a record.
///
/// The manifest id comes from the first depot inside the first
/// "InstalledDepots" section. If the file carries more than one such section
/// only the first is consulted; relying on a later duplicate is unsupported.
pub fn parse_manifest(text: &str) -> Result<ManifestRecord, ParseError> {
    let mut tokens = tokenize(text)?.into_iter();
    let root = parse_pairs(&mut tokens, false)?;

    let app_id = require(&root, "appid")?.to_string();
    let install_dir = require(&root, "installdir")?.to_string();
    let build_id = require(&root, "buildid")?.to_string();
    let last_updated = require(&root, "lastupdated")?.to_string();

    let depots =
        find_section(&root, "InstalledDepots").ok_or(ParseError::MissingSection("InstalledDepots"))?;
    let manifest_id = find_value(depots, "manifest")
        .ok_or(ParseError::MissingField("manifest"))?
        .to_string();

    Ok(ManifestRecord {
        app_id,
        install_dir,
        fingerprint: Fingerprint {
            build_id,
            last_updated,
            manifest_id,
        },
    })
}
