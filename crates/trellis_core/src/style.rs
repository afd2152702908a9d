//! Style-string parser
//!
//! Multi-property component attributes use a CSS-declaration-like encoding:
//!
//! ```text
//! width: 2; color: #fff; src: url(data:image/png;base64,...)
//! ```
//!
//! Declarations are separated by `;`, except inside `url(...)`, which is
//! treated as one atomic token so data URIs survive intact. Each declaration
//! splits on its *first* `:` only, since values may contain further colons.
//! Keys are converted from hyphen-case to camelCase.
//!
//! A string with no `:` anywhere is not a declaration list at all; [`parse`]
//! hands it back as [`StyleParse::Plain`] so callers can tell a plain
//! single-property value apart from a malformed multi-property string.

use indexmap::IndexMap;
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag_no_case, take_until},
    character::complete::{char, none_of},
    combinator::{recognize, rest},
    multi::{many0, separated_list0},
    sequence::tuple,
    IResult,
};

/// Result of parsing a style string
#[derive(Clone, Debug, PartialEq)]
pub enum StyleParse {
    /// No declarations found; the original string, untouched
    Plain(String),
    /// Parsed declarations, in source order
    Map(IndexMap<String, String>),
}

impl StyleParse {
    /// Declarations, or `None` for a plain string
    pub fn into_map(self) -> Option<IndexMap<String, String>> {
        match self {
            StyleParse::Map(map) => Some(map),
            StyleParse::Plain(_) => None,
        }
    }
}

/// `url(...)`; an unclosed `url(` swallows the rest of the input
fn url_call(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        tag_no_case("url("),
        alt((recognize(tuple((take_until(")"), char(')')))), rest)),
    )))(input)
}

/// One declaration's raw text, up to the next top-level `;`
fn declaration_text(input: &str) -> IResult<&str, &str> {
    recognize(many0(alt((
        url_call,
        is_not(";uU"),
        recognize(none_of(";")),
    ))))(input)
}

fn declarations(input: &str) -> IResult<&str, Vec<&str>> {
    separated_list0(char(';'), declaration_text)(input)
}

/// Split a style string into its raw declaration chunks
pub fn split_declarations(input: &str) -> Vec<&str> {
    match declarations(input) {
        Ok((_, chunks)) => chunks,
        // Declarations never fail on &str input; keep the whole string as one chunk
        Err(_) => vec![input],
    }
}

/// Parse a style string into key/value declarations
pub fn parse(input: &str) -> StyleParse {
    let mut map = IndexMap::new();

    for chunk in split_declarations(input) {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        match chunk.split_once(':') {
            Some((key, value)) => {
                map.insert(to_camel_case(key.trim()), value.trim().to_string());
            }
            None => {
                map.insert(String::new(), chunk.to_string());
            }
        }
    }

    if map.len() == 1 && map.contains_key("") {
        return StyleParse::Plain(input.to_string());
    }
    StyleParse::Map(map)
}

/// Join declarations back into a style string
pub fn stringify<I, K, V>(declarations: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    declarations
        .into_iter()
        .map(|(k, v)| format!("{}: {}", k.as_ref(), v.as_ref()))
        .collect::<Vec<_>>()
        .join("; ")
}

/// `shadow-map-type` → `shadowMapType`
///
/// Only a hyphen followed by a lowercase ASCII letter is folded.
pub fn to_camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut chars = key.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '-' {
            if let Some(next) = chars.peek().copied() {
                if next.is_ascii_lowercase() {
                    out.push(next.to_ascii_uppercase());
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}
