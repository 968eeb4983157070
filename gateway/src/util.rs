//! The `$util` namespace available to mapping templates.

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};

/// Characters `encodeURI` leaves alone besides ASCII alphanumerics.
const URI_KEEP: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b';')
    .remove(b',')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'#');

/// Bytes `decodeURI` refuses to decode, leaving their escape in place.
const URI_RESERVED: &[u8] = b";/?:@&=+$,#";

/// Standard alphabet, padding optional on decode.
const BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, thiserror::Error)]
pub enum UtilError {
    #[error("URI malformed: {0}")]
    MalformedUri(String),
    #[error("invalid base64 input: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// The `$util` object. Stateless; methods are dispatched by name from templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct Util;

impl Util {
    /// Call `$util.<name>(args...)`. `None` means no such function.
    pub fn call(&self, name: &str, args: &[Value]) -> Option<Result<Value, UtilError>> {
        let arg = args.first().unwrap_or(&Value::Null);
        let result = match name {
            "escapeJavaScript" => Ok(Value::String(escape_javascript(arg))),
            "urlEncode" => Ok(Value::String(url_encode(&as_text(arg)))),
            "urlDecode" => url_decode(&as_text(arg)).map(Value::String),
            "base64Encode" => Ok(Value::String(base64_encode(&as_text(arg)))),
            "base64Decode" => base64_decode(&as_text(arg)).map(Value::String),
            "parseJson" => parse_json(&as_text(arg)),
            _ => return None,
        };
        Some(result)
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Escape a value for embedding in a quoted string inside a template.
///
/// Strings escape backslashes, quotes, carriage returns and U+2028/U+2029. Newlines are kept as
/// real newlines, and the two-character sequence `\n` is read as a newline too. Objects (and
/// arrays, keyed by index) are escaped value by value and returned as JSON text.
pub fn escape_javascript(value: &Value) -> String {
    match value {
        Value::String(s) => escape_javascript_str(s),
        Value::Null => String::new(),
        Value::Object(map) => {
            let escaped: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(escape_javascript(v))))
                .collect();
            Value::Object(escaped).to_string()
        }
        Value::Array(items) => {
            let escaped: Map<String, Value> = items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), Value::String(escape_javascript(v))))
                .collect();
            Value::Object(escaped).to_string()
        }
        other => escape_javascript_str(&other.to_string()),
    }
}

pub fn escape_javascript_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'n') => {
                chars.next();
                out.push('\n');
            }
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\r' => out.push_str("\\r"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// `encodeURI`: percent-encode UTF-8, keeping URI syntax characters.
pub fn url_encode(s: &str) -> String {
    utf8_percent_encode(s, URI_KEEP).to_string()
}

/// `decodeURI`: decode percent escapes except those for reserved characters.
pub fn url_decode(s: &str) -> Result<String, UtilError> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let escape = bytes
            .get(i + 1..i + 3)
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(|| UtilError::MalformedUri(s.to_string()))?;
        if URI_RESERVED.contains(&escape) {
            out.extend_from_slice(&bytes[i..i + 3]);
        } else {
            out.push(escape);
        }
        i += 3;
    }
    String::from_utf8(out).map_err(|_| UtilError::MalformedUri(s.to_string()))
}

/// Base64 of a byte string: every char is taken as one byte.
pub fn base64_encode(s: &str) -> String {
    let bytes: Vec<u8> = s.chars().map(|c| (u32::from(c) & 0xff) as u8).collect();
    BASE64.encode(bytes)
}

/// Decode base64 into a byte string, one char per byte.
pub fn base64_decode(s: &str) -> Result<String, UtilError> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64.decode(compact)?;
    Ok(bytes.into_iter().map(char::from).collect())
}

pub fn parse_json(s: &str) -> Result<Value, UtilError> {
    Ok(serde_json::from_str(s)?)
}
