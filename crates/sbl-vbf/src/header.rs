//! VBF textual header
//!
//! ```text
//! vbf_version = 2.2;
//! header {
//!     sw_part_number = "32220777";
//!     sw_part_type = SBL;
//!     data_format_identifier = 0x00;
//!     erase = { { 0x00020000, 0x00010000 } };
//!     call = 0x00020000;
//!     file_checksum = 0x1A2B3C4D;
//! }<binary blocks>
//! ```
//!
//! The header ends at the first `;\r\n}` sentinel.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, VbfError};

/// `;\r\n}` closing the header block
pub const HEADER_SENTINEL: [u8; 4] = [0x3B, 0x0D, 0x0A, 0x7D];

/// The sentinel must appear within this many bytes
pub const MAX_HEADER_LEN: usize = 0x20000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwPartType {
    Sbl,
    Ess,
    Exe,
    Data,
    CarCfg,
    Custom,
    SigCfg,
    Test,
    Other(String),
}

impl SwPartType {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "SBL" => Self::Sbl,
            "ESS" => Self::Ess,
            "EXE" => Self::Exe,
            "DATA" => Self::Data,
            "CARCFG" => Self::CarCfg,
            "CUSTOM" => Self::Custom,
            "SIGCFG" => Self::SigCfg,
            "TEST" => Self::Test,
            _ => Self::Other(value.to_string()),
        }
    }
}

impl fmt::Display for SwPartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sbl => write!(f, "SBL"),
            Self::Ess => write!(f, "ESS"),
            Self::Exe => write!(f, "EXE"),
            Self::Data => write!(f, "DATA"),
            Self::CarCfg => write!(f, "CARCFG"),
            Self::Custom => write!(f, "CUSTOM"),
            Self::SigCfg => write!(f, "SIGCFG"),
            Self::Test => write!(f, "TEST"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseRange {
    pub address: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VbfHeader {
    pub vbf_version: Option<String>,
    pub sw_part_number: Option<String>,
    pub sw_version: Option<String>,
    pub sw_part_type: SwPartType,
    pub data_format_identifier: u8,
    pub ecu_address: Option<u32>,
    /// Entry point of an SBL
    pub call: Option<u32>,
    pub erase: Vec<EraseRange>,
    pub sw_signature: Option<Vec<u8>>,
    pub sw_signature_dev: Option<Vec<u8>>,
    pub file_checksum: Option<u32>,
    pub verification_block_start: Option<u32>,
    pub verification_block_length: Option<u32>,
    pub verification_block_root_hash: Option<Vec<u8>>,
    /// Every field as written, comments stripped
    pub fields: BTreeMap<String, String>,
    /// Offset of the first binary block
    pub header_len: usize,
}

/// Find the end of the header (first byte after the sentinel)
pub fn header_end(bytes: &[u8]) -> Result<usize> {
    let window = &bytes[..bytes.len().min(MAX_HEADER_LEN)];
    window
        .windows(HEADER_SENTINEL.len())
        .position(|w| w == HEADER_SENTINEL)
        .map(|pos| pos + HEADER_SENTINEL.len())
        .ok_or_else(|| {
            VbfError::MalformedVbf(format!(
                "header terminator 3B0D0A7D not found in first {} bytes",
                window.len()
            ))
        })
}

pub fn parse_header(bytes: &[u8]) -> Result<VbfHeader> {
    let header_len = header_end(bytes)?;
    let text = String::from_utf8_lossy(&bytes[..header_len]);
    let fields = parse_fields(&tokenize(&text)?)?;

    let sw_part_type = fields
        .get("sw_part_type")
        .map(|v| SwPartType::parse(unquote(v)))
        .ok_or_else(|| VbfError::MalformedVbf("sw_part_type missing".to_string()))?;

    let data_format_identifier = match fields.get("data_format_identifier") {
        Some(v) => {
            let value = parse_number(v)?;
            u8::try_from(value).map_err(|_| {
                VbfError::MalformedVbf(format!("data_format_identifier {} exceeds one byte", v))
            })?
        }
        None => 0x00,
    };

    Ok(VbfHeader {
        vbf_version: fields.get("vbf_version").cloned(),
        sw_part_number: fields.get("sw_part_number").map(|v| unquote(v).to_string()),
        sw_version: fields.get("sw_version").map(|v| unquote(v).to_string()),
        sw_part_type,
        data_format_identifier,
        ecu_address: optional_number(&fields, "ecu_address")?,
        call: optional_number(&fields, "call")?,
        erase: match fields.get("erase") {
            Some(v) => parse_erase(v)?,
            None => Vec::new(),
        },
        sw_signature: optional_bytes(&fields, "sw_signature")?,
        sw_signature_dev: optional_bytes(&fields, "sw_signature_dev")?,
        file_checksum: optional_number(&fields, "file_checksum")?,
        verification_block_start: optional_number(&fields, "verification_block_start")?,
        verification_block_length: optional_number(&fields, "verification_block_length")?,
        verification_block_root_hash: optional_bytes(&fields, "verification_block_root_hash")?,
        fields,
        header_len,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Quoted(String),
    Symbol(char),
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Word(w) => w.clone(),
            Token::Quoted(q) => format!("\"{}\"", q),
            Token::Symbol(c) => c.to_string(),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                let mut closed = false;
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        closed = true;
                        break;
                    }
                    prev = c;
                }
                if !closed {
                    return Err(VbfError::MalformedVbf("unterminated comment".to_string()));
                }
            }
            '"' => {
                let mut value = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(VbfError::MalformedVbf("unterminated string".to_string()));
                }
                tokens.push(Token::Quoted(value));
            }
            '=' | ';' | '{' | '}' | ',' => tokens.push(Token::Symbol(c)),
            _ => {
                let mut word = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || matches!(next, '=' | ';' | '{' | '}' | ',' | '"') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

/// `key = value;` statements, with the `header { ... }` wrapper flattened
fn parse_fields(tokens: &[Token]) -> Result<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    let mut i = 0;

    while i < tokens.len() {
        match &tokens[i] {
            Token::Word(w) if w == "header" && tokens.get(i + 1) == Some(&Token::Symbol('{')) => {
                i += 2;
            }
            Token::Symbol('}') | Token::Symbol(';') => i += 1,
            Token::Word(key) => {
                if tokens.get(i + 1) != Some(&Token::Symbol('=')) {
                    return Err(VbfError::MalformedVbf(format!("expected '=' after {}", key)));
                }
                i += 2;

                let mut depth = 0usize;
                let mut value: Vec<String> = Vec::new();
                loop {
                    let token = tokens.get(i).ok_or_else(|| {
                        VbfError::MalformedVbf(format!("field {} not terminated by ';'", key))
                    })?;
                    i += 1;
                    match token {
                        Token::Symbol(';') if depth == 0 => break,
                        Token::Symbol('{') => depth += 1,
                        Token::Symbol('}') => {
                            depth = depth.checked_sub(1).ok_or_else(|| {
                                VbfError::MalformedVbf(format!("unbalanced braces in {}", key))
                            })?
                        }
                        _ => {}
                    }
                    value.push(token.text());
                }
                fields.insert(key.clone(), value.join(" "));
            }
            other => {
                return Err(VbfError::MalformedVbf(format!(
                    "unexpected token {} in header",
                    other.text()
                )))
            }
        }
    }

    Ok(fields)
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"')
}

fn parse_number(value: &str) -> Result<u32> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse::<u32>(),
    };
    parsed.map_err(|_| VbfError::MalformedVbf(format!("invalid number {}", value)))
}

fn optional_number(fields: &BTreeMap<String, String>, key: &str) -> Result<Option<u32>> {
    fields.get(key).map(|v| parse_number(v)).transpose()
}

fn optional_bytes(fields: &BTreeMap<String, String>, key: &str) -> Result<Option<Vec<u8>>> {
    fields
        .get(key)
        .map(|v| {
            let digits = v.trim();
            let digits = digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
                .unwrap_or(digits);
            let digits = if digits.len() % 2 == 1 {
                format!("0{}", digits)
            } else {
                digits.to_string()
            };
            hex::decode(&digits)
                .map_err(|e| VbfError::MalformedVbf(format!("{} is not hex: {}", key, e)))
        })
        .transpose()
}

/// Every number in the erase list, taken pairwise as (address, length)
fn parse_erase(value: &str) -> Result<Vec<EraseRange>> {
    let numbers = value
        .split(|c: char| c.is_whitespace() || matches!(c, '{' | '}' | ','))
        .filter(|t| !t.is_empty())
        .map(parse_number)
        .collect::<Result<Vec<u32>>>()?;

    if numbers.len() % 2 != 0 {
        return Err(VbfError::MalformedVbf(format!(
            "erase list has {} values, expected address/length pairs",
            numbers.len()
        )));
    }

    Ok(numbers
        .chunks(2)
        .map(|pair| EraseRange {
            address: pair[0],
            length: pair[1],
        })
        .collect())
}
