//! Tag attribute lists.
//!
//! Every `#EXT-X-...:` tag that carries `KEY=VALUE` pairs is parsed into an
//! [`AttrList`]. Accessors never fail hard: malformed numbers come back as
//! `None`/`NaN`, malformed booleans as `false`.

use std::collections::HashMap;
use std::fmt;

use nom::branch::alt;
use nom::bytes::complete::{take_until, take_while};
use nom::character::complete::{char, digit1, none_of, space0};
use nom::combinator::{map, opt, peek};
use nom::multi::fold_many0;
use nom::number::complete::double;
use nom::sequence::{delimited, preceded, separated_pair, tuple};
use nom::IResult;

use crate::attributes::QuotedOrUnquoted::{Quoted, Unquoted};

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum QuotedOrUnquoted {
    Unquoted(String),
    Quoted(String),
}

impl Default for QuotedOrUnquoted {
    fn default() -> Self {
        Quoted(String::new())
    }
}

impl QuotedOrUnquoted {
    pub fn as_str(&self) -> &str {
        match self {
            Quoted(s) | Unquoted(s) => s.as_str(),
        }
    }

    pub fn as_quoted(&self) -> Option<&str> {
        match self {
            Quoted(s) => Some(s.as_str()),
            Unquoted(_) => None,
        }
    }
}

impl From<&str> for QuotedOrUnquoted {
    fn from(s: &str) -> Self {
        if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
            return Quoted(s[1..s.len() - 1].to_string());
        }
        Unquoted(s.to_string())
    }
}

impl fmt::Display for QuotedOrUnquoted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// `WIDTH x HEIGHT` as found in `RESOLUTION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Resolution {
    pub width: u64,
    pub height: u64,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Ordered attribute list of a single tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrList {
    attrs: Vec<(String, QuotedOrUnquoted)>,
}

impl AttrList {
    pub fn new() -> Self {
        AttrList::default()
    }

    /// Parse the part of a tag line after the `:`.
    pub fn parse(input: &str) -> Self {
        match key_value_pairs(input) {
            Ok((_, attrs)) => AttrList { attrs },
            Err(_) => AttrList::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.attrs.iter().any(|(k, _)| k == name)
    }

    pub fn raw(&self, name: &str) -> Option<&QuotedOrUnquoted> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.raw(name).map(QuotedOrUnquoted::as_str)
    }

    /// Sets `name`, replacing a previous value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: QuotedOrUnquoted) {
        let name = name.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<QuotedOrUnquoted> {
        let pos = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QuotedOrUnquoted)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attrs.iter().map(|(k, _)| k.as_str())
    }

    /// `X-` prefixed attributes defined by the content author.
    pub fn client_attrs(&self) -> impl Iterator<Item = (&str, &QuotedOrUnquoted)> {
        self.iter().filter(|(k, _)| k.starts_with("X-"))
    }

    /// Copies every attribute of `other` that `self` does not define yet.
    pub fn merge_missing(&mut self, other: &AttrList) {
        for (k, v) in other.iter() {
            if !self.contains(k) {
                self.attrs.push((k.to_string(), v.clone()));
            }
        }
    }

    pub fn decimal_integer(&self, name: &str) -> Option<u64> {
        let value = self.get(name)?.trim();
        let (_, digits) = digit1::<_, nom::error::Error<&str>>(value).ok()?;
        digits.parse().ok()
    }

    /// Hex bytes of a `0x`-prefixed value, left padded to an even length.
    pub fn hexadecimal_integer(&self, name: &str) -> Option<Vec<u8>> {
        let value = self.get(name)?.trim();
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        if digits.len() % 2 == 1 {
            hex::decode(format!("0{}", digits)).ok()
        } else {
            hex::decode(digits).ok()
        }
    }

    /// `NaN` when missing or malformed.
    pub fn decimal_floating_point(&self, name: &str) -> f64 {
        self.get(name)
            .and_then(|v| double::<_, nom::error::Error<&str>>(v.trim()).ok())
            .map(|(_, v)| v)
            .unwrap_or(f64::NAN)
    }

    pub fn optional_float(&self, name: &str, default: f64) -> f64 {
        let value = self.decimal_floating_point(name);
        if value.is_finite() {
            value
        } else {
            default
        }
    }

    pub fn enumerated_string(&self, name: &str) -> Option<&str> {
        self.get(name)
    }

    /// One flag per entry of `flags`, set when the attribute lists it.
    ///
    /// Tokens are separated by spaces or commas and compared case-insensitively.
    /// Unknown tokens are ignored.
    pub fn enumerated_string_list<'f>(&self, name: &str, flags: &[&'f str]) -> HashMap<&'f str, bool> {
        let mut result: HashMap<&'f str, bool> = flags.iter().map(|f| (*f, false)).collect();
        if let Some(value) = self.get(name) {
            for token in value.split(|c| c == ' ' || c == ',').filter(|t| !t.is_empty()) {
                if let Some(flag) = flags.iter().find(|f| f.eq_ignore_ascii_case(token)) {
                    result.insert(*flag, true);
                }
            }
        }
        result
    }

    pub fn bool(&self, name: &str) -> bool {
        self.get(name) == Some("YES")
    }

    pub fn decimal_resolution(&self, name: &str) -> Option<Resolution> {
        let value = self.get(name)?.trim();
        let parsed: IResult<&str, (&str, &str)> =
            separated_pair(digit1, alt((char('x'), char('X'))), digit1)(value);
        let (_, (w, h)) = parsed.ok()?;
        Some(Resolution {
            width: w.parse().ok()?,
            height: h.parse().ok()?,
        })
    }
}

impl From<&str> for AttrList {
    fn from(input: &str) -> Self {
        AttrList::parse(input)
    }
}

impl fmt::Display for AttrList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.attrs {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            match v {
                Quoted(s) => write!(f, "{}=\"{}\"", k, s)?,
                Unquoted(s) => write!(f, "{}={}", k, s)?,
            }
        }
        Ok(())
    }
}

fn key_value_pairs(i: &str) -> IResult<&str, Vec<(String, QuotedOrUnquoted)>> {
    fold_many0(
        preceded(space0, key_value_pair),
        Vec::new,
        |mut acc: Vec<_>, (left, right)| {
            acc.push((left, right));
            acc
        },
    )(i)
}

fn key_value_pair(i: &str) -> IResult<&str, (String, QuotedOrUnquoted)> {
    map(
        tuple((
            peek(none_of("\r\n")),
            take_until("="),
            char('='),
            alt((quoted, unquoted)),
            opt(char(',')),
        )),
        |(_, left, _, right, _): (_, &str, _, _, _)| (left.trim().to_string(), right),
    )(i)
}

fn quoted(i: &str) -> IResult<&str, QuotedOrUnquoted> {
    map(
        delimited(char('"'), take_while(|c| c != '"'), char('"')),
        |s: &str| Quoted(s.to_string()),
    )(i)
}

fn unquoted(i: &str) -> IResult<&str, QuotedOrUnquoted> {
    map(take_while(|c| c != ',' && c != '\r' && c != '\n'), |s: &str| {
        Unquoted(s.trim_end().to_string())
    })(i)
}

// EXT-X-KEY
//
// METHOD
// The value is an enumerated-string that specifies the encryption
// method.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Default)]
pub enum KeyMethod {
    #[default]
    None,
    Aes128,
    Aes256,
    Aes256Ctr,
    SampleAes,
    SampleAesCenc,
    SampleAesCtr,
    Other(String),
}

impl KeyMethod {
    /// Whole segments are encrypted; the key is fetched over HTTP.
    pub fn is_full_segment_encryption(&self) -> bool {
        matches!(self, KeyMethod::Aes128 | KeyMethod::Aes256 | KeyMethod::Aes256Ctr)
    }

    pub fn is_sample_aes(&self) -> bool {
        matches!(
            self,
            KeyMethod::SampleAes | KeyMethod::SampleAesCenc | KeyMethod::SampleAesCtr
        )
    }
}

impl From<QuotedOrUnquoted> for KeyMethod {
    fn from(s: QuotedOrUnquoted) -> Self {
        KeyMethod::from(s.as_str())
    }
}

impl From<&str> for KeyMethod {
    fn from(s: &str) -> Self {
        match s {
            "NONE" => KeyMethod::None,
            "AES-128" => KeyMethod::Aes128,
            "AES-256" => KeyMethod::Aes256,
            "AES-256-CTR" => KeyMethod::Aes256Ctr,
            "SAMPLE-AES" => KeyMethod::SampleAes,
            "SAMPLE-AES-CENC" => KeyMethod::SampleAesCenc,
            "SAMPLE-AES-CTR" => KeyMethod::SampleAesCtr,
            other => KeyMethod::Other(other.to_string()),
        }
    }
}

impl fmt::Display for KeyMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyMethod::None => write!(f, "NONE"),
            KeyMethod::Aes128 => write!(f, "AES-128"),
            KeyMethod::Aes256 => write!(f, "AES-256"),
            KeyMethod::Aes256Ctr => write!(f, "AES-256-CTR"),
            KeyMethod::SampleAes => write!(f, "SAMPLE-AES"),
            KeyMethod::SampleAesCenc => write!(f, "SAMPLE-AES-CENC"),
            KeyMethod::SampleAesCtr => write!(f, "SAMPLE-AES-CTR"),
            KeyMethod::Other(s) => write!(f, "{}", s),
        }
    }
}

// EXT-X-STREAM-INF:
//
// HDCP-LEVEL
// The value is an enumerated-string; valid strings are TYPE-0, TYPE-
// 1, and NONE
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum HdcpLevel {
    Type0,
    Type1,
    None,
    Other(String),
}

impl From<QuotedOrUnquoted> for HdcpLevel {
    fn from(s: QuotedOrUnquoted) -> Self {
        match s.as_str() {
            "NONE" => HdcpLevel::None,
            "TYPE-0" => HdcpLevel::Type0,
            "TYPE-1" => HdcpLevel::Type1,
            other => HdcpLevel::Other(other.to_string()),
        }
    }
}

impl fmt::Display for HdcpLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HdcpLevel::None => write!(f, "NONE"),
            HdcpLevel::Type0 => write!(f, "TYPE-0"),
            HdcpLevel::Type1 => write!(f, "TYPE-1"),
            HdcpLevel::Other(s) => write!(f, "{}", s),
        }
    }
}

// EXT-X-STREAM-INF
//
// CLOSED-CAPTIONS
// The value can be either a quoted-string or an enumerated-string
// with the value NONE.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ClosedCaptions {
    None,
    GroupId(String),
}

impl From<QuotedOrUnquoted> for ClosedCaptions {
    fn from(s: QuotedOrUnquoted) -> Self {
        match s {
            Unquoted(s) if s == "NONE" => ClosedCaptions::None,
            Quoted(gid) | Unquoted(gid) => ClosedCaptions::GroupId(gid),
        }
    }
}

impl fmt::Display for ClosedCaptions {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClosedCaptions::None => write!(f, "NONE"),
            ClosedCaptions::GroupId(gid) => write!(f, "{}", gid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs_quotes() {
        let (rest, attrs) =
            key_value_pairs("BANDWIDTH=300000,CODECS=\"avc1.42c015,mp4a.40.2\"\r\nrest").unwrap();
        assert_eq!(rest, "\r\nrest");
        assert_eq!(
            attrs,
            vec![
                ("BANDWIDTH".to_string(), Unquoted("300000".into())),
                ("CODECS".to_string(), Quoted("avc1.42c015,mp4a.40.2".into())),
            ]
        );
    }

    #[test]
    fn key_value_pair_single() {
        assert_eq!(
            key_value_pair("PROGRAM-ID=1,rest"),
            Ok(("rest", ("PROGRAM-ID".to_string(), Unquoted("1".into()))))
        );
    }

    #[test]
    fn empty_quoted_value() {
        let attrs = AttrList::parse("ID=\"\",CLASS=\"a\"");
        assert_eq!(attrs.get("ID"), Some(""));
        assert_eq!(attrs.get("CLASS"), Some("a"));
    }

    #[test]
    fn whitespace_between_pairs() {
        let attrs = AttrList::parse("METHOD=AES-128, URI=\"k.bin\"");
        assert_eq!(attrs.get("URI"), Some("k.bin"));
    }

    #[test]
    fn typed_accessors() {
        let attrs = AttrList::parse(
            "BANDWIDTH=1280000,FRAME-RATE=29.97,RESOLUTION=1280x720,IV=0x1,DEFAULT=YES,AUTOSELECT=NO",
        );
        assert_eq!(attrs.decimal_integer("BANDWIDTH"), Some(1_280_000));
        assert!((attrs.decimal_floating_point("FRAME-RATE") - 29.97).abs() < 1e-9);
        assert_eq!(
            attrs.decimal_resolution("RESOLUTION"),
            Some(Resolution {
                width: 1280,
                height: 720
            })
        );
        assert_eq!(attrs.hexadecimal_integer("IV"), Some(vec![0x01]));
        assert!(attrs.bool("DEFAULT"));
        assert!(!attrs.bool("AUTOSELECT"));
        assert!(!attrs.bool("FORCED"));
    }

    #[test]
    fn malformed_numbers_degrade() {
        let attrs = AttrList::parse("DURATION=abc,BANDWIDTH=x1,IV=0xZZ");
        assert!(attrs.decimal_floating_point("DURATION").is_nan());
        assert!(attrs.decimal_floating_point("MISSING").is_nan());
        assert_eq!(attrs.optional_float("DURATION", 2.0), 2.0);
        assert_eq!(attrs.decimal_integer("BANDWIDTH"), None);
        assert_eq!(attrs.hexadecimal_integer("IV"), None);
    }

    #[test]
    fn enumerated_list_flags() {
        let attrs = AttrList::parse("CUE=\"PRE,ONCE,BOGUS\"");
        let cue = attrs.enumerated_string_list("CUE", &["pre", "post", "once"]);
        assert_eq!(cue.get("pre"), Some(&true));
        assert_eq!(cue.get("post"), Some(&false));
        assert_eq!(cue.get("once"), Some(&true));
        assert_eq!(cue.len(), 3);
    }

    #[test]
    fn merge_missing_keeps_existing() {
        let mut a = AttrList::parse("ID=\"x\",DURATION=10");
        let b = AttrList::parse("ID=\"x\",DURATION=20,CLASS=\"c\"");
        a.merge_missing(&b);
        assert_eq!(a.get("DURATION"), Some("10"));
        assert_eq!(a.get("CLASS"), Some("c"));
    }

    #[test]
    fn key_methods() {
        assert_eq!(KeyMethod::from("AES-128"), KeyMethod::Aes128);
        assert!(KeyMethod::from("AES-256-CTR").is_full_segment_encryption());
        assert!(!KeyMethod::SampleAes.is_full_segment_encryption());
        assert_eq!(KeyMethod::from("FOO"), KeyMethod::Other("FOO".into()));
        assert_eq!(KeyMethod::SampleAesCtr.to_string(), "SAMPLE-AES-CTR");
    }

    #[test]
    fn closed_captions() {
        assert_eq!(ClosedCaptions::from(Unquoted("NONE".into())), ClosedCaptions::None);
        assert_eq!(
            ClosedCaptions::from(Quoted("cc1".into())),
            ClosedCaptions::GroupId("cc1".into())
        );
    }
}
