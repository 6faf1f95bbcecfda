//! Rule comment tags.
//!
//! Every rule the reconciler owns carries its parameters in the nftables
//! comment, so the live rule set can be compared with the desired one
//! without parsing rule expressions:
//!
//! ```text
//! ZZ1_ratemin_443_500_3600ZZ
//! ^^ sentinel   ^ separator
//!   ^ format version
//! ```
//!
//! Inside a token `~` is written `~~` and `_` is written `~u`.

use std::fmt;

const SENTINEL: &str = "ZZ";
const VERSION: &str = "1";
const SEPARATOR: char = '_';
const ESCAPE: char = '~';

/// Encode `tokens` into a comment tag.
pub fn encode<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut out = String::with_capacity(8 + tokens.iter().map(|t| t.as_ref().len() + 1).sum::<usize>());
    out.push_str(SENTINEL);
    out.push_str(VERSION);
    for token in tokens {
        out.push(SEPARATOR);
        for c in token.as_ref().chars() {
            match c {
                ESCAPE => {
                    out.push(ESCAPE);
                    out.push(ESCAPE);
                }
                SEPARATOR => {
                    out.push(ESCAPE);
                    out.push('u');
                }
                c => out.push(c),
            }
        }
    }
    out.push_str(SENTINEL);
    out
}

/// Decode a comment tag. Anything malformed gives an empty `Vec`.
pub fn decode(comment: &str) -> Vec<String> {
    decode_checked(comment).unwrap_or_default()
}

fn decode_checked(comment: &str) -> Option<Vec<String>> {
    let start = comment.find(SENTINEL)? + SENTINEL.len();
    let end = comment.rfind(SENTINEL)?;
    if end < start {
        return None;
    }
    let mut parts = comment[start..end].split(SEPARATOR);
    if parts.next()? != VERSION {
        return None;
    }
    parts.map(unescape).collect()
}

fn unescape(token: &str) -> Option<String> {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next()? {
            ESCAPE => out.push(ESCAPE),
            'u' => out.push(SEPARATOR),
            _ => return None,
        }
    }
    Some(out)
}

/// Kind of rule a tag describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleKind {
    /// Global cap on concurrent connections to a port
    MaxConnections,
    /// Per-source cap on concurrent connections to a port
    MaxConnectionsPerIp,
    /// Per-source new-connection rate per minute
    MinutelyRate,
    /// Per-source new-connection rate per second
    SecondlyRate,
    /// Base rule accepting the allow set
    AllowBase,
    /// Base rule dropping the deny set
    DenyBase,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::MaxConnections => "maxconn",
            RuleKind::MaxConnectionsPerIp => "maxconnip",
            RuleKind::MinutelyRate => "ratemin",
            RuleKind::SecondlyRate => "ratesec",
            RuleKind::AllowBase => "allow",
            RuleKind::DenyBase => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "maxconn" => RuleKind::MaxConnections,
            "maxconnip" => RuleKind::MaxConnectionsPerIp,
            "ratemin" => RuleKind::MinutelyRate,
            "ratesec" => RuleKind::SecondlyRate,
            "allow" => RuleKind::AllowBase,
            "deny" => RuleKind::DenyBase,
            _ => return None,
        })
    }

    /// Whether rules of this kind are rebuilt on configuration changes.
    pub fn is_rate_limit(&self) -> bool {
        !matches!(self, RuleKind::AllowBase | RuleKind::DenyBase)
    }
}

/// Parameters of one owned rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleTag {
    pub kind: RuleKind,
    pub port: u16,
    pub threshold: u64,
    pub block_timeout_secs: u64,
}

impl RuleTag {
    pub fn new(kind: RuleKind, port: u16, threshold: u64, block_timeout_secs: u64) -> Self {
        Self {
            kind,
            port,
            threshold,
            block_timeout_secs,
        }
    }

    /// Tag of a base rule.
    pub fn base(kind: RuleKind) -> Self {
        Self::new(kind, 0, 0, 0)
    }

    pub fn to_comment(&self) -> String {
        encode(&[
            self.kind.as_str().to_string(),
            self.port.to_string(),
            self.threshold.to_string(),
            self.block_timeout_secs.to_string(),
        ])
    }

    /// Parse a rule comment; `None` for foreign or malformed comments.
    pub fn from_comment(comment: &str) -> Option<Self> {
        let tokens = decode(comment);
        let [kind, port, threshold, timeout] = tokens.as_slice() else {
            return None;
        };
        Some(Self {
            kind: RuleKind::parse(kind)?,
            port: port.parse().ok()?,
            threshold: threshold.parse().ok()?,
            block_timeout_secs: timeout.parse().ok()?,
        })
    }
}

impl fmt::Display for RuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} port {} threshold {} timeout {}s",
            self.kind.as_str(),
            self.port,
            self.threshold,
            self.block_timeout_secs
        )
    }
}
