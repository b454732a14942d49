use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

const TXID_LEN: usize = 64;
const MIN_LEN: usize = TXID_LEN + 2;

/// Stable content-addressed identifier of an inscription: the genesis
/// transaction id followed by `i` and the envelope index.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct InscriptionId {
    pub txid: String,
    pub index: u32,
}

impl Display for InscriptionId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}i{}", self.txid, self.index)
    }
}

#[derive(Debug, PartialEq)]
pub enum ParseError {
    Character(char),
    Length(usize),
    Separator(char),
    Txid(char),
    Index(std::num::ParseIntError),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Self::Character(c) => write!(f, "invalid character: '{c}'"),
            Self::Length(len) => write!(f, "invalid length: {len}"),
            Self::Separator(c) => write!(f, "invalid separator: `{c}`"),
            Self::Txid(c) => write!(f, "invalid txid character: '{c}'"),
            Self::Index(err) => write!(f, "invalid index: {err}"),
        }
    }
}

impl std::error::Error for ParseError {}

impl FromStr for InscriptionId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(char) = s.chars().find(|char| !char.is_ascii()) {
            return Err(ParseError::Character(char));
        }

        if s.len() < MIN_LEN {
            return Err(ParseError::Length(s.len()));
        }

        let txid = &s[..TXID_LEN];
        if let Some(char) = txid.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(ParseError::Txid(char));
        }

        let separator = s.chars().nth(TXID_LEN).unwrap();
        if separator != 'i' {
            return Err(ParseError::Separator(separator));
        }

        let index = &s[TXID_LEN + 1..];

        Ok(Self {
            txid: txid.to_string(),
            index: index.parse().map_err(ParseError::Index)?,
        })
    }
}
