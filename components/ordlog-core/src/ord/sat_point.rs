use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Position of a satoshi: a transaction output plus an offset into it.
/// Rendered as `txid:vout:offset`; the first two segments form the output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SatPoint {
    pub txid: String,
    pub vout: u32,
    pub offset: u64,
}

impl SatPoint {
    pub fn output(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

impl Display for SatPoint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.txid, self.vout, self.offset)
    }
}

impl FromStr for SatPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = s.split(':');
        let txid = segments
            .next()
            .filter(|txid| !txid.is_empty())
            .ok_or_else(|| format!("satpoint missing txid: {s}"))?;
        let vout = segments
            .next()
            .ok_or_else(|| format!("satpoint missing vout: {s}"))?
            .parse::<u32>()
            .map_err(|e| format!("satpoint vout not an integer: {e}"))?;
        let offset = segments
            .next()
            .ok_or_else(|| format!("satpoint missing offset: {s}"))?
            .parse::<u64>()
            .map_err(|e| format!("satpoint offset not an integer: {e}"))?;
        if segments.next().is_some() {
            return Err(format!("satpoint has trailing segments: {s}"));
        }
        Ok(SatPoint {
            txid: txid.to_string(),
            vout,
            offset,
        })
    }
}
