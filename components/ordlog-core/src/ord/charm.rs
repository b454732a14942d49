use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Named boolean properties of an inscription, carried on the event stream as
/// a 12-bit flag integer. Bit positions are assigned by the external indexer
/// and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum Charm {
    Coin = 0,
    Cursed = 1,
    Epic = 2,
    Legendary = 3,
    Lost = 4,
    Nineball = 5,
    Rare = 6,
    Reinscription = 7,
    Unbound = 8,
    Uncommon = 9,
    Vindicated = 10,
    Mythic = 11,
}

impl Charm {
    pub const ALL: [Charm; 12] = [
        Charm::Coin,
        Charm::Cursed,
        Charm::Epic,
        Charm::Legendary,
        Charm::Lost,
        Charm::Nineball,
        Charm::Rare,
        Charm::Reinscription,
        Charm::Unbound,
        Charm::Uncommon,
        Charm::Vindicated,
        Charm::Mythic,
    ];

    pub fn flag(self) -> u16 {
        1 << (self as u16)
    }

    pub fn is_set(self, flags: u16) -> bool {
        flags & self.flag() != 0
    }

    /// Expands a flag integer into the set of charms it encodes. Bits above
    /// the known enumeration are ignored.
    pub fn decode(flags: u16) -> Vec<Charm> {
        Charm::ALL
            .iter()
            .copied()
            .filter(|charm| charm.is_set(flags))
            .collect()
    }

    pub fn encode(charms: &[Charm]) -> u16 {
        charms.iter().fold(0, |flags, charm| flags | charm.flag())
    }
}

impl Display for Charm {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Charm::Coin => "coin",
                Charm::Cursed => "cursed",
                Charm::Epic => "epic",
                Charm::Legendary => "legendary",
                Charm::Lost => "lost",
                Charm::Mythic => "mythic",
                Charm::Nineball => "nineball",
                Charm::Rare => "rare",
                Charm::Reinscription => "reinscription",
                Charm::Unbound => "unbound",
                Charm::Uncommon => "uncommon",
                Charm::Vindicated => "vindicated",
            }
        )
    }
}

impl FromStr for Charm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coin" => Ok(Charm::Coin),
            "cursed" => Ok(Charm::Cursed),
            "epic" => Ok(Charm::Epic),
            "legendary" => Ok(Charm::Legendary),
            "lost" => Ok(Charm::Lost),
            "mythic" => Ok(Charm::Mythic),
            "nineball" => Ok(Charm::Nineball),
            "rare" => Ok(Charm::Rare),
            "reinscription" => Ok(Charm::Reinscription),
            "unbound" => Ok(Charm::Unbound),
            "uncommon" => Ok(Charm::Uncommon),
            "vindicated" => Ok(Charm::Vindicated),
            _ => Err(format!("unknown charm: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Charm;

    #[test]
    fn decode_then_encode_round_trips_over_the_12_bit_space() {
        for flags in 0u16..4096 {
            let charms = Charm::decode(flags);
            assert_eq!(Charm::encode(&charms), flags, "flags: {flags:#014b}");
        }
    }

    #[test]
    fn bits_above_the_enumeration_are_dropped() {
        let charms = Charm::decode(0b0001_0000_0000_0001);
        assert_eq!(charms, vec![Charm::Coin]);
    }

    #[test]
    fn display_names_parse_back() {
        for charm in Charm::ALL {
            assert_eq!(charm.to_string().parse::<Charm>(), Ok(charm));
        }
    }

    #[test]
    fn cursed_and_vindicated_bits() {
        assert_eq!(Charm::decode(1 << 1), vec![Charm::Cursed]);
        assert_eq!(Charm::decode(1 << 10), vec![Charm::Vindicated]);
        assert!(Charm::Cursed.is_set(0b10));
        assert!(!Charm::Cursed.is_set(0b01));
    }
}
