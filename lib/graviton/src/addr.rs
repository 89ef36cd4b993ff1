use crate::support::{ErrorType, NetworkError};
use std::fmt;
use std::str::FromStr;

/// A 64-bit node identity, formatted as four 16-bit hex groups joined by `::`.
/// Never treated as a string internally.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct NodeAddr(pub u64);

impl NodeAddr {
    /// The all-zero address addresses any recipient.
    pub const BROADCAST: NodeAddr = NodeAddr(0);

    /// Generates a fresh random node identity.
    #[inline]
    pub fn random() -> NodeAddr {
        NodeAddr(plasma::crypto::random_u64())
    }

    #[inline]
    pub fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04X}::{:04X}::{:04X}::{:04X}",
            (self.0 >> 48) & 0xffff,
            (self.0 >> 32) & 0xffff,
            (self.0 >> 16) & 0xffff,
            self.0 & 0xffff
        )
    }
}

impl FromStr for NodeAddr {
    type Err = NetworkError;

    fn from_str(raw: &str) -> Result<NodeAddr, NetworkError> {
        let mut groups = 0u32;
        let mut value = 0u64;

        for part in raw.split("::") {
            if groups == 4 || part.is_empty() || part.len() > 4 {
                return Err(NetworkError::Fatal(ErrorType::AddrParse));
            }

            let group = u16::from_str_radix(part, 16)
                .map_err(|_| NetworkError::Fatal(ErrorType::AddrParse))?;

            value = (value << 16) | u64::from(group);
            groups += 1;
        }

        match groups {
            4 => Ok(NodeAddr(value)),
            _ => Err(NetworkError::Fatal(ErrorType::AddrParse)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip() {
        let addr = NodeAddr(0x0123_4567_89AB_CDEF);
        assert_eq!(addr.to_string(), "0123::4567::89AB::CDEF");
        assert_eq!(addr.to_string().parse::<NodeAddr>().unwrap(), addr);
    }

    #[test]
    fn parse_is_case_insensitive() {
        let upper: NodeAddr = "00FF::AB12::0000::FFFF".parse().unwrap();
        let lower: NodeAddr = "00ff::ab12::0000::ffff".parse().unwrap();
        assert_eq!(upper, lower);
    }

    #[test]
    fn parse_accepts_short_groups() {
        let addr: NodeAddr = "1::2::3::4".parse().unwrap();
        assert_eq!(addr, NodeAddr(0x0001_0002_0003_0004));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("".parse::<NodeAddr>().is_err());
        assert!("1::2::3".parse::<NodeAddr>().is_err());
        assert!("1::2::3::4::5".parse::<NodeAddr>().is_err());
        assert!("1::2::3::zzzz".parse::<NodeAddr>().is_err());
        assert!("12345::0::0::0".parse::<NodeAddr>().is_err());
        assert!("1:2:3:4".parse::<NodeAddr>().is_err());
    }
}
