use rand::RngCore;
use std::fmt::{Display, Formatter};

/// Global Source Identifier, 6 opaque bytes identifying a sender process.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Gsi([u8; 6]);

impl Gsi {
    pub fn from_bytes(bytes: [u8; 6]) -> Gsi {
        Gsi(bytes)
    }

    /// Derive a fresh GSI from the process-local RNG. Deriving from the MD5
    /// of the hostname (as some deployments do) is the caller's business,
    /// via [`Gsi::from_bytes`].
    pub fn random() -> Gsi {
        let mut bytes = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut bytes);
        Gsi(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl Display for Gsi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Transport Session Identifier: GSI plus the sender's source port. This is
/// the key of the peer table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct Tsi {
    pub gsi: Gsi,
    pub sport: u16,
}

impl Tsi {
    pub fn new(gsi: Gsi, sport: u16) -> Tsi {
        Tsi { gsi, sport }
    }
}

impl Display for Tsi {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.gsi, self.sport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let tsi = Tsi::new(Gsi::from_bytes([1, 2, 3, 4, 5, 6]), 7500);
        assert_eq!(tsi.to_string(), "1.2.3.4.5.6.7500");
    }

    #[test]
    fn test_random_gsi_distinct() {
        // not a statistical test, just a sanity check that we don't return a constant
        assert_ne!(Gsi::random(), Gsi::random());
    }
}
