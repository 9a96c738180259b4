use std::collections::HashMap;

use crate::error::{Error, Result};

/// Bijection between canonical opcode numbers and on-disk numbers.
///
/// Some target builds permute opcode values per release; the map translates
/// at the codec boundary so everything above the decoder works in canonical
/// numbering. The identity map serves unscrambled builds. Opcodes absent
/// from the pair list map to themselves, so a map only needs to list the
/// opcodes a build actually permutes.
#[derive(Debug, Clone, Default)]
pub struct ScrambleMap {
    to_disk: HashMap<u16, u16>,
    to_canonical: HashMap<u16, u16>,
}

impl ScrambleMap {
    /// The identity map (unscrambled format variant).
    pub fn identity() -> Self {
        Self::default()
    }

    /// Build a map from `(canonical, disk)` pairs.
    ///
    /// Fails if either side of any pair collides with an earlier pair;
    /// the map must stay bijective in both directions.
    pub fn from_pairs(pairs: &[(u16, u16)]) -> Result<Self> {
        let mut map = Self::default();
        for &(canonical, disk) in pairs {
            if map.to_disk.insert(canonical, disk).is_some() {
                return Err(Error::ScrambleCollision {
                    side: "canonical",
                    opcode: canonical,
                });
            }
            if map.to_canonical.insert(disk, canonical).is_some() {
                return Err(Error::ScrambleCollision {
                    side: "disk",
                    opcode: disk,
                });
            }
        }
        Ok(map)
    }

    pub fn is_identity(&self) -> bool {
        self.to_disk.is_empty()
    }

    /// Canonical → on-disk.
    pub fn scramble(&self, canonical: u16) -> u16 {
        self.to_disk.get(&canonical).copied().unwrap_or(canonical)
    }

    /// On-disk → canonical.
    pub fn unscramble(&self, disk: u16) -> u16 {
        self.to_canonical.get(&disk).copied().unwrap_or(disk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn identity_round_trips_every_core_opcode() {
        let map = ScrambleMap::identity();
        for op in Opcode::all() {
            let c = op as u16;
            assert_eq!(map.unscramble(map.scramble(c)), c);
        }
    }

    #[test]
    fn permutation_round_trips() {
        let map = ScrambleMap::from_pairs(&[(0, 20), (20, 0), (13, 140), (140, 13)]).unwrap();
        for c in [0u16, 13, 20, 140, 7, 255] {
            assert_eq!(map.unscramble(map.scramble(c)), c);
        }
        assert_eq!(map.scramble(0), 20);
        assert_eq!(map.unscramble(20), 0);
    }

    #[test]
    fn collisions_are_rejected() {
        assert!(matches!(
            ScrambleMap::from_pairs(&[(0, 5), (0, 6)]),
            Err(Error::ScrambleCollision { side: "canonical", opcode: 0 })
        ));
        assert!(matches!(
            ScrambleMap::from_pairs(&[(1, 5), (2, 5)]),
            Err(Error::ScrambleCollision { side: "disk", opcode: 5 })
        ));
    }
}
