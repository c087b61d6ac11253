//! Combination catalog
//!
//! Enumerates every ordered combination of one to three distinct primitives
//! that fits the capacity constraints, in a fixed order both peers share. A
//! combination is chosen on the wire by a 2-byte identifier:
//!
//! ```text
//! index = u16::from_be_bytes(id) % catalog.len()
//! ```
//!
//! The mapping is part of the protocol; changing the enumeration order or
//! the registry breaks interoperability.

use super::{Family, Primitive};
use std::sync::OnceLock;

/// Maximum number of primitives in one cascade
pub const MAX_CASCADE_LEN: usize = 3;

/// An ordered list of distinct primitives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination(Vec<Primitive>);

impl Combination {
    /// Build a combination if it satisfies the capacity constraints
    pub fn new(primitives: Vec<Primitive>) -> Option<Self> {
        if Self::is_valid(&primitives) {
            Some(Self(primitives))
        } else {
            None
        }
    }

    /// Check the capacity constraints
    ///
    /// At most two members of the RC6, SkeinStream and Threefish families
    /// each, never two SkeinStream together with two Threefish, no repeats,
    /// and one to three primitives in total.
    pub fn is_valid(primitives: &[Primitive]) -> bool {
        if primitives.is_empty() || primitives.len() > MAX_CASCADE_LEN {
            return false;
        }
        for (i, p) in primitives.iter().enumerate() {
            if primitives[..i].contains(p) {
                return false;
            }
        }

        let count = |family| primitives.iter().filter(|p| p.family() == family).count();
        let rc6 = count(Family::Rc6);
        let skein = count(Family::SkeinStream);
        let threefish = count(Family::Threefish);

        rc6 <= 2 && skein <= 2 && threefish <= 2 && !(skein == 2 && threefish == 2)
    }

    /// The primitives, in encryption order
    pub fn primitives(&self) -> &[Primitive] {
        &self.0
    }

    /// Total key bytes consumed by this combination
    pub fn key_footprint(&self) -> usize {
        self.0.iter().map(|p| p.key_size()).sum()
    }

    /// Total IV bytes consumed by this combination
    pub fn iv_footprint(&self) -> usize {
        self.0.iter().map(|p| p.iv_size()).sum()
    }
}

impl std::fmt::Display for Combination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|p| p.name()).collect();
        f.write_str(&names.join("+"))
    }
}

/// Deterministic list of all valid combinations
pub struct Catalog {
    combinations: Vec<Combination>,
}

impl Catalog {
    /// Enumerate the catalog: all singles, then pairs, then triples, each in
    /// registry order
    pub fn build() -> Self {
        let all = Primitive::ALL;
        let mut combinations = Vec::new();

        for a in all {
            combinations.extend(Combination::new(vec![a]));
        }
        for a in all {
            for b in all {
                combinations.extend(Combination::new(vec![a, b]));
            }
        }
        for a in all {
            for b in all {
                for c in all {
                    combinations.extend(Combination::new(vec![a, b, c]));
                }
            }
        }

        Self { combinations }
    }

    /// Process-wide catalog, built on first use
    pub fn global() -> &'static Catalog {
        static CATALOG: OnceLock<Catalog> = OnceLock::new();
        CATALOG.get_or_init(Catalog::build)
    }

    /// Number of combinations
    pub fn len(&self) -> usize {
        self.combinations.len()
    }

    /// Whether the catalog is empty (never, for the built-in registry)
    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }

    /// Combination at `index`
    pub fn get(&self, index: usize) -> Option<&Combination> {
        self.combinations.get(index)
    }

    /// Map a numeric cipher id onto a combination
    pub fn by_id(&self, id: u16) -> &Combination {
        &self.combinations[id as usize % self.combinations.len()]
    }

    /// Iterate over all combinations
    pub fn iter(&self) -> impl Iterator<Item = &Combination> {
        self.combinations.iter()
    }

    /// Pick a uniformly random cipher id
    pub fn random_id() -> u16 {
        u16::from_be_bytes(super::random_array())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MAX_IV_FOOTPRINT, MAX_KEY_FOOTPRINT};

    #[test]
    fn test_catalog_size() {
        let catalog = Catalog::build();
        // 14 singles + 14*13 pairs + 14*13*12 triples, minus the six orderings
        // of three Threefish and the six of three SkeinStream
        assert_eq!(catalog.len(), 14 + 182 + 2184 - 12);
    }

    #[test]
    fn test_no_combination_violates_constraints() {
        for combo in Catalog::global().iter() {
            let p = combo.primitives();
            let count = |f| p.iter().filter(|x| x.family() == f).count();
            assert!(count(Family::Rc6) <= 2, "{}", combo);
            assert!(count(Family::SkeinStream) <= 2, "{}", combo);
            assert!(count(Family::Threefish) <= 2, "{}", combo);
            assert!(
                !(count(Family::SkeinStream) == 2 && count(Family::Threefish) == 2),
                "{}",
                combo
            );
            assert!(combo.key_footprint() <= MAX_KEY_FOOTPRINT);
            assert!(combo.iv_footprint() <= MAX_IV_FOOTPRINT);
        }
    }

    #[test]
    fn test_enumeration_order_is_stable() {
        let catalog = Catalog::build();
        assert_eq!(catalog.get(0).unwrap().primitives(), &[Primitive::Aes256]);
        assert_eq!(
            catalog.get(14).unwrap().primitives(),
            &[Primitive::Aes256, Primitive::Twofish]
        );
    }

    #[test]
    fn test_id_mapping_wraps() {
        let catalog = Catalog::global();
        let len = catalog.len() as u16;
        assert_eq!(catalog.by_id(3), catalog.by_id(3 + len));
        assert_eq!(catalog.by_id(u16::MAX), catalog.by_id(u16::MAX % len));
    }

    #[test]
    fn test_invalid_combinations_rejected() {
        assert!(Combination::new(vec![]).is_none());
        assert!(Combination::new(vec![Primitive::Aes256, Primitive::Aes256]).is_none());
        assert!(Combination::new(vec![
            Primitive::Threefish256,
            Primitive::Threefish512,
            Primitive::Threefish1024
        ])
        .is_none());
        assert!(Combination::new(vec![
            Primitive::SkeinStream256,
            Primitive::SkeinStream512,
            Primitive::SkeinStream1024
        ])
        .is_none());
    }
}
