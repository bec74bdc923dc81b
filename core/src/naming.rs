//! Human-readable machine names.
//!
//! Names come from a fixed word pool. Allocation never returns a name that is
//! already in use; persisting the choice (as an instance tag) is the caller's
//! job, and so is retrying when the control plane reports a tie.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::NamingError;

/// The built-in word pool.
pub const WORDS: &[&str] = &[
    "acorn", "alder", "amber", "anchor", "aspen", "aster", "badger", "basil", "beacon", "birch",
    "bison", "bramble", "breeze", "brook", "cedar", "cinder", "clover", "comet", "coral", "crane",
    "cricket", "cypress", "dahlia", "delta", "dune", "eagle", "ember", "falcon", "fennel", "fern",
    "finch", "fjord", "flint", "fox", "garnet", "gecko", "glacier", "granite", "harbor", "hazel",
    "heron", "hickory", "ibis", "indigo", "iris", "jackal", "jasper", "juniper", "kelp", "kestrel",
    "lagoon", "larch", "lark", "lemur", "lichen", "linden", "lotus", "lynx", "magpie", "maple",
    "marten", "meadow", "mesa", "minnow", "moss", "nectar", "newt", "nimbus", "oak", "ocelot",
    "onyx", "orchid", "osprey", "otter", "owl", "pebble", "pelican", "pine", "plover", "poplar",
    "prairie", "puffin", "quail", "quartz", "raven", "reef", "ridge", "robin", "rowan", "saffron",
    "sage", "salmon", "sequoia", "sparrow", "spruce", "stork", "summit", "swift", "tamarack",
    "tern", "thistle", "tundra", "umber", "valley", "viper", "walnut", "willow", "wren", "yarrow",
    "yew", "zephyr", "zinnia",
];


// ---------------------------------------------------------------------------
// NameRegistry
// ---------------------------------------------------------------------------

/// Allocates names from a word pool, starting at a seeded position and
/// walking the pool in order until a free name turns up.
#[derive(Debug, Clone)]
pub struct NameRegistry {
    pool: Vec<String>,
    seed: u64,
}

impl NameRegistry {
    /// Registry over the built-in pool, seeded from the clock.
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(seed)
    }

    pub fn with_seed(seed: u64) -> Self {
        NameRegistry {
            pool: WORDS.iter().map(|w| w.to_string()).collect(),
            seed,
        }
    }

    /// Registry over a custom pool. Duplicate words are dropped.
    pub fn with_pool(words: &[&str], seed: u64) -> Self {
        let mut pool: Vec<String> = Vec::with_capacity(words.len());
        for w in words {
            if !pool.iter().any(|p| p == w) {
                pool.push(w.to_string());
            }
        }
        NameRegistry { pool, seed }
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Pick a name not in `existing`. Fails only when every pool word is
    /// taken.
    pub fn allocate_name(&self, existing: &HashSet<String>) -> Result<String, NamingError> {
        let len = self.pool.len();
        if len == 0 {
            return Err(NamingError::Exhausted { pool_size: 0 });
        }
        let start = (self.seed % len as u64) as usize;
        (0..len)
            .map(|i| &self.pool[(start + i) % len])
            .find(|name| !existing.contains(*name))
            .cloned()
            .ok_or(NamingError::Exhausted { pool_size: len })
    }
}

impl Default for NameRegistry {
    fn default() -> Self {
        Self::new()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn taken(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn builtin_pool_has_no_duplicates() {
        let unique: HashSet<&str> = WORDS.iter().copied().collect();
        assert_eq!(unique.len(), WORDS.len());
    }

    #[test]
    fn seed_picks_the_starting_word() {
        let reg = NameRegistry::with_pool(&["a", "b", "c"], 1);
        assert_eq!(reg.allocate_name(&HashSet::new()).unwrap(), "b");
    }

    #[test]
    fn skips_names_in_use() {
        let reg = NameRegistry::with_pool(&["a", "b", "c"], 1);
        assert_eq!(reg.allocate_name(&taken(&["b"])).unwrap(), "c");
        assert_eq!(reg.allocate_name(&taken(&["b", "c"])).unwrap(), "a");
    }

    #[test]
    fn never_returns_an_existing_name() {
        let reg = NameRegistry::with_seed(7);
        let mut existing = HashSet::new();
        for _ in 0..WORDS.len() {
            let name = reg.allocate_name(&existing).unwrap();
            assert!(!existing.contains(&name));
            existing.insert(name);
        }
        assert_eq!(existing.len(), WORDS.len());
    }

    #[test]
    fn exhausted_pool_is_an_error() {
        let reg = NameRegistry::with_pool(&["a", "b"], 0);
        let err = reg.allocate_name(&taken(&["a", "b"])).unwrap_err();
        assert_eq!(err, NamingError::Exhausted { pool_size: 2 });

        let empty = NameRegistry::with_pool(&[], 0);
        assert!(empty.allocate_name(&HashSet::new()).is_err());
    }

    #[test]
    fn custom_pool_drops_duplicates() {
        let reg = NameRegistry::with_pool(&["a", "a", "b"], 0);
        assert_eq!(reg.pool_size(), 2);
    }
}
