//! Tuning knobs for the address index.

use crate::index::MAX_HEIGHT;

/// Configuration used to create a [`CodeRegistry`](crate::CodeRegistry) or
/// one of its maps.
///
/// This structure exposes a builder-like interface. The defaults are suitable
/// for a JIT that keeps up to a few hundred thousand live regions.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) max_height: usize,
    pub(crate) chunk_size: usize,
    pub(crate) seed: u64,
    pub(crate) max_nodes: u32,
}

impl Config {
    /// Creates a new configuration object with the default configuration.
    pub fn new() -> Config {
        Config {
            max_height: 12,
            chunk_size: 64,
            seed: 0x6a69_746d_6170,
            max_nodes: u32::MAX,
        }
    }

    /// Configures the maximum number of levels in the skip lists backing the
    /// code and depth maps.
    ///
    /// Lookups visit at most a couple of nodes per level, so this bounds the
    /// time a profiler spends per lookup. Values are clamped to `1..=16`.
    ///
    /// By default this option is 12.
    pub fn max_height(&mut self, height: usize) -> &mut Self {
        self.max_height = height.clamp(1, MAX_HEIGHT);
        self
    }

    /// Configures how many index nodes the first pool chunk holds.
    ///
    /// Each further chunk doubles in size. Chunks are never moved or freed
    /// while the index is alive, which is what lets readers follow node
    /// references without synchronizing with the writer. The value is
    /// rounded up to a power of two.
    ///
    /// By default this option is 64.
    pub fn chunk_size(&mut self, nodes: usize) -> &mut Self {
        self.chunk_size = nodes.max(1).next_power_of_two();
        self
    }

    /// Seeds the generator used to pick skip-list node heights.
    ///
    /// Two indexes built from the same seed and the same sequence of
    /// mutations have identical shapes.
    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    /// Caps the number of index nodes each map may ever allocate.
    ///
    /// Nodes that were removed and recycled count once. Registrations that
    /// would need more nodes fail with
    /// [`OutOfMemory`](crate::OutOfMemory) and leave the map as it was.
    ///
    /// By default the only limit is the size of a node reference.
    pub fn max_nodes(&mut self, nodes: u32) -> &mut Self {
        self.max_nodes = nodes;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_and_rounds() {
        let mut config = Config::new();
        config.max_height(0).chunk_size(100);
        assert_eq!(config.max_height, 1);
        assert_eq!(config.chunk_size, 128);

        config.max_height(1000).chunk_size(0);
        assert_eq!(config.max_height, MAX_HEIGHT);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.max_nodes, u32::MAX);
        config.max_nodes(3);
        assert_eq!(config.max_nodes, 3);
    }
}
