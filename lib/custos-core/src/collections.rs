//! Hash-based collections using a fast, non-cryptographic hasher.

/// Fast build hasher.
pub type FastBuildHasher = foldhash::quality::RandomState;

/// A hash map based on the standard library's implementation using [`FastBuildHasher`].
pub type FastHashMap<K, V> = std::collections::HashMap<K, V, FastBuildHasher>;

/// An insertion-ordered hash map based on `indexmap` using [`FastBuildHasher`].
pub type FastIndexMap<K, V> = indexmap::IndexMap<K, V, FastBuildHasher>;
