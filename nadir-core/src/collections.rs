//! Collection aliases with a fast, deterministic hasher.

pub use smallvec::{smallvec, SmallVec};

pub type DefaultHashBuilder = foldhash::fast::FixedState;

pub mod hashmap {
    pub type HashMap<K, V> = hashbrown::HashMap<K, V, super::DefaultHashBuilder>;
    pub use hashbrown::hash_map::Entry;
}

pub mod hashset {
    pub type HashSet<T> = hashbrown::HashSet<T, super::DefaultHashBuilder>;
}
