//! Hash container aliases for the pool, audit, timer, and alarm tables.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hash map used by in-use connection tables and per-controller session maps.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hash set used by membership tables.
pub type HotSet<T> = HbSet<T>;
