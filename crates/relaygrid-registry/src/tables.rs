//! redb table definitions for the node registry.

use redb::TableDefinition;

/// Node records keyed by node name.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Registry counters (`next_seq`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the insertion-order counter in [`META`].
pub const NEXT_SEQ: &str = "next_seq";
