//! Redb table definitions for the physical keyspace.

use redb::TableDefinition;

// Every namespace, index and config key shares this one ordered table;
// namespaces are separated by key prefix, not by table.
pub const KV: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");
