//! redb table definitions for the pilotwatch state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Reconciled instance records keyed by instance id.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Reconciled service records keyed by service id.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");
