//! Persistent meta message ids

use rusqlite::{Connection, params};

/// Get the database id of a meta message, allocating it on first sight
///
/// Cluster, priority and direction are refreshed on every call so the
/// sync queries always see the current definition.
pub fn get_or_insert_meta_message(
    conn: &Connection,
    community_id: i64,
    name: &str,
    cluster: u8,
    priority: u8,
    direction: i8,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO meta_message (community_id, name, cluster, priority, direction)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (community_id, name) DO UPDATE SET
            cluster = excluded.cluster,
            priority = excluded.priority,
            direction = excluded.direction",
        params![community_id, name, cluster, priority, direction],
    )?;
    conn.query_row(
        "SELECT id FROM meta_message WHERE community_id = ?1 AND name = ?2",
        params![community_id, name],
        |row| row.get(0),
    )
}
