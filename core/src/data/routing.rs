//! Persisted candidate table
//!
//! The walker seeds itself from these rows after a restart.

use std::net::{Ipv4Addr, SocketAddrV4};

use rusqlite::{Connection, params};

/// A persisted candidate address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub address: SocketAddrV4,
    /// Unix seconds of the last packet received, 0 when never
    pub incoming_time: i64,
    /// Unix seconds of the last packet sent, 0 when never
    pub outgoing_time: i64,
}

/// Replace the routing rows of a community
pub fn save_routing(conn: &Connection, community_id: i64, entries: &[RoutingEntry]) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM routing WHERE community_id = ?1", [community_id])?;
    for entry in entries {
        tx.execute(
            "INSERT OR REPLACE INTO routing (community_id, host, port, incoming_time, outgoing_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                community_id,
                entry.address.ip().to_string(),
                entry.address.port(),
                entry.incoming_time,
                entry.outgoing_time,
            ],
        )?;
    }
    tx.commit()
}

/// Routing rows of a community that were active at or after `since`
///
/// Rows with an unparsable host are skipped.
pub fn load_routing(conn: &Connection, community_id: i64, since: i64) -> rusqlite::Result<Vec<RoutingEntry>> {
    let mut stmt = conn.prepare(
        "SELECT host, port, incoming_time, outgoing_time FROM routing
         WHERE community_id = ?1 AND MAX(incoming_time, outgoing_time) >= ?2
         ORDER BY MAX(incoming_time, outgoing_time) DESC",
    )?;
    let rows = stmt.query_map(params![community_id, since], |row| {
        let host: String = row.get(0)?;
        let port: u16 = row.get(1)?;
        Ok((host, port, row.get::<_, i64>(2)?, row.get::<_, i64>(3)?))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (host, port, incoming_time, outgoing_time) = row?;
        match host.parse::<Ipv4Addr>() {
            Ok(ip) => entries.push(RoutingEntry {
                address: SocketAddrV4::new(ip, port),
                incoming_time,
                outgoing_time,
            }),
            Err(_) => tracing::debug!(host = %host, "skipping routing row with invalid host"),
        }
    }
    Ok(entries)
}
