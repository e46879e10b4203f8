//! Stored packets
//!
//! Every synchronized message lives in the `sync` table together with the
//! integer handles of its community, author and meta message. Queries here
//! return raw packet bytes; decoding is left to the conversion layer.

use rusqlite::{Connection, OptionalExtension, params};

/// A packet about to be stored
#[derive(Debug, Clone)]
pub struct NewPacket<'a> {
    pub community_id: i64,
    pub member_id: i64,
    pub meta_message_id: i64,
    pub global_time: u64,
    pub sequence: Option<u32>,
    pub packet: &'a [u8],
}

/// A stored packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPacket {
    pub id: i64,
    pub member_id: i64,
    pub meta_message_id: i64,
    pub global_time: u64,
    pub sequence: Option<u32>,
    pub undone: bool,
    pub packet: Vec<u8>,
}

const STORED_COLUMNS: &str =
    "id, member_id, meta_message_id, global_time, sequence, undone, packet";

fn row_to_stored(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredPacket> {
    let global_time: i64 = row.get(3)?;
    let undone: i64 = row.get(5)?;
    Ok(StoredPacket {
        id: row.get(0)?,
        member_id: row.get(1)?,
        meta_message_id: row.get(2)?,
        global_time: global_time as u64,
        sequence: row.get(4)?,
        undone: undone != 0,
        packet: row.get(6)?,
    })
}

/// Insert a packet, returning its packet id
pub fn insert_packet(conn: &Connection, packet: &NewPacket<'_>) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO sync (community_id, member_id, meta_message_id, global_time, sequence, packet)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            packet.community_id,
            packet.member_id,
            packet.meta_message_id,
            packet.global_time as i64,
            packet.sequence,
            packet.packet,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The packet a member stored at a global time, if any
pub fn get_packet_at(
    conn: &Connection,
    community_id: i64,
    member_id: i64,
    global_time: u64,
) -> rusqlite::Result<Option<StoredPacket>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM sync WHERE community_id = ?1 AND member_id = ?2 AND global_time = ?3",
            STORED_COLUMNS
        ),
        params![community_id, member_id, global_time as i64],
        row_to_stored,
    )
    .optional()
}

/// Packets a member stored at any of the given global times
pub fn get_packets_at(
    conn: &Connection,
    community_id: i64,
    member_id: i64,
    global_times: &[u64],
) -> rusqlite::Result<Vec<StoredPacket>> {
    let mut packets = Vec::with_capacity(global_times.len());
    for &global_time in global_times {
        if let Some(packet) = get_packet_at(conn, community_id, member_id, global_time)? {
            packets.push(packet);
        }
    }
    Ok(packets)
}

/// Highest stored sequence number of (member, meta), 0 when none
pub fn highest_sequence(
    conn: &Connection,
    community_id: i64,
    member_id: i64,
    meta_message_id: i64,
) -> rusqlite::Result<u32> {
    let highest: Option<u32> = conn.query_row(
        "SELECT MAX(sequence) FROM sync
         WHERE community_id = ?1 AND member_id = ?2 AND meta_message_id = ?3",
        params![community_id, member_id, meta_message_id],
        |row| row.get(0),
    )?;
    Ok(highest.unwrap_or(0))
}

/// Stored packets of (member, meta) with sequence numbers in `[low, high]`
pub fn get_packets_by_sequence(
    conn: &Connection,
    community_id: i64,
    member_id: i64,
    meta_message_id: i64,
    low: u32,
    high: u32,
) -> rusqlite::Result<Vec<StoredPacket>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sync
         WHERE community_id = ?1 AND member_id = ?2 AND meta_message_id = ?3
           AND sequence BETWEEN ?4 AND ?5
         ORDER BY sequence",
        STORED_COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![community_id, member_id, meta_message_id, low, high],
        row_to_stored,
    )?;
    rows.collect()
}

/// Stored packets counted against a last-sync history, oldest first
///
/// A non-zero `cluster` groups every meta message of the community sharing
/// that cluster; cluster 0 counts the meta message on its own.
pub fn get_last_sync_history(
    conn: &Connection,
    community_id: i64,
    member_id: i64,
    meta_message_id: i64,
    cluster: u8,
) -> rusqlite::Result<Vec<StoredPacket>> {
    if cluster == 0 {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sync
             WHERE community_id = ?1 AND member_id = ?2 AND meta_message_id = ?3
             ORDER BY global_time",
            STORED_COLUMNS
        ))?;
        let rows = stmt.query_map(params![community_id, member_id, meta_message_id], row_to_stored)?;
        return rows.collect();
    }

    let mut stmt = conn.prepare(
        "SELECT sync.id, sync.member_id, sync.meta_message_id, sync.global_time,
                sync.sequence, sync.undone, sync.packet
         FROM sync JOIN meta_message ON meta_message.id = sync.meta_message_id
         WHERE sync.community_id = ?1 AND sync.member_id = ?2 AND meta_message.cluster = ?3
         ORDER BY sync.global_time",
    )?;
    let rows = stmt.query_map(params![community_id, member_id, cluster], row_to_stored)?;
    rows.collect()
}

/// The newest `count` packets of (member, meta), newest first
pub fn get_newest_packets(
    conn: &Connection,
    community_id: i64,
    member_id: i64,
    meta_message_id: i64,
    count: u32,
) -> rusqlite::Result<Vec<StoredPacket>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sync
         WHERE community_id = ?1 AND member_id = ?2 AND meta_message_id = ?3
         ORDER BY global_time DESC LIMIT ?4",
        STORED_COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![community_id, member_id, meta_message_id, count],
        row_to_stored,
    )?;
    rows.collect()
}

/// Every packet of one meta message, in global time order
pub fn get_packets_of_meta(
    conn: &Connection,
    community_id: i64,
    meta_message_id: i64,
) -> rusqlite::Result<Vec<StoredPacket>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sync WHERE community_id = ?1 AND meta_message_id = ?2
         ORDER BY global_time, id",
        STORED_COLUMNS
    ))?;
    let rows = stmt.query_map(params![community_id, meta_message_id], row_to_stored)?;
    rows.collect()
}

/// Global time and bytes of every stored packet, in global time order
pub fn get_all_packets(conn: &Connection, community_id: i64) -> rusqlite::Result<Vec<(u64, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        "SELECT global_time, packet FROM sync WHERE community_id = ?1 ORDER BY global_time, id",
    )?;
    let rows = stmt.query_map([community_id], |row| {
        let global_time: i64 = row.get(0)?;
        Ok((global_time as u64, row.get(1)?))
    })?;
    rows.collect()
}

/// A sync response candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRow {
    pub global_time: u64,
    pub priority: u8,
    pub packet: Vec<u8>,
}

/// Packets in `[time_low, time_high)` eligible for synchronization
///
/// `time_high = None` means unbounded. Ordered by priority (highest first),
/// then by each meta message's direction over global time.
pub fn get_sync_packets(
    conn: &Connection,
    community_id: i64,
    time_low: u64,
    time_high: Option<u64>,
    min_priority: u8,
) -> rusqlite::Result<Vec<SyncRow>> {
    let low = i64::try_from(time_low).unwrap_or(i64::MAX);
    let high = time_high.map_or(i64::MAX, |t| i64::try_from(t).unwrap_or(i64::MAX));
    let mut stmt = conn.prepare(
        "SELECT sync.global_time, meta_message.priority, sync.packet
         FROM sync JOIN meta_message ON meta_message.id = sync.meta_message_id
         WHERE sync.community_id = ?1
           AND sync.global_time >= ?2 AND sync.global_time < ?3
           AND meta_message.priority >= ?4
         ORDER BY meta_message.priority DESC,
                  sync.global_time * meta_message.direction,
                  sync.id",
    )?;
    let rows = stmt.query_map(
        params![community_id, low, high, min_priority],
        |row| {
            let global_time: i64 = row.get(0)?;
            Ok(SyncRow {
                global_time: global_time as u64,
                priority: row.get(1)?,
                packet: row.get(2)?,
            })
        },
    )?;
    rows.collect()
}

/// Highest stored global time of a community, 0 when empty
pub fn max_global_time(conn: &Connection, community_id: i64) -> rusqlite::Result<u64> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(global_time) FROM sync WHERE community_id = ?1",
        [community_id],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0) as u64)
}

/// Number of stored packets of a meta message
pub fn count_packets(conn: &Connection, community_id: i64, meta_message_id: i64) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync WHERE community_id = ?1 AND meta_message_id = ?2",
        params![community_id, meta_message_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Number of stored packets of a community
pub fn count_all_packets(conn: &Connection, community_id: i64) -> rusqlite::Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync WHERE community_id = ?1",
        [community_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Flag or unflag a packet as undone
pub fn set_undone(conn: &Connection, packet_id: i64, undone: bool) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE sync SET undone = ?1 WHERE id = ?2",
        params![undone as i64, packet_id],
    )?;
    Ok(())
}

/// Delete one packet
pub fn delete_packet(conn: &Connection, packet_id: i64) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM sync WHERE id = ?1", [packet_id])?;
    Ok(())
}

/// Delete every packet of a community except the listed ones
pub fn delete_packets_except(
    conn: &Connection,
    community_id: i64,
    keep: &[i64],
) -> rusqlite::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM sync WHERE community_id = ?1")?;
        let rows = stmt.query_map([community_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<i64>>>()?
    };

    let mut deleted = 0;
    for id in ids.into_iter().filter(|id| !keep.contains(id)) {
        deleted += tx.execute("DELETE FROM sync WHERE id = ?1", [id])?;
    }
    tx.commit()?;
    Ok(deleted)
}
