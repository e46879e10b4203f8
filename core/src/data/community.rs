//! Community rows

use rusqlite::{Connection, OptionalExtension, params};

/// A persisted community
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommunityRow {
    pub id: i64,
    pub cid: [u8; 20],
    pub master_member_id: i64,
    pub my_member_id: i64,
    pub classification: String,
    pub public_key: Vec<u8>,
    pub auto_load: bool,
    /// `Some(0)` after a soft kill, `Some(1)` after a hard kill
    pub destroyed_degree: Option<u8>,
    pub destroyed_global_time: Option<u64>,
}

const COMMUNITY_COLUMNS: &str = "id, cid, master_member_id, my_member_id, classification, \
     public_key, auto_load, destroyed_degree, destroyed_global_time";

fn row_to_community(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommunityRow> {
    let cid: Vec<u8> = row.get(1)?;
    let cid = <[u8; 20]>::try_from(cid.as_slice()).map_err(|_| {
        rusqlite::Error::InvalidColumnType(1, "cid".to_string(), rusqlite::types::Type::Blob)
    })?;
    let destroyed_global_time: Option<i64> = row.get(8)?;
    Ok(CommunityRow {
        id: row.get(0)?,
        cid,
        master_member_id: row.get(2)?,
        my_member_id: row.get(3)?,
        classification: row.get(4)?,
        public_key: row.get(5)?,
        auto_load: row.get(6)?,
        destroyed_degree: row.get(7)?,
        destroyed_global_time: destroyed_global_time.map(|t| t as u64),
    })
}

/// Insert a community row, returning its id
pub fn insert_community(
    conn: &Connection,
    cid: &[u8; 20],
    master_member_id: i64,
    my_member_id: i64,
    classification: &str,
    public_key: &[u8],
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO community (cid, master_member_id, my_member_id, classification, public_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            cid.as_slice(),
            master_member_id,
            my_member_id,
            classification,
            public_key
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Look up a community by cid
pub fn get_community_by_cid(conn: &Connection, cid: &[u8; 20]) -> rusqlite::Result<Option<CommunityRow>> {
    conn.query_row(
        &format!("SELECT {} FROM community WHERE cid = ?1", COMMUNITY_COLUMNS),
        [cid.as_slice()],
        row_to_community,
    )
    .optional()
}

/// All communities flagged for loading at startup
pub fn get_auto_load_communities(conn: &Connection) -> rusqlite::Result<Vec<CommunityRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM community WHERE auto_load = 1 ORDER BY id",
        COMMUNITY_COLUMNS
    ))?;
    let rows = stmt.query_map([], row_to_community)?;
    rows.collect()
}

/// Set whether a community is loaded at startup
pub fn set_auto_load(conn: &Connection, community_id: i64, auto_load: bool) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE community SET auto_load = ?1 WHERE id = ?2",
        params![auto_load, community_id],
    )?;
    Ok(())
}

/// Record that a community was destroyed
pub fn set_destroyed(
    conn: &Connection,
    community_id: i64,
    degree: u8,
    global_time: u64,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE community SET destroyed_degree = ?1, destroyed_global_time = ?2 WHERE id = ?3",
        params![degree, global_time as i64, community_id],
    )?;
    Ok(())
}
