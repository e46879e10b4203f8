//! Member and key persistence

use rusqlite::{Connection, OptionalExtension, params};

use crate::security::digest::mid_from_public_key;

/// A member row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRow {
    pub id: i64,
    pub mid: [u8; 20],
    pub public_key: Vec<u8>,
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemberRow> {
    let mid: Vec<u8> = row.get(1)?;
    let mid = <[u8; 20]>::try_from(mid.as_slice()).map_err(|_| {
        rusqlite::Error::InvalidColumnType(1, "mid".to_string(), rusqlite::types::Type::Blob)
    })?;
    Ok(MemberRow {
        id: row.get(0)?,
        mid,
        public_key: row.get(2)?,
    })
}

/// Get the member id for a public key, inserting the member if unseen
pub fn get_or_insert_member(conn: &Connection, public_key: &[u8]) -> rusqlite::Result<i64> {
    let mid = mid_from_public_key(public_key);
    conn.execute(
        "INSERT OR IGNORE INTO member (mid, public_key) VALUES (?1, ?2)",
        params![mid.as_slice(), public_key],
    )?;
    conn.query_row(
        "SELECT id FROM member WHERE public_key = ?1",
        [public_key],
        |row| row.get(0),
    )
}

/// Look up a member by database id
pub fn get_member(conn: &Connection, id: i64) -> rusqlite::Result<Option<MemberRow>> {
    conn.query_row(
        "SELECT id, mid, public_key FROM member WHERE id = ?1",
        [id],
        row_to_member,
    )
    .optional()
}

/// Look up a member by public key
pub fn get_member_by_public_key(
    conn: &Connection,
    public_key: &[u8],
) -> rusqlite::Result<Option<MemberRow>> {
    conn.query_row(
        "SELECT id, mid, public_key FROM member WHERE public_key = ?1",
        [public_key],
        row_to_member,
    )
    .optional()
}

/// All members sharing a mid (usually zero or one)
pub fn get_members_by_mid(conn: &Connection, mid: &[u8; 20]) -> rusqlite::Result<Vec<MemberRow>> {
    let mut stmt = conn.prepare("SELECT id, mid, public_key FROM member WHERE mid = ?1")?;
    let rows = stmt.query_map([mid.as_slice()], row_to_member)?;
    rows.collect()
}

/// Store the private half of a key we control
pub fn store_private_key(
    conn: &Connection,
    public_key: &[u8],
    private_key: &[u8; 32],
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO key (public_key, private_key) VALUES (?1, ?2)",
        params![public_key, private_key.as_slice()],
    )?;
    Ok(())
}

/// Get the private half of a key we control
pub fn get_private_key(conn: &Connection, public_key: &[u8]) -> rusqlite::Result<Option<[u8; 32]>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT private_key FROM key WHERE public_key = ?1",
            [public_key],
            |row| row.get(0),
        )
        .optional()?;

    match bytes {
        None => Ok(None),
        Some(bytes) => <[u8; 32]>::try_from(bytes.as_slice())
            .map(Some)
            .map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "private_key".to_string(),
                    rusqlite::types::Type::Blob,
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::start::start_memory_db;

    #[test]
    fn test_get_or_insert_member_is_idempotent() {
        let conn = start_memory_db().unwrap();
        let a = get_or_insert_member(&conn, &[1; 32]).unwrap();
        let b = get_or_insert_member(&conn, &[1; 32]).unwrap();
        let c = get_or_insert_member(&conn, &[2; 32]).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_lookup_by_mid() {
        let conn = start_memory_db().unwrap();
        let id = get_or_insert_member(&conn, &[3; 32]).unwrap();
        let mid = mid_from_public_key(&[3; 32]);

        let members = get_members_by_mid(&conn, &mid).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, id);
        assert_eq!(members[0].public_key, vec![3; 32]);

        assert!(get_members_by_mid(&conn, &[0; 20]).unwrap().is_empty());
    }

    #[test]
    fn test_get_member() {
        let conn = start_memory_db().unwrap();
        let id = get_or_insert_member(&conn, &[4; 32]).unwrap();

        let row = get_member(&conn, id).unwrap().unwrap();
        assert_eq!(row.mid, mid_from_public_key(&[4; 32]));
        assert!(get_member(&conn, id + 100).unwrap().is_none());
        assert_eq!(get_member_by_public_key(&conn, &[4; 32]).unwrap(), Some(row));
    }

    #[test]
    fn test_private_keys() {
        let conn = start_memory_db().unwrap();
        assert!(get_private_key(&conn, &[5; 32]).unwrap().is_none());

        store_private_key(&conn, &[5; 32], &[6; 32]).unwrap();
        assert_eq!(get_private_key(&conn, &[5; 32]).unwrap(), Some([6; 32]));
    }
}
