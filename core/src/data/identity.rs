//! Local member identity
//!
//! The node's own member key pair is generated once on first run and kept in
//! the `local_member` table. Its public key is also registered in `member`
//! and its private half in `key`, so it resolves like any other member.

use rand::RngCore;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use crate::security::create_key_pair::{KeyPair, key_pair_from_bytes, key_pair_from_rng};

use super::member::store_private_key;

/// Get the local member key pair, creating one if it doesn't exist
///
/// The random source is only used on first run.
pub fn get_or_create_local_member<R: RngCore>(
    conn: &Connection,
    rng: &mut R,
) -> rusqlite::Result<KeyPair> {
    if let Some(key_pair) = get_local_member(conn)? {
        return Ok(key_pair);
    }

    let key_pair = key_pair_from_rng(rng);
    match store_local_member(conn, &key_pair) {
        Ok(()) => {}
        // If another process created the member first, recover by loading it.
        Err(rusqlite::Error::SqliteFailure(ref sqlite_err, _))
            if sqlite_err.code == ErrorCode::ConstraintViolation => {}
        Err(e) => return Err(e),
    }

    get_local_member(conn)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

/// Get the existing local member key pair, if any
pub fn get_local_member(conn: &Connection) -> rusqlite::Result<Option<KeyPair>> {
    conn.query_row(
        "SELECT private_key, public_key FROM local_member WHERE id = 1",
        [],
        |row| {
            let private_key = blob_to_key(row.get(0)?, 0, "private_key")?;
            let public_key = blob_to_key(row.get(1)?, 1, "public_key")?;

            let key_pair = key_pair_from_bytes(&private_key);
            if key_pair.public_key != public_key {
                return Err(rusqlite::Error::InvalidColumnType(
                    1,
                    "public_key".to_string(),
                    rusqlite::types::Type::Blob,
                ));
            }
            Ok(key_pair)
        },
    )
    .optional()
}

fn store_local_member(conn: &Connection, key_pair: &KeyPair) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO local_member (id, private_key, public_key) VALUES (1, ?1, ?2)",
        params![
            key_pair.private_key.as_slice(),
            key_pair.public_key.as_slice(),
        ],
    )?;
    store_private_key(conn, &key_pair.public_key, &key_pair.private_key)?;
    Ok(())
}

fn blob_to_key(bytes: Vec<u8>, index: usize, name: &str) -> rusqlite::Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        rusqlite::Error::InvalidColumnType(index, name.to_string(), rusqlite::types::Type::Blob)
    })
}
