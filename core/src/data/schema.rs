//! Database schema definitions for the Dispersy store
//!
//! The store is append-only for messages: rows in `sync` are never rewritten
//! except for the `undone` flag and the deletions performed by last-sync
//! eviction and hard-kill reclamation.

use rusqlite::Connection;

/// Creates all required database tables
pub fn create_all_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_local_member_table(conn)?;
    create_member_tables(conn)?;
    create_community_table(conn)?;
    create_meta_message_table(conn)?;
    create_sync_table(conn)?;
    create_routing_table(conn)?;
    Ok(())
}

/// Local member table: stores this node's own member key pair
///
/// Only one row should exist. Both keys are 32 bytes (Ed25519).
pub fn create_local_member_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS local_member (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            private_key BLOB NOT NULL CHECK (length(private_key) = 32),
            public_key BLOB NOT NULL CHECK (length(public_key) = 32),
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;
    Ok(())
}

/// Member and key tables
///
/// `member` holds every public key we have seen, `key` the private halves of
/// the keys we control (our own member and the masters of communities we
/// created).
pub fn create_member_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS member (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            mid BLOB NOT NULL CHECK (length(mid) = 20),
            public_key BLOB NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_member_mid ON member(mid)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS key (
            public_key BLOB PRIMARY KEY NOT NULL,
            private_key BLOB NOT NULL CHECK (length(private_key) = 32)
        )",
        [],
    )?;

    Ok(())
}

/// Community table
///
/// `destroyed_degree` is NULL for live communities, 0 after a soft kill and
/// 1 after a hard kill.
pub fn create_community_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS community (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            master_member_id INTEGER NOT NULL REFERENCES member(id),
            my_member_id INTEGER NOT NULL REFERENCES member(id),
            classification TEXT NOT NULL,
            cid BLOB NOT NULL UNIQUE CHECK (length(cid) = 20),
            public_key BLOB NOT NULL,
            auto_load INTEGER NOT NULL DEFAULT 1,
            destroyed_degree INTEGER,
            destroyed_global_time INTEGER,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;
    Ok(())
}

/// Meta message table: persistent integer ids for message kinds
///
/// `direction` is 1 for ASC and -1 for DESC synchronization.
pub fn create_meta_message_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta_message (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            community_id INTEGER NOT NULL REFERENCES community(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            cluster INTEGER NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 128,
            direction INTEGER NOT NULL DEFAULT 1,
            UNIQUE (community_id, name)
        )",
        [],
    )?;
    Ok(())
}

/// Sync table: every stored packet
///
/// A packet is identified by (community, member, global_time). For
/// multi-member messages `member_id` is the first signer.
pub fn create_sync_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            community_id INTEGER NOT NULL REFERENCES community(id) ON DELETE CASCADE,
            member_id INTEGER NOT NULL REFERENCES member(id),
            meta_message_id INTEGER NOT NULL REFERENCES meta_message(id),
            global_time INTEGER NOT NULL,
            sequence INTEGER,
            undone INTEGER NOT NULL DEFAULT 0,
            packet BLOB NOT NULL,
            UNIQUE (community_id, member_id, global_time)
        )",
        [],
    )?;

    // Covering index for sync range queries per meta message
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_meta_time
         ON sync(community_id, meta_message_id, global_time)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_time ON sync(community_id, global_time)",
        [],
    )?;

    Ok(())
}

/// Routing table: candidate addresses per community, survives restart
///
/// Times are unix seconds, 0 when never seen.
pub fn create_routing_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS routing (
            community_id INTEGER NOT NULL REFERENCES community(id) ON DELETE CASCADE,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            incoming_time INTEGER NOT NULL DEFAULT 0,
            outgoing_time INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (community_id, host, port)
        )",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn test_create_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();

        let tables = table_names(&conn);
        for expected in [
            "community",
            "key",
            "local_member",
            "member",
            "meta_message",
            "routing",
            "sync",
        ] {
            assert!(tables.contains(&expected.to_string()), "{} missing", expected);
        }
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();
        create_all_tables(&conn).unwrap();
    }

    #[test]
    fn test_sync_unique_member_global_time() {
        let conn = Connection::open_in_memory().unwrap();
        create_all_tables(&conn).unwrap();

        conn.execute_batch(
            "INSERT INTO member (id, mid, public_key) VALUES (1, zeroblob(20), x'01');
             INSERT INTO community (id, master_member_id, my_member_id, classification, cid, public_key)
                VALUES (1, 1, 1, 'test', zeroblob(20), x'01');
             INSERT INTO meta_message (id, community_id, name) VALUES (1, 1, 'text');
             INSERT INTO sync (community_id, member_id, meta_message_id, global_time, packet)
                VALUES (1, 1, 1, 5, x'00');",
        )
        .unwrap();

        let duplicate = conn.execute(
            "INSERT INTO sync (community_id, member_id, meta_message_id, global_time, packet)
             VALUES (1, 1, 1, 5, x'01')",
            [],
        );
        assert!(duplicate.is_err());
    }
}
