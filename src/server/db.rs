use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use sha2::{Digest, Sha256};

/// Result of folding one submitted record into the store. The per-dp state
/// machine is absent -> stored -> collided, and collided is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DpOutcome {
    /// First sighting of this dp.
    Inserted,
    /// Same (dp, start) as an existing row.
    Duplicate,
    /// Same dp, different start: a pre-collision. Carries the stored start.
    NewCollision { existing_start: Vec<u8> },
    /// The dp already collided earlier; accepted for audit only.
    AlreadyCollided,
}

#[derive(Debug, Clone)]
pub struct CollisionRow {
    pub dp: Vec<u8>,
    pub start_a: Vec<u8>,
    pub start_b: Vec<u8>,
    pub detected_at: i64,
}

#[derive(Debug, Clone)]
pub struct RecentDp {
    pub username: String,
    pub start: Vec<u8>,
    pub dp: Vec<u8>,
    pub received_at: i64,
}

/// SQLite-backed store for users, distinguished points, and collisions.
/// A single connection behind a mutex; each submitted batch folds inside
/// one immediate transaction, so concurrent submitters of the same dp
/// linearize and produce exactly one collision row.
pub struct CollisionStore {
    conn: Mutex<Connection>,
}

impl CollisionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users(
                 username   TEXT PRIMARY KEY,
                 token_hash TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS dps(
                 dp          BLOB PRIMARY KEY,
                 start       BLOB NOT NULL,
                 username    TEXT NOT NULL,
                 received_at INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS dps_received_at ON dps(received_at);
             CREATE INDEX IF NOT EXISTS dps_username ON dps(username);
             CREATE TABLE IF NOT EXISTS collisions(
                 dp          BLOB PRIMARY KEY,
                 start_a     BLOB NOT NULL,
                 start_b     BLOB NOT NULL,
                 detected_at INTEGER NOT NULL
             );",
        )
        .context("failed to initialize schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_user(&self, username: &str, token: &str) -> Result<()> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (username, token_hash) VALUES (?1, ?2)",
            params![username, token_hash(token)],
        )?;
        if inserted == 0 {
            return Err(anyhow!("user '{username}' already exists"));
        }
        Ok(())
    }

    pub fn authenticate(&self, username: &str, token: &str) -> Result<bool> {
        let conn = self.lock()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT token_hash FROM users WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.is_some_and(|hash| hash == token_hash(token)))
    }

    /// Fold one `(start, dp)` record into the store.
    pub fn insert_dp(&self, dp: &[u8], start: &[u8], username: &str) -> Result<DpOutcome> {
        let mut outcomes = self.insert_batch(&[(dp.to_vec(), start.to_vec())], username)?;
        Ok(outcomes.pop().expect("one outcome per record"))
    }

    /// Fold a batch of `(dp, start)` records into the store under one
    /// immediate transaction, so a request either lands whole or not at
    /// all and concurrent submitters of the same dp linearize.
    pub fn insert_batch(
        &self,
        records: &[(Vec<u8>, Vec<u8>)],
        username: &str,
    ) -> Result<Vec<DpOutcome>> {
        let now = unix_now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut outcomes = Vec::with_capacity(records.len());
        for (dp, start) in records {
            outcomes.push(fold_record(&tx, dp, start, username, now)?);
        }

        tx.commit()?;
        Ok(outcomes)
    }

    pub fn dp_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM dps", [], |row| row.get(0))?)
    }

    /// Distinguished points received within the last `window_secs` seconds.
    pub fn recent_dp_count(&self, window_secs: i64) -> Result<u64> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM dps WHERE received_at > ?1",
            params![unix_now() - window_secs],
            |row| row.get(0),
        )?)
    }

    pub fn collision_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM collisions", [], |row| row.get(0))?)
    }

    /// Per-user stored-dp counts, busiest first.
    pub fn users_by_dp_count(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT u.username, COUNT(d.dp)
             FROM users u LEFT JOIN dps d ON d.username = u.username
             GROUP BY u.username
             ORDER BY COUNT(d.dp) DESC, u.username",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn recent_dps(&self, limit: u32) -> Result<Vec<RecentDp>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT username, start, dp, received_at FROM dps
             ORDER BY received_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(RecentDp {
                    username: row.get(0)?,
                    start: row.get(1)?,
                    dp: row.get(2)?,
                    received_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn collisions(&self) -> Result<Vec<CollisionRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT dp, start_a, start_b, detected_at FROM collisions ORDER BY detected_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CollisionRow {
                    dp: row.get(0)?,
                    start_a: row.get(1)?,
                    start_b: row.get(2)?,
                    detected_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("collision store lock poisoned"))
    }
}

fn fold_record(
    tx: &rusqlite::Transaction<'_>,
    dp: &[u8],
    start: &[u8],
    username: &str,
    now: i64,
) -> Result<DpOutcome> {
    let existing: Option<Vec<u8>> = tx
        .query_row("SELECT start FROM dps WHERE dp = ?1", params![dp], |row| {
            row.get(0)
        })
        .optional()?;

    let outcome = match existing {
        None => {
            tx.execute(
                "INSERT INTO dps (dp, start, username, received_at) VALUES (?1, ?2, ?3, ?4)",
                params![dp, start, username, now],
            )?;
            DpOutcome::Inserted
        }
        Some(ref stored) if stored == start => DpOutcome::Duplicate,
        Some(stored) => {
            let created = tx.execute(
                "INSERT OR IGNORE INTO collisions (dp, start_a, start_b, detected_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![dp, stored, start, now],
            )?;
            if created > 0 {
                DpOutcome::NewCollision {
                    existing_start: stored,
                }
            } else {
                DpOutcome::AlreadyCollided
            }
        }
    };
    Ok(outcome)
}

fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn store_with_user(name: &str, token: &str) -> CollisionStore {
        let store = CollisionStore::open_in_memory().expect("in-memory store");
        store.create_user(name, token).expect("user created");
        store
    }

    #[test]
    fn authentication_checks_username_and_token() {
        let store = store_with_user("alice", "secret");
        assert!(store.authenticate("alice", "secret").expect("auth query"));
        assert!(!store.authenticate("alice", "wrong").expect("auth query"));
        assert!(!store.authenticate("bob", "secret").expect("auth query"));
    }

    #[test]
    fn duplicate_users_are_rejected() {
        let store = store_with_user("alice", "secret");
        assert!(store.create_user("alice", "other").is_err());
    }

    #[test]
    fn insert_walks_the_dp_state_machine() {
        let store = store_with_user("alice", "secret");
        let dp = vec![0u8, 0, 1, 2, 3];
        let start_a = vec![0x80, 1, 2, 3, 4];
        let start_b = vec![0x80, 9, 9, 9, 9];

        assert_eq!(
            store.insert_dp(&dp, &start_a, "alice").expect("insert"),
            DpOutcome::Inserted
        );
        assert_eq!(
            store.insert_dp(&dp, &start_a, "alice").expect("insert"),
            DpOutcome::Duplicate
        );
        assert_eq!(
            store.insert_dp(&dp, &start_b, "alice").expect("insert"),
            DpOutcome::NewCollision {
                existing_start: start_a.clone()
            }
        );
        // Terminal: a third distinct start is audited, no new collision.
        assert_eq!(
            store
                .insert_dp(&dp, &[0x80, 7, 7, 7, 7], "alice")
                .expect("insert"),
            DpOutcome::AlreadyCollided
        );

        assert_eq!(store.dp_count().expect("count"), 1);
        let collisions = store.collisions().expect("collisions");
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].dp, dp);
        assert_eq!(collisions[0].start_a, start_a);
        assert_eq!(collisions[0].start_b, start_b);
    }

    #[test]
    fn batch_insert_reports_per_record_outcomes() {
        let store = store_with_user("alice", "secret");
        let dp = vec![0u8, 0, 1, 1, 1];
        let records = vec![
            (dp.clone(), vec![0x80, 1, 1, 1, 1]),
            (dp.clone(), vec![0x80, 1, 1, 1, 1]),
            (dp.clone(), vec![0x80, 2, 2, 2, 2]),
        ];
        let outcomes = store.insert_batch(&records, "alice").expect("batch");
        assert_eq!(
            outcomes,
            vec![
                DpOutcome::Inserted,
                DpOutcome::Duplicate,
                DpOutcome::NewCollision {
                    existing_start: vec![0x80, 1, 1, 1, 1]
                },
            ]
        );
    }

    #[test]
    fn concurrent_same_dp_submissions_create_one_collision() {
        let store = Arc::new(store_with_user("alice", "secret"));
        let dp = vec![0u8, 0, 0xAA, 0xBB, 0xCC];

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                let dp = dp.clone();
                thread::spawn(move || {
                    store
                        .insert_dp(&dp, &[0x80, i, i, i, i], "alice")
                        .expect("insert")
                })
            })
            .collect();
        let outcomes: Vec<DpOutcome> = handles
            .into_iter()
            .map(|h| h.join().expect("thread joined"))
            .collect();

        let inserted = outcomes
            .iter()
            .filter(|o| matches!(o, DpOutcome::Inserted))
            .count();
        let collided = outcomes
            .iter()
            .filter(|o| matches!(o, DpOutcome::NewCollision { .. }))
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(collided, 1);

        let collisions = store.collisions().expect("collisions");
        assert_eq!(collisions.len(), 1);
        // Both halves of the collision come from the submitted set.
        for start in [&collisions[0].start_a, &collisions[0].start_b] {
            assert_eq!(start.len(), 5);
            assert_eq!(start[0], 0x80);
        }
        assert_ne!(collisions[0].start_a, collisions[0].start_b);
    }

    #[test]
    fn stats_reflect_inserts() {
        let store = store_with_user("alice", "secret");
        store.create_user("bob", "token").expect("second user");
        store
            .insert_dp(&[0, 0, 1, 1, 1], &[0x80, 1, 1, 1, 1], "alice")
            .expect("insert");
        store
            .insert_dp(&[0, 0, 2, 2, 2], &[0x80, 2, 2, 2, 2], "alice")
            .expect("insert");
        store
            .insert_dp(&[0, 0, 3, 3, 3], &[0x80, 3, 3, 3, 3], "bob")
            .expect("insert");

        assert_eq!(store.dp_count().expect("count"), 3);
        assert_eq!(store.recent_dp_count(60).expect("recent"), 3);
        assert_eq!(store.collision_count().expect("collisions"), 0);

        let users = store.users_by_dp_count().expect("users");
        assert_eq!(users[0], ("alice".to_string(), 2));
        assert_eq!(users[1], ("bob".to_string(), 1));

        let recent = store.recent_dps(2).expect("recent dps");
        assert_eq!(recent.len(), 2);
    }
}
