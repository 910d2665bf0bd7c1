use crate::AccountId;
use crate::error::BridgeError;
use crate::session::{ConnectionSession, decode_key_hex};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tonconnect_crypto::{CryptoError, KEY_BYTES, StoreKey};
use zeroize::Zeroizing;

/// Durable (account, peer) session records.
///
/// Cheap to clone. All operations use `std::sync::Mutex` + `spawn_blocking`
/// so synchronous SQLite I/O never runs on the async workers.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    conn: StdMutex<Connection>,
    key: StoreKey,
}

/// A stored row before its secret is unsealed.
struct RawRow {
    account_id: AccountId,
    peer_client_id: String,
    wallet_public_key: String,
    wallet_secret_key: String,
    last_request_id: i64,
}

impl SessionStore {
    /// Open the store at `path`, or an in-memory database for `None`.
    pub fn open(path: Option<&Path>, key: StoreKey) -> Result<Self, BridgeError> {
        let conn = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| BridgeError::Storage(format!("create {}: {e}", parent.display())))?;
                }
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };

        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS connect (
                account_id        INTEGER NOT NULL,
                peer_client_id    TEXT NOT NULL,
                wallet_public_key TEXT NOT NULL,
                wallet_secret_key TEXT NOT NULL,
                last_request_id   INTEGER NOT NULL DEFAULT -1,
                UNIQUE (account_id, peer_client_id)
            );
            CREATE INDEX IF NOT EXISTS idx_connect_account ON connect(account_id);",
        )?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM connect", [], |row| row.get(0))
            .unwrap_or(0);
        if count > 0 {
            tracing::info!(count, "loaded bridge sessions from disk");
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: StdMutex::new(conn),
                key,
            }),
        })
    }

    /// Insert `session` unless a row for its (account, peer) already exists.
    ///
    /// Returns whether a row was inserted. An existing row keeps its keys and
    /// `last_request_id`.
    pub async fn upsert(&self, session: &ConnectionSession) -> Result<bool, BridgeError> {
        let account_id = session.account_id;
        let peer = session.peer_client_id.clone();
        let public_key = hex::encode(session.wallet_public_key);
        let secret = session.wallet_secret_key.clone();
        let last_request_id = session.last_request_id;

        self.blocking(move |conn, key| {
            let sealed = hex::encode(key.seal(&secret[..])?);
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO connect
                    (account_id, peer_client_id, wallet_public_key, wallet_secret_key, last_request_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![account_id, peer, public_key, sealed, last_request_id],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    pub async fn get(
        &self,
        account_id: AccountId,
        peer_client_id: &str,
    ) -> Result<Option<ConnectionSession>, BridgeError> {
        let peer = peer_client_id.to_string();
        self.blocking(move |conn, key| {
            let raw = conn
                .query_row(
                    "SELECT account_id, peer_client_id, wallet_public_key, wallet_secret_key, last_request_id
                     FROM connect WHERE account_id = ?1 AND peer_client_id = ?2",
                    params![account_id, peer],
                    RawRow::from_row,
                )
                .optional()?;
            raw.map(|raw| raw.into_session(key)).transpose()
        })
        .await
    }

    pub async fn list_by_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<ConnectionSession>, BridgeError> {
        self.blocking(move |conn, key| {
            let mut stmt = conn.prepare(
                "SELECT account_id, peer_client_id, wallet_public_key, wallet_secret_key, last_request_id
                 FROM connect WHERE account_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([account_id], RawRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(unseal_all(rows, key))
        })
        .await
    }

    pub async fn list_all(&self) -> Result<Vec<ConnectionSession>, BridgeError> {
        self.blocking(|conn, key| {
            let mut stmt = conn.prepare(
                "SELECT account_id, peer_client_id, wallet_public_key, wallet_secret_key, last_request_id
                 FROM connect ORDER BY rowid",
            )?;
            let rows = stmt
                .query_map([], RawRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(unseal_all(rows, key))
        })
        .await
    }

    /// Raise `last_request_id` to `new_id`.
    ///
    /// Returns `false` without touching the row when `new_id` is not greater
    /// than the stored value or the row does not exist.
    pub async fn update_last_request_id(
        &self,
        account_id: AccountId,
        peer_client_id: &str,
        new_id: i64,
    ) -> Result<bool, BridgeError> {
        let peer = peer_client_id.to_string();
        self.blocking(move |conn, _| {
            let changed = conn.execute(
                "UPDATE connect SET last_request_id = ?3
                 WHERE account_id = ?1 AND peer_client_id = ?2 AND last_request_id < ?3",
                params![account_id, peer, new_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn remove(
        &self,
        account_id: AccountId,
        peer_client_id: &str,
    ) -> Result<bool, BridgeError> {
        let peer = peer_client_id.to_string();
        self.blocking(move |conn, _| {
            let removed = conn.execute(
                "DELETE FROM connect WHERE account_id = ?1 AND peer_client_id = ?2",
                params![account_id, peer],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    /// Delete every session of an account. Returns the number of rows removed.
    pub async fn remove_account(&self, account_id: AccountId) -> Result<usize, BridgeError> {
        self.blocking(move |conn, _| {
            Ok(conn.execute("DELETE FROM connect WHERE account_id = ?1", [account_id])?)
        })
        .await
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R, BridgeError>
    where
        F: FnOnce(&Connection, &StoreKey) -> Result<R, BridgeError> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let conn = inner
                .conn
                .lock()
                .map_err(|e| BridgeError::Storage(format!("lock poisoned: {e}")))?;
            f(&conn, &inner.key)
        })
        .await
        .map_err(|e| BridgeError::Storage(format!("store task failed: {e}")))?
    }
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            account_id: row.get(0)?,
            peer_client_id: row.get(1)?,
            wallet_public_key: row.get(2)?,
            wallet_secret_key: row.get(3)?,
            last_request_id: row.get(4)?,
        })
    }

    fn into_session(self, key: &StoreKey) -> Result<ConnectionSession, BridgeError> {
        let corrupt = |what: &str| {
            BridgeError::Storage(format!(
                "unreadable {what} for account {} peer {}",
                self.account_id, self.peer_client_id
            ))
        };
        let wallet_public_key =
            decode_key_hex(&self.wallet_public_key).ok_or_else(|| corrupt("public key"))?;
        let sealed = hex::decode(&self.wallet_secret_key).map_err(|_| corrupt("secret key"))?;
        let secret = key.open(&sealed).map_err(|e| match e {
            CryptoError::Open => corrupt("secret key (wrong store key?)"),
            other => BridgeError::from(other),
        })?;
        let wallet_secret_key: Zeroizing<[u8; KEY_BYTES]> = Zeroizing::new(
            secret[..]
                .try_into()
                .map_err(|_| corrupt("secret key length"))?,
        );

        Ok(ConnectionSession {
            account_id: self.account_id,
            peer_client_id: self.peer_client_id,
            wallet_public_key,
            wallet_secret_key,
            last_request_id: self.last_request_id,
        })
    }
}

fn unseal_all(rows: Vec<RawRow>, key: &StoreKey) -> Vec<ConnectionSession> {
    rows.into_iter()
        .filter_map(|raw| {
            let account_id = raw.account_id;
            match raw.into_session(key) {
                Ok(session) => Some(session),
                Err(e) => {
                    tracing::warn!(account_id, error = %e, "skipping unreadable session row");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonconnect_crypto::generate_keypair;

    fn key() -> StoreKey {
        StoreKey::derive(b"test material")
    }

    fn session(account_id: AccountId, peer: &str) -> ConnectionSession {
        ConnectionSession::new(account_id, peer, generate_keypair().unwrap())
    }

    #[tokio::test]
    async fn upsert_keeps_original_keys() {
        let store = SessionStore::open(None, key()).unwrap();
        let first = session(1, "peer");
        assert!(store.upsert(&first).await.unwrap());
        assert!(store.update_last_request_id(1, "peer", 4).await.unwrap());

        let second = session(1, "peer");
        assert!(!store.upsert(&second).await.unwrap());

        let stored = store.get(1, "peer").await.unwrap().unwrap();
        assert_eq!(stored.wallet_public_key, first.wallet_public_key);
        assert_eq!(stored.wallet_secret_key[..], first.wallet_secret_key[..]);
        assert_eq!(stored.last_request_id, 4);
    }

    #[tokio::test]
    async fn last_request_id_only_moves_forward() {
        let store = SessionStore::open(None, key()).unwrap();
        store.upsert(&session(1, "peer")).await.unwrap();

        assert!(store.update_last_request_id(1, "peer", 5).await.unwrap());
        assert!(!store.update_last_request_id(1, "peer", 5).await.unwrap());
        assert!(!store.update_last_request_id(1, "peer", 3).await.unwrap());
        assert!(store.update_last_request_id(1, "peer", 6).await.unwrap());
        assert!(!store.update_last_request_id(1, "missing", 9).await.unwrap());

        assert_eq!(store.get(1, "peer").await.unwrap().unwrap().last_request_id, 6);
    }

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let original = session(7, "peer");
        {
            let store = SessionStore::open(Some(&path), key()).unwrap();
            store.upsert(&original).await.unwrap();
            store.update_last_request_id(7, "peer", 41).await.unwrap();
        }

        let store = SessionStore::open(Some(&path), key()).unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].last_request_id, 41);
        assert_eq!(all[0].wallet_secret_key[..], original.wallet_secret_key[..]);
    }

    #[tokio::test]
    async fn secret_is_not_stored_in_plaintext() {
        let store = SessionStore::open(None, key()).unwrap();
        let original = session(1, "peer");
        store.upsert(&original).await.unwrap();

        let stored: String = {
            let conn = store.inner.conn.lock().unwrap();
            conn.query_row("SELECT wallet_secret_key FROM connect", [], |row| row.get(0))
                .unwrap()
        };
        assert_ne!(stored, hex::encode(&original.wallet_secret_key[..]));
    }

    #[tokio::test]
    async fn wrong_store_key_hides_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = SessionStore::open(Some(&path), key()).unwrap();
            store.upsert(&session(1, "peer")).await.unwrap();
        }

        let store = SessionStore::open(Some(&path), StoreKey::derive(b"other")).unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
        assert!(store.list_by_account(1).await.unwrap().is_empty());
        assert!(matches!(store.get(1, "peer").await, Err(BridgeError::Storage(_))));
    }

    #[tokio::test]
    async fn list_and_remove_by_account() {
        let store = SessionStore::open(None, key()).unwrap();
        store.upsert(&session(1, "a")).await.unwrap();
        store.upsert(&session(1, "b")).await.unwrap();
        store.upsert(&session(2, "a")).await.unwrap();

        let peers: Vec<_> = store
            .list_by_account(1)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.peer_client_id)
            .collect();
        assert_eq!(peers, vec!["a", "b"]);

        assert!(store.remove(1, "a").await.unwrap());
        assert!(!store.remove(1, "a").await.unwrap());
        assert_eq!(store.remove_account(1).await.unwrap(), 1);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
        assert!(store.get(2, "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_upserts_leave_one_row() {
        let store = SessionStore::open(None, key()).unwrap();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.upsert(&session(3, "peer")).await.unwrap() }));
        }
        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(store.list_by_account(3).await.unwrap().len(), 1);
    }
}
