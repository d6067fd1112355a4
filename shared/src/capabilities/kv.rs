use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.contains(':') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain the namespace separator".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    /// Pending timed status transitions, replayed after a restart.
    Transition,
    /// Click-round bookkeeping.
    Session,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Transition => "transition",
            KeyNamespace::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?})")]
    Storage {
        code: StorageErrorCode,
        message: String,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String },
}

impl KvError {
    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        Self::Storage {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Busy,
    Locked,
    IoError,
}

pub type KvResult<T> = Result<T, KvError>;

/// Durable string-keyed store supplied by the host.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> KvResult<bool>;
    /// Keys (without namespace prefix) currently stored under `namespace`.
    async fn list(&self, namespace: &KeyNamespace) -> KvResult<Vec<String>>;
}

fn check_value_size(value: &[u8]) -> KvResult<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

fn keys_under(raw_keys: impl Iterator<Item = String>, namespace: &KeyNamespace) -> Vec<String> {
    let prefix = format!("{}:", namespace.prefix());
    raw_keys
        .filter_map(|raw| raw.strip_prefix(&prefix).map(str::to_string))
        .collect()
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> KvResult<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store poisoned"))
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>> {
        Ok(self.entries()?.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()> {
        check_value_size(&value)?;
        self.entries()?.insert(key.raw(), value);
        Ok(())
    }

    async fn delete(&self, key: &KvKey) -> KvResult<bool> {
        Ok(self.entries()?.remove(&key.raw()).is_some())
    }

    async fn list(&self, namespace: &KeyNamespace) -> KvResult<Vec<String>> {
        let entries = self.entries()?;
        Ok(keys_under(entries.keys().cloned(), namespace))
    }
}

/// SQLite-backed store. Blocking calls run on the blocking pool.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Clone)]
pub struct SqliteKvStore {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

#[cfg(not(target_arch = "wasm32"))]
impl SqliteKvStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> KvResult<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| KvError::storage(StorageErrorCode::ConnectionFailed, e.to_string()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> KvResult<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| KvError::storage(StorageErrorCode::ConnectionFailed, e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> KvResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )
        .map_err(Self::map_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn map_error(e: rusqlite::Error) -> KvError {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                _ => StorageErrorCode::IoError,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }

    async fn with_conn<T, F>(&self, f: F) -> KvResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> KvResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| KvError::storage(StorageErrorCode::Locked, "connection poisoned"))?;
            f(&guard)
        })
        .await
        .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
    }
}

#[cfg(not(target_arch = "wasm32"))]
#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &KvKey) -> KvResult<Option<Vec<u8>>> {
        use rusqlite::OptionalExtension;
        let raw = key.raw();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [raw],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .map_err(Self::map_error)
        })
        .await
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> KvResult<()> {
        check_value_size(&value)?;
        let raw = key.raw();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_entries (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![raw, value],
            )
            .map(|_| ())
            .map_err(Self::map_error)
        })
        .await
    }

    async fn delete(&self, key: &KvKey) -> KvResult<bool> {
        let raw = key.raw();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM kv_entries WHERE key = ?1", [raw])
                .map(|n| n > 0)
                .map_err(Self::map_error)
        })
        .await
    }

    async fn list(&self, namespace: &KeyNamespace) -> KvResult<Vec<String>> {
        let namespace = namespace.clone();
        let pattern = format!("{}:%", namespace.prefix());
        let raw_keys = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT key FROM kv_entries WHERE key LIKE ?1 ORDER BY key")
                    .map_err(Self::map_error)?;
                let rows = stmt
                    .query_map([pattern], |row| row.get::<_, String>(0))
                    .map_err(Self::map_error)?;
                let keys = rows.collect::<Result<Vec<_>, _>>().map_err(Self::map_error);
                keys
            })
            .await?;
        Ok(keys_under(raw_keys.into_iter(), &namespace))
    }
}

/// JSON-typed view over one namespace of a [`KeyValueStore`].
pub struct TypedKv<T> {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedKv<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedKv<T> {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: KeyNamespace) -> Self {
        Self {
            store,
            namespace,
            _phantom: PhantomData,
        }
    }

    fn key(&self, key: &str) -> KvResult<KvKey> {
        KvKey::new(self.namespace.clone(), key)
    }

    pub async fn get(&self, key: &str) -> KvResult<Option<T>> {
        match self.store.get(&self.key(key)?).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KvError::Serialization {
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &T) -> KvResult<()> {
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
        })?;
        self.store.set(&self.key(key)?, data).await
    }

    pub async fn delete(&self, key: &str) -> KvResult<bool> {
        self.store.delete(&self.key(key)?).await
    }

    pub async fn keys(&self) -> KvResult<Vec<String>> {
        self.store.list(&self.namespace).await
    }
}
