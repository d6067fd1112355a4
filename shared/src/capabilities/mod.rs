//! Interfaces the core consumes from the host shell.

mod clock;
mod http;
mod kv;
mod location;

pub use self::clock::{Clock, SystemClock};
pub use self::http::{
    execute_with_ceiling, HttpClient, HttpError, HttpHeaders, HttpRequest,
    HttpResponse, HttpResult, ReqwestClient, ValidatedUrl, SYNTHETIC_TIMEOUT_STATUS,
};
pub use self::kv::{
    KeyNamespace, KeyValueStore, KvError, KvKey, KvResult, MemoryKvStore, StorageErrorCode,
    TypedKv,
};
#[cfg(not(target_arch = "wasm32"))]
pub use self::kv::SqliteKvStore;
pub use self::location::{LocationError, LocationSource, WatchLocation};

