//! Storage record types.

/// How the engine places payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Every payload is an external file under `data/`; `save` requires a
    /// filename.
    File,
    /// Every payload is inline in the manifest; supplying a filename is an
    /// invalid argument.
    Sqlite,
    /// The caller decides per write; a filename selects external placement.
    Mixed,
}

/// One logical record in the store.
///
/// `size` is always populated, even when the payload was not loaded
/// (see [`KvStorage::get_info`](crate::KvStorage::get_info)). Timestamps
/// are wall-clock seconds since the Unix epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageItem {
    pub key: String,
    pub value: Vec<u8>,
    /// Present iff the payload is stored externally in the data directory.
    pub filename: Option<String>,
    pub size: u64,
    pub modification_time: i64,
    pub last_access_time: i64,
    /// Opaque embedder bytes persisted alongside the record.
    pub extended_data: Option<Vec<u8>>,
}
