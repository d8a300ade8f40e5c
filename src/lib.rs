pub mod config;
pub mod geolocation;
pub mod models;
pub mod output;
pub mod persistence;
pub mod tracking;

// Re-export commonly used types
pub use config::Config;
pub use geolocation::{Enrichment, GeoLookup, LookupError};
pub use models::{AddressRecord, ConnectEvent, UserProfile};
pub use persistence::{FileBackend, SqliteBackend, StorageBackend, StorageError};
pub use tracking::{AddressTracker, HistoryPolicy, IngestError};
