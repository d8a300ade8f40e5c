pub mod ingest;
pub mod policy;

pub use ingest::{AddressTracker, IngestError, IngestOutcome};
pub use policy::HistoryPolicy;
