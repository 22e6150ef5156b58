pub mod snapshot;
pub mod store;

pub use snapshot::SnapshotFile;
pub use store::{StationRecord, StationStore, Upsert};
