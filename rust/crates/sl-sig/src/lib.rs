//! Sluice signature store
//!
//! A persistent record of "this substep, with these inputs, was built and
//! produced these outputs". The store decides whether a candidate substep can
//! be skipped: a hit requires every recorded input digest to still match the
//! file on disk and every recorded output to still exist. Records live in an
//! append-only JSON-lines journal under the run workspace; a torn final line
//! (crash mid-record) is discarded on load, so a partial record is never
//! visible.

mod lock;
mod record;
mod store;

pub use lock::WorkspaceLock;
pub use record::{action_digest, substep_key, RecordedFile, SignatureRecord};
pub use store::{Lookup, SignatureStore};
