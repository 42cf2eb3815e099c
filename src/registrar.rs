//! Single-master exclusivity.
//!
//! The persisted master record is a plain mutual-exclusion marker, not a
//! lease: a crashed master's record stays until an operator clears it.

use crate::error::{MasterError, Result};
use crate::model::MasterRecord;
use crate::store::{ExecutionStore, MasterClaim};

/// Claim the master record for `host:port`.
///
/// Inserts the record when none exists and refreshes it when it already names
/// this address. Any other address is a [`MasterError::MasterConflict`] and
/// the caller must not start serving. A master that loses the insert to a
/// concurrent registration is judged against the winner's record.
pub async fn register(store: &dyn ExecutionStore, host: &str, port: u16) -> Result<MasterRecord> {
    let existing = match store.master_record().await? {
        Some(existing) => existing,
        None => match store.insert_master_record(host, port).await? {
            MasterClaim::Inserted(record) => {
                tracing::info!(host, port, "Master registered");
                return Ok(record);
            }
            MasterClaim::Existing(existing) => existing,
        },
    };

    if existing.is_same_address(host, port) {
        let record = store.touch_master_record(host, port).await?;
        tracing::info!(host, port, "Master record refreshed");
        return Ok(record);
    }

    tracing::error!(
        existing = %existing,
        host,
        port,
        "Another master is already registered"
    );
    Err(MasterError::MasterConflict(existing))
}
