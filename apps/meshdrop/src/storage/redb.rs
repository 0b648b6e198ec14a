//! ReDB storage for dead drops.
//!
//! Provides persistent storage for:
//! - Dead drops
//! - Fragments, keyed `{drop_id}/{index:05}` so a drop's fragments form one range
//! - The hash-chained transfer log
//!
//! Values are JSON-serialized.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};

use crate::distribution::types::{DeadDrop, DropId, Fragment};
use crate::error::{DropError, DropResult};
use crate::transfer_log::TransferEntry;

// Table definitions
const DEAD_DROPS: TableDefinition<&str, &[u8]> = TableDefinition::new("dead_drops");
const FRAGMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("fragments");
const TRANSFER_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("transfer_log");

fn fragment_key(drop_id: &DropId, index: u16) -> String {
    format!("{drop_id}/{index:05}")
}

/// Storage wrapper for ReDB.
///
/// Thread-safe via internal Arc. Clone is cheap.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
}

impl Storage {
    /// Open or create a database at the given path.
    ///
    /// Creates parent directories if they don't exist.
    pub fn open(path: &Path) -> DropResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| DropError::Storage(e.to_string()))?;
        Self::init_tables(&db)?;

        tracing::info!(path = %path.display(), "Opened storage database");

        Ok(Self { db: Arc::new(db) })
    }

    /// Open an in-memory database for testing.
    #[cfg(test)]
    pub fn open_memory() -> DropResult<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| DropError::Storage(e.to_string()))?;
        Self::init_tables(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn init_tables(db: &Database) -> DropResult<()> {
        let write_txn = db.begin_write()?;
        {
            // Opening a table creates it
            let _ = write_txn.open_table(DEAD_DROPS)?;
            let _ = write_txn.open_table(FRAGMENTS)?;
            let _ = write_txn.open_table(TRANSFER_LOG)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn insert_drop(txn: &WriteTransaction, drop: &DeadDrop) -> DropResult<()> {
        let value = serde_json::to_vec(drop)?;
        let mut table = txn.open_table(DEAD_DROPS)?;
        table.insert(drop.id.to_string().as_str(), value.as_slice())?;
        Ok(())
    }

    fn insert_fragments(txn: &WriteTransaction, fragments: &[Fragment]) -> DropResult<()> {
        let mut table = txn.open_table(FRAGMENTS)?;
        for fragment in fragments {
            let value = serde_json::to_vec(fragment)?;
            let key = fragment_key(&fragment.dead_drop_id, fragment.index);
            table.insert(key.as_str(), value.as_slice())?;
        }
        Ok(())
    }

    // =========================================================================
    // Dead drops
    // =========================================================================

    /// Store a drop and all of its fragments in one transaction.
    ///
    /// Either everything is written or nothing is.
    pub fn create_drop_with_fragments(
        &self,
        drop: &DeadDrop,
        fragments: &[Fragment],
    ) -> DropResult<()> {
        if let Some(stray) = fragments.iter().find(|f| f.dead_drop_id != drop.id) {
            return Err(DropError::InvalidInput(format!(
                "fragment {} belongs to drop {}, not {}",
                stray.index, stray.dead_drop_id, drop.id
            )));
        }

        let write_txn = self.db.begin_write()?;
        {
            let table = write_txn.open_table(DEAD_DROPS)?;
            if table.get(drop.id.to_string().as_str())?.is_some() {
                return Err(DropError::InvalidInput(format!(
                    "dead drop {} already exists",
                    drop.id
                )));
            }
        }
        Self::insert_drop(&write_txn, drop)?;
        Self::insert_fragments(&write_txn, fragments)?;
        write_txn.commit()?;

        tracing::debug!(
            drop_id = %drop.id,
            fragments = fragments.len(),
            "Stored dead drop with fragments"
        );
        Ok(())
    }

    /// Store (or overwrite) a drop.
    pub fn put_drop(&self, drop: &DeadDrop) -> DropResult<()> {
        let write_txn = self.db.begin_write()?;
        Self::insert_drop(&write_txn, drop)?;
        write_txn.commit()?;
        tracing::debug!(drop_id = %drop.id, status = %drop.status, "Stored dead drop");
        Ok(())
    }

    /// Get a drop by ID.
    pub fn get_drop(&self, drop_id: &DropId) -> DropResult<Option<DeadDrop>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEAD_DROPS)?;

        match table.get(drop_id.to_string().as_str())? {
            Some(value) => {
                let drop: DeadDrop = serde_json::from_slice(value.value())?;
                Ok(Some(drop))
            }
            None => Ok(None),
        }
    }

    /// Store a drop together with updated fragments in one transaction.
    pub fn put_drop_and_fragments(&self, drop: &DeadDrop, fragments: &[Fragment]) -> DropResult<()> {
        let write_txn = self.db.begin_write()?;
        Self::insert_drop(&write_txn, drop)?;
        Self::insert_fragments(&write_txn, fragments)?;
        write_txn.commit()?;
        tracing::debug!(drop_id = %drop.id, status = %drop.status, "Stored dead drop state");
        Ok(())
    }

    // =========================================================================
    // Fragments
    // =========================================================================

    /// Store (or overwrite) a single fragment.
    pub fn put_fragment(&self, fragment: &Fragment) -> DropResult<()> {
        self.put_fragments(std::slice::from_ref(fragment))
    }

    /// Store several fragments in one transaction.
    pub fn put_fragments(&self, fragments: &[Fragment]) -> DropResult<()> {
        let write_txn = self.db.begin_write()?;
        Self::insert_fragments(&write_txn, fragments)?;
        write_txn.commit()?;
        tracing::debug!(count = fragments.len(), "Stored fragments");
        Ok(())
    }

    /// Get one fragment of a drop.
    pub fn get_fragment(&self, drop_id: &DropId, index: u16) -> DropResult<Option<Fragment>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FRAGMENTS)?;

        match table.get(fragment_key(drop_id, index).as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// All fragments of a drop, ordered by index.
    pub fn list_fragments(&self, drop_id: &DropId) -> DropResult<Vec<Fragment>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FRAGMENTS)?;

        // '0' sorts directly after '/'
        let start = format!("{drop_id}/");
        let end = format!("{drop_id}0");

        let fragments: Result<Vec<_>, _> = table
            .range(start.as_str()..end.as_str())?
            .map(|entry| {
                let (_, v) = entry?;
                let fragment: Fragment = serde_json::from_slice(v.value())?;
                Ok(fragment)
            })
            .collect();

        fragments
    }

    // =========================================================================
    // Transfer log
    // =========================================================================

    /// Store a single transfer entry by sequence number.
    pub fn put_transfer_entry(&self, entry: &TransferEntry) -> DropResult<()> {
        let value = serde_json::to_vec(entry)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TRANSFER_LOG)?;
            table.insert(entry.seq, value.as_slice())?;
        }
        write_txn.commit()?;
        tracing::trace!(seq = entry.seq, "Stored transfer entry");
        Ok(())
    }

    /// Get a single transfer entry by sequence number.
    pub fn get_transfer_entry(&self, seq: u64) -> DropResult<Option<TransferEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSFER_LOG)?;

        match table.get(seq)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Transfer entries with `start <= seq <= end`.
    pub fn get_transfer_range(&self, start: u64, end: u64) -> DropResult<Vec<TransferEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSFER_LOG)?;

        let entries: Result<Vec<_>, _> = table
            .range(start..=end)?
            .map(|entry| {
                let (_, v) = entry?;
                let parsed: TransferEntry = serde_json::from_slice(v.value())?;
                Ok(parsed)
            })
            .collect();

        entries
    }

    /// Get the latest transfer log sequence number.
    pub fn get_latest_transfer_seq(&self) -> DropResult<Option<u64>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRANSFER_LOG)?;

        let latest = table.iter()?.last().transpose()?.map(|(k, _)| k.value());

        Ok(latest)
    }
}
