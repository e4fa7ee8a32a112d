//! The blackboard: typed tables shared across conflation stages.
//!
//! Every mutation happens inside an explicit transaction. A failed
//! transaction rolls back to the state captured at `begin`, so a stage
//! that errors leaves the tables exactly as it found them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{AssignedMatch, ChosenMatch, Dispute, EdgeKey, ReferenceGeometry};

/// Errors from blackboard operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `begin` was called while a transaction was already open.
    #[error("a transaction is already active")]
    TransactionActive,

    /// A write, `commit` or `rollback` was attempted with no open
    /// transaction.
    #[error("no transaction is active")]
    NoTransaction,

    /// Serialization or deserialization of persisted tables failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Locking intent of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Readers may observe committed state while the transaction runs.
    Deferred,
    /// No other writer may run while the transaction is open.
    Exclusive,
}

/// The blackboard tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tables {
    /// Reference geometries by id.
    pub references: BTreeMap<String, ReferenceGeometry>,

    /// Chosen matches by path edge slot.
    #[serde(with = "chosen_list")]
    pub chosen: BTreeMap<EdgeKey, ChosenMatch>,

    /// Path edge slots for which no candidate was usable.
    pub unmatched: BTreeSet<EdgeKey>,

    /// Disputes found by the last dispute pass.
    pub disputes: Vec<Dispute>,

    /// Final assignment from the last assignment pass.
    pub assigned: Vec<AssignedMatch>,
}

impl Tables {
    /// Drop every chosen and unmatched row belonging to `path_id`.
    pub fn clear_path(&mut self, path_id: u64) {
        self.chosen.retain(|k, _| k.path_id != path_id);
        self.unmatched.retain(|k| k.path_id != path_id);
    }
}

/// Chosen matches persist as a list; the key is derived from each row.
mod chosen_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::types::{ChosenMatch, EdgeKey};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<EdgeKey, ChosenMatch>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<EdgeKey, ChosenMatch>, D::Error> {
        let rows = Vec::<ChosenMatch>::deserialize(deserializer)?;
        Ok(rows.into_iter().map(|m| (m.key(), m)).collect())
    }
}

/// A transactional store of [`Tables`].
///
/// Implementations must satisfy these invariants:
/// - At most one transaction is open at a time.
/// - `tables_mut` is only available inside a transaction.
/// - `rollback` restores the tables to their state at `begin`.
/// - `commit` makes the changes durable for the backend before returning.
pub trait Blackboard {
    /// Current tables, including uncommitted changes of an open
    /// transaction.
    fn tables(&self) -> &Tables;

    /// Open a transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::TransactionActive`] if one is already open.
    fn begin(&mut self, mode: TransactionMode) -> StoreResult<()>;

    /// Commit the open transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoTransaction`] if none is open, or a backend error
    /// if the changes could not be persisted.
    fn commit(&mut self) -> StoreResult<()>;

    /// Discard the open transaction's changes.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoTransaction`] if none is open.
    fn rollback(&mut self) -> StoreResult<()>;

    /// Mutable tables for the open transaction.
    ///
    /// # Errors
    ///
    /// [`StoreError::NoTransaction`] if none is open.
    fn tables_mut(&mut self) -> StoreResult<&mut Tables>;

    /// Mode of the open transaction, if any.
    fn transaction_mode(&self) -> Option<TransactionMode>;

    /// Run `f` inside a transaction: commit on `Ok`, roll back and
    /// return the error on `Err`.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns, or a store error from `begin`/`commit`.
    fn transaction<T, E, F>(&mut self, mode: TransactionMode, f: F) -> Result<T, E>
    where
        Self: Sized,
        E: From<StoreError>,
        F: FnOnce(&mut Tables) -> Result<T, E>,
    {
        self.begin(mode)?;
        let result = match self.tables_mut() {
            Ok(tables) => f(tables),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(error = %rollback_err, "rollback after failed transaction also failed");
                }
                Err(e)
            }
        }
    }
}

/// Volatile blackboard held entirely in memory.
///
/// `begin` snapshots the tables; `rollback` restores the snapshot.
#[derive(Debug, Default)]
pub struct MemoryBlackboard {
    tables: Tables,
    open: Option<(TransactionMode, Tables)>,
}

impl MemoryBlackboard {
    /// An empty blackboard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A blackboard pre-populated with `tables`.
    #[must_use]
    pub const fn with_tables(tables: Tables) -> Self {
        Self { tables, open: None }
    }

    /// Consume the blackboard and return its tables.
    ///
    /// Uncommitted changes of an open transaction are discarded.
    #[must_use]
    pub fn into_tables(self) -> Tables {
        match self.open {
            Some((_, snapshot)) => snapshot,
            None => self.tables,
        }
    }
}

impl Blackboard for MemoryBlackboard {
    fn tables(&self) -> &Tables {
        &self.tables
    }

    fn begin(&mut self, mode: TransactionMode) -> StoreResult<()> {
        if self.open.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.open = Some((mode, self.tables.clone()));
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.open.take().map(|_| ()).ok_or(StoreError::NoTransaction)
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let (_, snapshot) = self.open.take().ok_or(StoreError::NoTransaction)?;
        self.tables = snapshot;
        Ok(())
    }

    fn tables_mut(&mut self) -> StoreResult<&mut Tables> {
        if self.open.is_none() {
            return Err(StoreError::NoTransaction);
        }
        Ok(&mut self.tables)
    }

    fn transaction_mode(&self) -> Option<TransactionMode> {
        self.open.as_ref().map(|(mode, _)| *mode)
    }
}

/// Blackboard persisted as a JSON document.
///
/// Each commit rewrites the file atomically (temp file + rename). The
/// blackboard lives from [`open`](Self::open) to [`close`](Self::close).
#[derive(Debug)]
pub struct FileBlackboard {
    path: PathBuf,
    inner: MemoryBlackboard,
}

impl FileBlackboard {
    /// Open the blackboard at `path`, creating empty tables if the file
    /// does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an I/O or serialization error if an existing file cannot
    /// be read.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let text = fs::read_to_string(&path)?;
            serde_json::from_str(&text).map_err(|e| StoreError::Serialization(e.to_string()))?
        } else {
            Tables::default()
        };
        debug!(
            path = %path.display(),
            references = tables.references.len(),
            chosen = tables.chosen.len(),
            "opened blackboard"
        );
        Ok(Self {
            path,
            inner: MemoryBlackboard::with_tables(tables),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End the blackboard's lifetime.
    ///
    /// # Errors
    ///
    /// [`StoreError::TransactionActive`] if a transaction is still open;
    /// its changes are rolled back and not persisted.
    pub fn close(mut self) -> StoreResult<()> {
        if self.inner.transaction_mode().is_some() {
            self.inner.rollback()?;
            return Err(StoreError::TransactionActive);
        }
        debug!(path = %self.path.display(), "closed blackboard");
        Ok(())
    }

    fn persist(&self) -> StoreResult<()> {
        let json = serde_json::to_string(self.inner.tables())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Blackboard for FileBlackboard {
    fn tables(&self) -> &Tables {
        self.inner.tables()
    }

    fn begin(&mut self, mode: TransactionMode) -> StoreResult<()> {
        self.inner.begin(mode)
    }

    fn commit(&mut self) -> StoreResult<()> {
        if self.inner.transaction_mode().is_none() {
            return Err(StoreError::NoTransaction);
        }
        if let Err(e) = self.persist() {
            self.inner.rollback()?;
            return Err(e);
        }
        self.inner.commit()
    }

    fn rollback(&mut self) -> StoreResult<()> {
        self.inner.rollback()
    }

    fn tables_mut(&mut self) -> StoreResult<&mut Tables> {
        self.inner.tables_mut()
    }

    fn transaction_mode(&self) -> Option<TransactionMode> {
        self.inner.transaction_mode()
    }
}
