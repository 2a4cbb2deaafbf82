use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::config::{Config, TableSchema};
use crate::error::Result;
use crate::ids::NodeId;
use crate::meta::{ForeignOption, TableMeta, TableSummary};
use crate::node::{Fields, Node, Sibling};

/// Wall-clock source for session leases.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// One unit of work against the node table.
///
/// Every read and write a hierarchy operation performs goes through a single
/// transaction; dropping it without [`NodeTx::commit`] discards the writes.
pub trait NodeTx {
    /// Column names of the table, or `None` when the store is schema-less.
    fn columns(&mut self) -> Result<Option<BTreeSet<String>>>;

    /// Every row ordered by `(order_key, id)`.
    fn fetch_all(&mut self) -> Result<Vec<Node>>;

    fn fetch(&mut self, id: NodeId) -> Result<Option<Node>>;

    /// `None` when the node does not exist, `Some(parent)` otherwise.
    fn parent_of(&mut self, id: NodeId) -> Result<Option<Option<NodeId>>>;

    /// Children of `parent` (roots for `None`) ordered by `(order_key, id)`.
    fn children_of(&mut self, parent: Option<NodeId>) -> Result<Vec<Sibling>>;

    /// Every distinct parent value present in the table, `None` for roots.
    fn parents(&mut self) -> Result<Vec<Option<NodeId>>>;

    /// Insert a row and return its id. `id` is assigned by the store when `None`.
    fn insert(
        &mut self,
        id: Option<NodeId>,
        parent: Option<NodeId>,
        order_key: i64,
        fields: &Fields,
    ) -> Result<NodeId>;

    /// Write the user columns of an existing row. Returns `false` if the row is absent.
    fn update_fields(&mut self, id: NodeId, fields: &Fields) -> Result<bool>;

    /// Set parent and order key of a row in one statement.
    fn place(&mut self, id: NodeId, parent: Option<NodeId>, order_key: i64) -> Result<()>;

    /// Returns `false` if the row is absent.
    fn delete(&mut self, id: NodeId) -> Result<bool>;

    /// Columns, constraints and foreign keys of the table.
    fn table_meta(&mut self) -> Result<TableMeta>;

    /// Up to `limit` values of whatever `column` references, or `None` when
    /// `column` carries no foreign key.
    fn foreign_options(&mut self, column: &str, limit: usize) -> Result<Option<Vec<ForeignOption>>>;

    fn commit(self) -> Result<()>
    where
        Self: Sized;
}

/// Relational executor for one node table.
pub trait NodeStore: Send {
    type Tx<'a>: NodeTx
    where
        Self: 'a;

    fn begin(&mut self) -> Result<Self::Tx<'_>>;

    fn schema(&self) -> &TableSchema;
}

/// Opens node stores for session configurations.
pub trait StoreBackend: Send + Sync {
    type Store: NodeStore;

    /// Open the table named by `config`, creating it first when
    /// `config.auto_bootstrap` is set and it does not exist yet.
    fn open(&self, config: &Config) -> Result<Self::Store>;

    /// Tables of the data source at `path`, which is already absolute.
    fn list_tables(&self, path: &Path) -> Result<Vec<TableSummary>>;
}
