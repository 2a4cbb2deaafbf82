use std::fs;
use std::path::Path;

use log::{debug, info};
use rusqlite::{Connection, OpenFlags};
use treedb_core::{error::Error, meta::TableSummary, traits::StoreBackend, Config};

use crate::introspect;
use crate::storage::{storage_err, SqliteNodeStore};

/// Opens SQLite files named by session configurations.
///
/// With `auto_bootstrap` a missing file, table or order column is created;
/// without it each of those is a validation error and nothing is written.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteBackend;

impl StoreBackend for SqliteBackend {
    type Store = SqliteNodeStore;

    fn open(&self, config: &Config) -> treedb_core::Result<SqliteNodeStore> {
        let path = &config.data_source_path;
        if !path.exists() {
            if !config.auto_bootstrap {
                return Err(Error::Validation(format!(
                    "data source {} does not exist",
                    path.display()
                )));
            }
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).map_err(|e| Error::Store(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(storage_err)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage_err)?;
        let store = SqliteNodeStore::from_connection(conn, config.schema());

        if !store.table_exists()? {
            if !config.auto_bootstrap {
                return Err(Error::Validation(format!(
                    "table {} does not exist in {}",
                    config.table_name,
                    path.display()
                )));
            }
            store.create_table()?;
            store.seed_root()?;
            info!("bootstrapped table {} in {}", config.table_name, path.display());
            return Ok(store);
        }

        let columns = store.table_columns()?;
        for (label, column) in [("id", &config.id_field), ("parent", &config.parent_field)] {
            if !columns.contains(column) {
                return Err(Error::Validation(format!(
                    "{label} column {column} not found in {}",
                    config.table_name
                )));
            }
        }
        if !columns.contains(&config.order_field) {
            if !config.auto_bootstrap {
                return Err(Error::Validation(format!(
                    "order column {} not found in {}",
                    config.order_field, config.table_name
                )));
            }
            store.add_order_column()?;
            info!(
                "added order column {} to {}",
                config.order_field, config.table_name
            );
        }
        debug!("opened {} in {}", config.table_name, path.display());
        Ok(store)
    }

    /// Opens the file read-only; listing never creates a database.
    fn list_tables(&self, path: &Path) -> treedb_core::Result<Vec<TableSummary>> {
        if !path.exists() {
            return Err(Error::NotFound(format!("data source {}", path.display())));
        }
        if !path.is_file() {
            return Err(Error::Validation(format!("{} is not a file", path.display())));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(storage_err)?;
        introspect::list_tables(&conn)
    }
}
