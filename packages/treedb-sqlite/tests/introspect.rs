use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;
use treedb_core::api::{route, ApiRequest, Method};
use treedb_core::{
    AccessCoordinator, ColumnKind, Config, Error, FieldValue, HierarchyStore, ManualClock,
    StoreBackend,
};
use treedb_sqlite::SqliteBackend;
use treedb_test_support::init_logging;

fn staff_db(dir: &Path) -> PathBuf {
    let path = dir.join("staff.sqlite");
    Connection::open(&path)
        .unwrap()
        .execute_batch(
            "CREATE TABLE departments (dept_id INTEGER PRIMARY KEY, code TEXT UNIQUE, dept_name TEXT);
             INSERT INTO departments VALUES (1, 'OPS', 'Operations'), (2, 'DEV', ''), (3, 'FIN', 'Finance');
             CREATE TABLE staff (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 parent_id INTEGER,
                 sort_order INTEGER NOT NULL DEFAULT 0,
                 name TEXT NOT NULL DEFAULT 'x',
                 email TEXT UNIQUE,
                 budget REAL,
                 active BOOLEAN,
                 dept INTEGER REFERENCES departments(dept_id),
                 region TEXT,
                 city TEXT,
                 UNIQUE (region, city)
             );",
        )
        .unwrap();
    path
}

#[test]
fn table_meta_describes_columns_and_constraints() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = staff_db(dir.path());
    let mut tree = HierarchyStore::new(SqliteBackend.open(&Config::new(&path, "staff")).unwrap());

    let meta = tree.table_meta().unwrap();
    assert_eq!(meta.table, "staff");
    assert_eq!(meta.order_field, "sort_order");
    let names: Vec<&str> = meta.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["id", "parent_id", "sort_order", "name", "email", "budget", "active", "dept", "region", "city"]
    );

    let id = meta.column("id").unwrap();
    assert!(id.primary_key);
    assert!(!id.unique);
    assert_eq!(id.kind, ColumnKind::Integer);

    let name = meta.column("name").unwrap();
    assert!(name.not_null);
    assert_eq!(name.default_value.as_deref(), Some("'x'"));
    assert!(meta.column("email").unwrap().unique);
    assert_eq!(meta.column("budget").unwrap().kind, ColumnKind::Float);
    assert_eq!(meta.column("active").unwrap().kind, ColumnKind::Boolean);
    assert_eq!(
        meta.column("city").unwrap().unique_groups,
        vec![vec!["region".to_string(), "city".to_string()]]
    );

    let fk = meta.foreign_key("dept").unwrap();
    assert_eq!(fk.table, "departments");
    assert_eq!(fk.ref_column, "dept_id");
    assert_eq!(fk.primary_column, "dept_id");
    assert_eq!(fk.label_columns, vec!["dept_name", "code", "dept_id"]);
}

#[test]
fn foreign_options_fall_back_through_label_columns() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = staff_db(dir.path());
    let mut tree = HierarchyStore::new(SqliteBackend.open(&Config::new(&path, "staff")).unwrap());

    let options = tree.foreign_options("dept").unwrap();
    let pairs: Vec<(FieldValue, &str)> = options
        .iter()
        .map(|o| (o.value.clone(), o.label.as_str()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (FieldValue::Integer(2), "DEV (#2)"),
            (FieldValue::Integer(3), "Finance (#3)"),
            (FieldValue::Integer(1), "Operations (#1)"),
        ]
    );

    let err = tree.foreign_options("name").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err:?}");
}

#[test]
fn sibling_index_is_not_reported_as_column_uniqueness() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let cfg = Config::new(dir.path().join("tree.sqlite"), "tree_nodes");
    let mut tree = HierarchyStore::new(SqliteBackend.open(&cfg).unwrap());

    let meta = tree.table_meta().unwrap();
    let order = meta.column("sort_order").unwrap();
    assert!(!order.unique);
    assert!(order.unique_groups.is_empty());
    assert!(meta.foreign_keys.is_empty());
}

#[test]
fn list_tables_reads_without_creating() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = staff_db(dir.path());

    let tables = SqliteBackend.list_tables(&path).unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["departments", "staff"]);
    assert_eq!(tables[0].columns, vec!["dept_id", "code", "dept_name"]);

    let missing = dir.path().join("missing.sqlite");
    let err = SqliteBackend.list_tables(&missing).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err:?}");
    assert!(!missing.exists());

    let err = SqliteBackend.list_tables(dir.path()).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");
}

#[test]
fn introspection_routes() {
    init_logging();
    let dir = TempDir::new().unwrap();
    staff_db(dir.path());
    let coord = AccessCoordinator::new(
        SqliteBackend,
        ManualClock::default(),
        Duration::from_secs(1800),
        PathBuf::from(dir.path()),
    );
    let defaults = Config::new("staff.sqlite", "staff");

    let res = route(&coord, &defaults, &ApiRequest::new(Method::Get, "/api/tables?dbPath=staff.sqlite"));
    assert_eq!(res.status, 200, "{res:?}");
    let body = res.body.unwrap();
    assert_eq!(body["dataSourcePath"], json!(dir.path().join("staff.sqlite")));
    assert_eq!(body["tables"][1]["name"], json!("staff"));

    let res = route(&coord, &defaults, &ApiRequest::new(Method::Get, "/api/tables"));
    assert_eq!(res.status, 400);

    let res = route(&coord, &defaults, &ApiRequest::new(Method::Post, "/api/session"));
    assert_eq!(res.status, 201);
    let session = res.body.unwrap()["sessionId"].as_str().unwrap().to_string();

    let res = route(
        &coord,
        &defaults,
        &ApiRequest::new(Method::Get, &format!("/api/meta?session={session}")),
    );
    assert_eq!(res.status, 200, "{res:?}");
    let meta = res.body.unwrap();
    assert_eq!(meta["idField"], json!("id"));
    assert_eq!(meta["foreignKeys"][0]["column"], json!("dept"));
    assert_eq!(meta["columns"][5]["kind"], json!("float"));

    let res = route(
        &coord,
        &defaults,
        &ApiRequest::new(Method::Get, &format!("/api/foreign/dept?session={session}")),
    );
    assert_eq!(res.status, 200, "{res:?}");
    assert_eq!(res.body.unwrap()[0], json!({ "value": 2, "label": "DEV (#2)" }));

    let res = route(
        &coord,
        &defaults,
        &ApiRequest::new(Method::Get, &format!("/api/foreign/region?session={session}")),
    );
    assert_eq!(res.status, 404);

    let res = route(&coord, &defaults, &ApiRequest::new(Method::Get, "/api/meta"));
    assert_eq!(res.status, 410);
}
