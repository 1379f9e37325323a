//! Durability across engine restarts: everything must survive a close and
//! reopen of the same data directory

use nimbusdb::storage::Value;
use nimbusdb::{Database, EngineConfig, QueryExecutor, QueryResult};

fn ok(session: &mut QueryExecutor, sql: &str) -> QueryResult {
    let result = session.execute_sql(sql);
    assert!(result.is_ok(), "{:?} for {:?}", result.error, sql);
    result
}

#[test]
fn rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(EngineConfig::new(dir.path())).unwrap();
        let mut session = db.session();
        ok(&mut session, "CREATE TABLE p (data TEXT)");
        ok(&mut session, "INSERT INTO p VALUES ('Persistent data')");
    }

    let db = Database::open(EngineConfig::new(dir.path())).unwrap();
    let mut session = db.session();
    let result = ok(&mut session, "SELECT data FROM p");
    assert_eq!(result.row_count(), 1);
    assert_eq!(
        result.rows[0].get(0),
        Some(&Value::Text("Persistent data".to_string()))
    );
}

#[test]
fn deletes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(EngineConfig::new(dir.path())).unwrap();
        let mut session = db.session();
        ok(&mut session, "CREATE TABLE t (id BIGINT)");
        ok(&mut session, "INSERT INTO t VALUES (1),(2),(3)");
        ok(&mut session, "DELETE FROM t WHERE id = 2");
    }

    let db = Database::open(EngineConfig::new(dir.path())).unwrap();
    let mut session = db.session();
    let result = ok(&mut session, "SELECT id FROM t");
    let ids: Vec<i64> = result
        .rows
        .iter()
        .map(|t| t.get(0).unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn catalog_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(EngineConfig::new(dir.path())).unwrap();
        let mut session = db.session();
        ok(
            &mut session,
            "CREATE TABLE a (id BIGINT PRIMARY KEY, name VARCHAR(50))",
        );
        ok(&mut session, "CREATE TABLE b (x INT)");
        ok(&mut session, "CREATE INDEX a_name ON a (name)");
    }

    let db = Database::open(EngineConfig::new(dir.path())).unwrap();
    assert_eq!(db.list_tables(), vec!["a".to_string(), "b".to_string()]);

    let schema = db.get_schema("a").unwrap();
    assert_eq!(schema.column_names(), vec!["id", "name"]);

    let table = db.catalog().get_table_by_name("a").unwrap();
    assert_eq!(table.indexes.len(), 1);
    assert_eq!(table.indexes[0].name, "a_name");
}

#[test]
fn index_answers_queries_after_reopen() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(EngineConfig::new(dir.path())).unwrap();
        let mut session = db.session();
        ok(&mut session, "CREATE TABLE u (id BIGINT, tag TEXT)");
        ok(
            &mut session,
            "INSERT INTO u VALUES (1,'red'),(2,'green'),(3,'red')",
        );
        ok(&mut session, "CREATE INDEX u_tag ON u (tag)");
    }

    let db = Database::open(EngineConfig::new(dir.path())).unwrap();
    let mut session = db.session();
    let result = ok(&mut session, "SELECT id FROM u WHERE tag = 'red'");
    let ids: Vec<i64> = result
        .rows
        .iter()
        .map(|t| t.get(0).unwrap().as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 3]);
}

#[test]
fn dropped_table_stays_dropped() {
    let dir = tempfile::tempdir().unwrap();

    {
        let db = Database::open(EngineConfig::new(dir.path())).unwrap();
        let mut session = db.session();
        ok(&mut session, "CREATE TABLE gone (v BIGINT)");
        ok(&mut session, "DROP TABLE gone");
    }

    let db = Database::open(EngineConfig::new(dir.path())).unwrap();
    assert!(db.list_tables().is_empty());
    let mut session = db.session();
    assert!(session.execute_sql("SELECT v FROM gone").error.is_some());
}
