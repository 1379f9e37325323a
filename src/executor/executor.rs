//! Query executor for NimbusDB
//!
//! Drives parsed statements to results: dispatches transaction control,
//! wraps DML and SELECT in auto-commit transactions, builds operator trees
//! for SELECT, and applies DML in two phases so a statement never sees its
//! own writes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::catalog::{Catalog, ColumnInfo, IndexInfo, IndexType, Schema, TableInfo};
use crate::error::{Error, Result};
use crate::executor::eval::{evaluate, is_truthy};
use crate::executor::operator::{AggregateSpec, Operator};
use crate::sql::ast::*;
use crate::sql::Parser;
use crate::storage::btree::BTreeIndex;
use crate::storage::disk::StorageManager;
use crate::storage::heap::{HeapTable, RecordId};
use crate::storage::tuple::{Tuple, Value};
use crate::transaction::{LockManager, TransactionManager, UndoKind};

/// Result of one statement
#[derive(Debug)]
pub struct QueryResult {
    /// Schema of `rows` (empty for DML)
    pub schema: Schema,
    /// Result rows, in pull order
    pub rows: Vec<Tuple>,
    /// Rows touched by DML
    pub rows_affected: u64,
    /// Set when the statement failed; takes precedence over rows
    pub error: Option<String>,
    /// Wall-clock execution time in microseconds
    pub execution_time_us: u64,
}

impl QueryResult {
    /// An empty success result
    pub fn empty() -> Self {
        Self {
            schema: Schema::new(),
            rows: Vec::new(),
            rows_affected: 0,
            error: None,
            execution_time_us: 0,
        }
    }

    /// A failed result carrying an error message
    pub fn with_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::empty()
        }
    }

    /// A DML success result
    pub fn with_rows_affected(count: u64) -> Self {
        Self {
            rows_affected: count,
            ..Self::empty()
        }
    }

    /// Whether the statement succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Number of result rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Names of the result columns
    pub fn column_names(&self) -> Vec<&str> {
        self.schema.column_names()
    }
}

/// Query executor. One instance per connection; not shared across threads.
pub struct QueryExecutor {
    catalog: Arc<Catalog>,
    storage: Arc<StorageManager>,
    lock_manager: Arc<LockManager>,
    txn_manager: Arc<TransactionManager>,
    current_txn: Option<u64>,
}

impl QueryExecutor {
    pub fn new(
        catalog: Arc<Catalog>,
        storage: Arc<StorageManager>,
        lock_manager: Arc<LockManager>,
        txn_manager: Arc<TransactionManager>,
    ) -> Self {
        Self {
            catalog,
            storage,
            lock_manager,
            txn_manager,
            current_txn: None,
        }
    }

    /// Parse and execute one statement. Never panics or propagates errors;
    /// failures land in `QueryResult::error`.
    pub fn execute_sql(&mut self, sql: &str) -> QueryResult {
        let started = Instant::now();
        let mut result = match Parser::new(sql).and_then(|mut p| p.parse()) {
            Ok(stmt) => self.execute(stmt),
            Err(e) => {
                warn!(error = %e, sql, "statement rejected");
                QueryResult::with_error(e.to_string())
            }
        };
        result.execution_time_us = started.elapsed().as_micros() as u64;
        result
    }

    /// Execute a parsed statement
    pub fn execute(&mut self, stmt: Statement) -> QueryResult {
        debug!(statement = %stmt, "executing");
        match stmt {
            Statement::Begin => self.into_result(|ex| ex.begin().map(|_| QueryResult::empty())),
            Statement::Commit => self.into_result(|ex| ex.commit().map(|_| QueryResult::empty())),
            Statement::Rollback => self.into_result(|ex| ex.abort().map(|_| QueryResult::empty())),

            Statement::CreateTable(s) => self.into_result(|ex| ex.execute_create_table(&s)),
            Statement::DropTable(s) => self.into_result(|ex| ex.execute_drop_table(&s)),
            Statement::CreateIndex(s) => self.into_result(|ex| ex.execute_create_index(&s)),

            other => self.execute_with_txn(other),
        }
    }

    /// Programmatic BEGIN
    pub fn begin(&mut self) -> Result<u64> {
        if self.current_txn.is_some() {
            return Err(Error::TransactionAlreadyActive);
        }
        let txn = self.txn_manager.begin();
        self.current_txn = Some(txn);
        Ok(txn)
    }

    /// Programmatic COMMIT
    pub fn commit(&mut self) -> Result<()> {
        let txn = self.current_txn.take().ok_or(Error::NoActiveTransaction)?;
        self.txn_manager.commit(txn)
    }

    /// Programmatic ROLLBACK. Reverses recorded inserts by tombstoning
    /// them; rows a DELETE or UPDATE already tombstoned stay gone, the undo
    /// entry does not carry enough to rebuild them.
    pub fn abort(&mut self) -> Result<()> {
        let txn = self.current_txn.take().ok_or(Error::NoActiveTransaction)?;
        let undo_log = self.txn_manager.abort(txn)?;
        for entry in undo_log.iter().rev() {
            if entry.kind != UndoKind::Insert {
                continue;
            }
            let Some(table_info) = self.catalog.get_table_by_name(&entry.table) else {
                continue;
            };
            let heap = self.heap(&table_info);
            if let Ok(Some(tuple)) = heap.get(entry.rid) {
                heap.remove(entry.rid).ok();
                self.index_delete_all(&table_info, &tuple, entry.rid).ok();
            }
        }
        Ok(())
    }

    // ========== Dispatch plumbing ==========

    fn into_result(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<QueryResult>,
    ) -> QueryResult {
        match f(self) {
            Ok(result) => result,
            Err(e) => QueryResult::with_error(e.to_string()),
        }
    }

    /// Run DML/SELECT inside the current transaction, or an auto-commit one
    fn execute_with_txn(&mut self, stmt: Statement) -> QueryResult {
        let auto_commit = self.current_txn.is_none();
        if auto_commit {
            self.current_txn = Some(self.txn_manager.begin());
        }

        let outcome = match &stmt {
            Statement::Select(s) => self.execute_select(s),
            Statement::Insert(s) => self.execute_insert(s),
            Statement::Update(s) => self.execute_update(s),
            Statement::Delete(s) => self.execute_delete(s),
            _ => Err(Error::Internal("unexpected statement kind".to_string())),
        };

        match outcome {
            Ok(result) => {
                if auto_commit {
                    if let Err(e) = self.commit() {
                        return QueryResult::with_error(e.to_string());
                    }
                }
                result
            }
            Err(e) => {
                if auto_commit {
                    // roll back whatever the statement already applied
                    self.abort().ok();
                }
                warn!(error = %e, "statement failed");
                QueryResult::with_error(e.to_string())
            }
        }
    }

    // ========== SELECT ==========

    fn execute_select(&mut self, stmt: &SelectStatement) -> Result<QueryResult> {
        let mut root = self.build_select_plan(stmt)?;
        if let Err(e) = root.open() {
            root.close();
            return Err(e);
        }
        let schema = root.output_schema().clone();

        let mut rows = Vec::new();
        loop {
            match root.next() {
                Ok(Some(tuple)) => rows.push(tuple),
                Ok(None) => break,
                Err(e) => {
                    root.close();
                    return Err(e);
                }
            }
        }
        root.close();

        if stmt.distinct {
            let mut seen = HashSet::new();
            rows.retain(|tuple| {
                let key = tuple
                    .values()
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("|");
                seen.insert(key)
            });
        }

        Ok(QueryResult {
            schema,
            rows,
            rows_affected: 0,
            error: None,
            execution_time_us: 0,
        })
    }

    /// Build the operator tree for a SELECT:
    /// scan, filter, aggregate, having, sort, project, limit.
    fn build_select_plan(&self, stmt: &SelectStatement) -> Result<Operator> {
        let table_info = self.require_table(&stmt.from)?;
        let table = self.heap(&table_info);

        // an equality predicate over an indexed column becomes an index scan
        let mut covered = false;
        let mut root = match stmt
            .where_clause
            .as_ref()
            .and_then(|pred| self.match_index_equality(&table_info, pred))
        {
            Some((index_info, key)) => {
                covered = true;
                let index = self.open_index(&table_info, &index_info);
                Operator::index_scan(table, index, key)
            }
            None => Operator::seq_scan(table),
        };

        if let Some(pred) = &stmt.where_clause {
            if !covered {
                root = Operator::filter(root, pred.clone());
            }
        }

        let has_aggregates = stmt.columns.iter().any(Expr::contains_aggregate);
        if has_aggregates || !stmt.group_by.is_empty() {
            let aggs: Vec<AggregateSpec> = stmt
                .columns
                .iter()
                .filter_map(AggregateSpec::from_expr)
                .collect();
            root = Operator::aggregate(root, stmt.group_by.clone(), aggs);
            if let Some(having) = &stmt.having {
                root = Operator::filter(root, having.clone());
            }
        }

        if !stmt.order_by.is_empty() {
            let keys = stmt
                .order_by
                .iter()
                .map(|item| (item.expr.clone(), item.ascending))
                .collect();
            root = Operator::sort(root, keys);
        }

        if !stmt.columns.is_empty() {
            root = Operator::project(root, stmt.columns.clone());
        }

        if stmt.limit.is_some() || stmt.offset.is_some() {
            root = Operator::limit(root, stmt.limit, stmt.offset.unwrap_or(0));
        }

        Ok(root)
    }

    /// `col = literal` over a single-column B-tree index
    fn match_index_equality(
        &self,
        table_info: &TableInfo,
        pred: &Expr,
    ) -> Option<(IndexInfo, Value)> {
        let Expr::Binary {
            left,
            op: BinaryOp::Eq,
            right,
        } = pred
        else {
            return None;
        };
        let (Expr::Column { name, .. }, Expr::Constant(value)) = (left.as_ref(), right.as_ref())
        else {
            return None;
        };

        let position = table_info
            .columns
            .iter()
            .position(|c| &c.name == name)? as u16;
        let index_info = table_info
            .indexes
            .iter()
            .find(|i| i.index_type == IndexType::BTree && i.column_positions == [position])?
            .clone();

        let column = &table_info.columns[position as usize];
        let key = value.coerce(&column.data_type).ok()?;
        Some((index_info, key))
    }

    // ========== INSERT ==========

    fn execute_insert(&mut self, stmt: &InsertStatement) -> Result<QueryResult> {
        let table_info = self.require_table(&stmt.table_name)?;
        let schema = table_info.schema();
        let heap = self.heap(&table_info);

        let mut rows_affected = 0u64;
        for row_exprs in &stmt.values {
            // constant expressions only; there is no row context yet
            let values = match &stmt.columns {
                Some(cols) => {
                    if cols.len() != row_exprs.len() {
                        return Err(Error::ExecutionError(format!(
                            "{} columns but {} values",
                            cols.len(),
                            row_exprs.len()
                        )));
                    }
                    let mut values = vec![Value::Null; schema.len()];
                    for (col, expr) in cols.iter().zip(row_exprs) {
                        let idx = schema
                            .find_column(col)
                            .ok_or_else(|| Error::ColumnNotFound(col.clone()))?;
                        values[idx] = evaluate(expr, None)?;
                    }
                    values
                }
                None => {
                    if row_exprs.len() != schema.len() {
                        return Err(Error::ExecutionError(format!(
                            "table '{}' has {} columns but {} values were supplied",
                            table_info.name,
                            schema.len(),
                            row_exprs.len()
                        )));
                    }
                    row_exprs
                        .iter()
                        .map(|e| evaluate(e, None))
                        .collect::<Result<Vec<_>>>()?
                }
            };

            let mut coerced = Vec::with_capacity(values.len());
            for (value, column) in values.iter().zip(&table_info.columns) {
                let value = value.coerce(&column.data_type)?;
                if value.is_null() && !column.nullable {
                    return Err(Error::NullNotAllowed(column.name.clone()));
                }
                coerced.push(value);
            }

            let tuple = Tuple::new(coerced);
            let rid = heap.insert(&tuple)?;
            self.track_mutation(UndoKind::Insert, &table_info.name, rid)?;
            self.index_insert_all(&table_info, &tuple, rid)?;
            rows_affected += 1;
        }

        self.refresh_stats(&table_info, &heap)?;
        Ok(QueryResult::with_rows_affected(rows_affected))
    }

    // ========== DELETE ==========

    fn execute_delete(&mut self, stmt: &DeleteStatement) -> Result<QueryResult> {
        let table_info = self.require_table(&stmt.table_name)?;
        let schema = table_info.schema();
        let heap = self.heap(&table_info);

        // phase 1: materialize targets so the scan never sees its own work
        let mut targets = Vec::new();
        let mut scan = heap.scan();
        while let Some((rid, tuple)) = scan.next()? {
            let matches = match &stmt.where_clause {
                Some(pred) => is_truthy(&evaluate(pred, Some((&tuple, &schema)))?),
                None => true,
            };
            if matches {
                targets.push((rid, tuple));
            }
        }

        // phase 2: apply
        let mut rows_affected = 0u64;
        for (rid, tuple) in targets {
            self.track_mutation(UndoKind::Delete, &table_info.name, rid)?;
            if heap.remove(rid)? {
                self.index_delete_all(&table_info, &tuple, rid)?;
                rows_affected += 1;
            }
        }

        self.refresh_stats(&table_info, &heap)?;
        Ok(QueryResult::with_rows_affected(rows_affected))
    }

    // ========== UPDATE ==========

    fn execute_update(&mut self, stmt: &UpdateStatement) -> Result<QueryResult> {
        let table_info = self.require_table(&stmt.table_name)?;
        let schema = table_info.schema();
        let heap = self.heap(&table_info);

        // phase 1: collect rids and compute replacement tuples under the
        // old row, so `SET x = x + 1` touches each row exactly once
        let mut updates = Vec::new();
        let mut scan = heap.scan();
        while let Some((rid, old)) = scan.next()? {
            let matches = match &stmt.where_clause {
                Some(pred) => is_truthy(&evaluate(pred, Some((&old, &schema)))?),
                None => true,
            };
            if !matches {
                continue;
            }

            let mut new = old.clone();
            for assignment in &stmt.assignments {
                let idx = schema
                    .find_column(&assignment.column)
                    .ok_or_else(|| Error::ColumnNotFound(assignment.column.clone()))?;
                let column = &table_info.columns[idx];
                let value = evaluate(&assignment.value, Some((&old, &schema)))?
                    .coerce(&column.data_type)?;
                if value.is_null() && !column.nullable {
                    return Err(Error::NullNotAllowed(column.name.clone()));
                }
                new.set(idx, value);
            }
            updates.push((rid, old, new));
        }

        // phase 2: apply. The replacement row gets a fresh rid.
        let mut rows_affected = 0u64;
        for (rid, old, new) in updates {
            self.track_mutation(UndoKind::Update, &table_info.name, rid)?;
            let new_rid = heap.update(rid, &new)?;
            self.track_mutation(UndoKind::Insert, &table_info.name, new_rid)?;
            self.index_delete_all(&table_info, &old, rid)?;
            self.index_insert_all(&table_info, &new, new_rid)?;
            rows_affected += 1;
        }

        self.refresh_stats(&table_info, &heap)?;
        Ok(QueryResult::with_rows_affected(rows_affected))
    }

    // ========== DDL ==========

    fn execute_create_table(&mut self, stmt: &CreateTableStatement) -> Result<QueryResult> {
        if self.catalog.table_exists(&stmt.table_name) {
            if stmt.if_not_exists {
                return Ok(QueryResult::empty());
            }
            return Err(Error::TableAlreadyExists(stmt.table_name.clone()));
        }

        let columns: Vec<ColumnInfo> = stmt
            .columns
            .iter()
            .enumerate()
            .map(|(i, def)| {
                ColumnInfo::new(def.name.clone(), def.data_type.clone(), i as u16)
                    .nullable(!def.not_null)
                    .primary_key(def.primary_key)
            })
            .collect();

        let oid = self.catalog.create_table(&stmt.table_name, columns)?;
        let table_info = self
            .catalog
            .get_table(oid)
            .ok_or_else(|| Error::Internal("table vanished after create".to_string()))?;

        let heap = self.heap(&table_info);
        if let Err(e) = heap.create() {
            // keep catalog and storage consistent
            self.catalog.drop_table(oid).ok();
            return Err(e);
        }

        Ok(QueryResult::with_rows_affected(1))
    }

    fn execute_drop_table(&mut self, stmt: &DropTableStatement) -> Result<QueryResult> {
        let Some(table_info) = self.catalog.get_table_by_name(&stmt.table_name) else {
            if stmt.if_exists {
                return Ok(QueryResult::empty());
            }
            return Err(Error::TableNotFound(stmt.table_name.clone()));
        };

        let heap = self.heap(&table_info);
        heap.drop_table()?;
        self.storage.delete_file(&table_info.filename)?;
        for index in &table_info.indexes {
            self.storage.delete_file(&index.filename)?;
        }
        self.catalog.drop_table(table_info.table_id)?;

        Ok(QueryResult::with_rows_affected(1))
    }

    fn execute_create_index(&mut self, stmt: &CreateIndexStatement) -> Result<QueryResult> {
        let table_info = self.require_table(&stmt.table_name)?;
        let [column] = stmt.columns.as_slice() else {
            return Err(Error::ExecutionError(
                "multi-column indexes are not supported".to_string(),
            ));
        };
        let position = table_info
            .columns
            .iter()
            .position(|c| &c.name == column)
            .ok_or_else(|| Error::ColumnNotFound(column.clone()))? as u16;

        let oid = self.catalog.create_index(
            &stmt.index_name,
            table_info.table_id,
            vec![position],
            IndexType::BTree,
            stmt.unique,
        )?;

        // reload to pick up the index entry, then build the physical tree
        let table_info = self
            .catalog
            .get_table(table_info.table_id)
            .ok_or_else(|| Error::Internal("table vanished after create index".to_string()))?;
        let index_info = table_info
            .indexes
            .iter()
            .find(|i| i.index_id == oid)
            .ok_or_else(|| Error::Internal("index vanished after create".to_string()))?;

        let index = self.open_index(&table_info, index_info);
        index.create()?;

        let heap = self.heap(&table_info);
        let mut scan = heap.scan();
        while let Some((rid, tuple)) = scan.next()? {
            if let Some(key) = tuple.get(position as usize) {
                if !key.is_null() {
                    index.insert(key, rid)?;
                }
            }
        }

        Ok(QueryResult::with_rows_affected(1))
    }

    // ========== Helpers ==========

    fn require_table(&self, name: &str) -> Result<TableInfo> {
        self.catalog
            .get_table_by_name(name)
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    fn heap(&self, table_info: &TableInfo) -> HeapTable {
        HeapTable::new(&table_info.name, table_info.schema(), self.storage.clone())
    }

    fn open_index(&self, table_info: &TableInfo, index_info: &IndexInfo) -> BTreeIndex {
        let position = index_info.column_positions[0] as usize;
        let key_type = table_info.columns[position].data_type.clone();
        BTreeIndex::new(index_info.filename.clone(), key_type, self.storage.clone())
    }

    /// Lock the row and record the undo entry when a transaction is active
    fn track_mutation(&self, kind: UndoKind, table: &str, rid: RecordId) -> Result<()> {
        let Some(txn) = self.current_txn else {
            return Ok(());
        };
        if !self.lock_manager.acquire_exclusive(txn, table, rid) {
            return Err(Error::LockNotAcquired(format!("{} {}", table, rid)));
        }
        self.txn_manager.add_undo(txn, kind, table, rid)
    }

    fn index_insert_all(&self, table_info: &TableInfo, tuple: &Tuple, rid: RecordId) -> Result<()> {
        for index_info in &table_info.indexes {
            let position = index_info.column_positions[0] as usize;
            let Some(key) = tuple.get(position) else {
                continue;
            };
            if key.is_null() {
                continue;
            }
            self.open_index(table_info, index_info).insert(key, rid)?;
        }
        Ok(())
    }

    fn index_delete_all(&self, table_info: &TableInfo, tuple: &Tuple, rid: RecordId) -> Result<()> {
        for index_info in &table_info.indexes {
            let position = index_info.column_positions[0] as usize;
            let Some(key) = tuple.get(position) else {
                continue;
            };
            if key.is_null() {
                continue;
            }
            self.open_index(table_info, index_info).delete(key, rid)?;
        }
        Ok(())
    }

    fn refresh_stats(&self, table_info: &TableInfo, heap: &HeapTable) -> Result<()> {
        let count = heap.tuple_count()?;
        self.catalog.update_table_stats(table_info.table_id, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, QueryExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageManager::new(dir.path()).unwrap());
        let catalog = Arc::new(Catalog::open(dir.path().join("catalog.dat")).unwrap());
        let lock_manager = Arc::new(LockManager::new());
        let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
        let executor = QueryExecutor::new(catalog, storage, lock_manager, txn_manager);
        (dir, executor)
    }

    fn ok(executor: &mut QueryExecutor, sql: &str) -> QueryResult {
        let result = executor.execute_sql(sql);
        assert!(result.is_ok(), "{:?} for {:?}", result.error, sql);
        result
    }

    #[test]
    fn test_create_insert_select() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE users (id BIGINT, age BIGINT)");
        let result = ok(
            &mut ex,
            "INSERT INTO users (id, age) VALUES (1, 20), (2, 30), (3, 40)",
        );
        assert_eq!(result.rows_affected, 3);

        let result = ok(&mut ex, "SELECT id FROM users WHERE age > 25");
        assert_eq!(result.column_names(), vec!["id"]);
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.rows[0].get(0), Some(&Value::Int64(2)));
        assert_eq!(result.rows[1].get(0), Some(&Value::Int64(3)));
    }

    #[test]
    fn test_parse_error_is_reported_not_thrown() {
        let (_dir, mut ex) = setup();
        let result = ex.execute_sql("SELEKT * FROM t");
        assert!(!result.is_ok());
        assert!(result.error.unwrap().contains("Parse error"));
    }

    #[test]
    fn test_unknown_table_and_column() {
        let (_dir, mut ex) = setup();
        let result = ex.execute_sql("SELECT a FROM missing");
        assert!(result.error.unwrap().contains("not found"));

        ok(&mut ex, "CREATE TABLE t (a BIGINT)");
        ok(&mut ex, "INSERT INTO t VALUES (1)");
        let result = ex.execute_sql("SELECT b FROM t");
        assert!(result.error.unwrap().contains("column 'b' not found"));
    }

    #[test]
    fn test_insert_column_reordering_and_null() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE t (a BIGINT, b TEXT)");
        ok(&mut ex, "INSERT INTO t (b, a) VALUES ('x', 1)");
        let result = ok(&mut ex, "SELECT a, b FROM t");
        assert_eq!(
            result.rows[0].values(),
            &[Value::Int64(1), Value::Text("x".to_string())]
        );

        // missing column defaults to NULL
        ok(&mut ex, "INSERT INTO t (a) VALUES (2)");
        let result = ok(&mut ex, "SELECT b FROM t WHERE a = 2");
        assert_eq!(result.rows[0].get(0), Some(&Value::Null));
    }

    #[test]
    fn test_not_null_enforced() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE t (id BIGINT PRIMARY KEY, name TEXT)");
        let result = ex.execute_sql("INSERT INTO t (name) VALUES ('x')");
        assert!(result.error.unwrap().contains("null value not allowed"));
    }

    #[test]
    fn test_order_by_and_limit() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE t (val INTEGER)");
        ok(&mut ex, "INSERT INTO t VALUES (30), (10), (20)");

        let result = ok(&mut ex, "SELECT val FROM t ORDER BY val");
        let vals: Vec<_> = result.rows.iter().map(|t| t.get(0).cloned().unwrap()).collect();
        assert_eq!(
            vals,
            vec![Value::Int32(10), Value::Int32(20), Value::Int32(30)]
        );

        let result = ok(&mut ex, "SELECT val FROM t ORDER BY val DESC LIMIT 1");
        assert_eq!(result.rows[0].get(0), Some(&Value::Int32(30)));

        let result = ok(&mut ex, "SELECT val FROM t ORDER BY val LIMIT 0");
        assert_eq!(result.row_count(), 0);
    }

    #[test]
    fn test_group_by_aggregates() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE a (cat TEXT, val INTEGER)");
        ok(&mut ex, "INSERT INTO a VALUES ('A', 10), ('A', 20), ('B', 5)");

        let result = ok(&mut ex, "SELECT cat, COUNT(val), SUM(val) FROM a GROUP BY cat");
        assert_eq!(result.row_count(), 2);
        assert_eq!(
            result.rows[0].values(),
            &[
                Value::Text("A".to_string()),
                Value::Int64(2),
                Value::Float64(30.0)
            ]
        );
        assert_eq!(
            result.rows[1].values(),
            &[
                Value::Text("B".to_string()),
                Value::Int64(1),
                Value::Float64(5.0)
            ]
        );
    }

    #[test]
    fn test_having() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE a (cat TEXT, val INTEGER)");
        ok(&mut ex, "INSERT INTO a VALUES ('A', 10), ('A', 20), ('B', 5)");

        let result = ok(
            &mut ex,
            "SELECT cat, COUNT(val) FROM a GROUP BY cat HAVING COUNT(val) > 1",
        );
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.rows[0].get(0), Some(&Value::Text("A".to_string())));
    }

    #[test]
    fn test_delete() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE d (id BIGINT)");
        ok(&mut ex, "INSERT INTO d VALUES (1), (2)");

        let result = ok(&mut ex, "DELETE FROM d WHERE id = 1");
        assert_eq!(result.rows_affected, 1);

        let result = ok(&mut ex, "SELECT id FROM d");
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.rows[0].get(0), Some(&Value::Int64(2)));
    }

    #[test]
    fn test_update_halloween_safety() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE h (x BIGINT)");
        ok(&mut ex, "INSERT INTO h VALUES (1), (2), (3)");

        // each row bumped exactly once even though updated rows re-enter
        // the heap behind the scan position
        let result = ok(&mut ex, "UPDATE h SET x = x + 1");
        assert_eq!(result.rows_affected, 3);

        let result = ok(&mut ex, "SELECT x FROM h ORDER BY x");
        let vals: Vec<_> = result.rows.iter().map(|t| t.get(0).cloned().unwrap()).collect();
        assert_eq!(
            vals,
            vec![Value::Int64(2), Value::Int64(3), Value::Int64(4)]
        );
    }

    #[test]
    fn test_index_scan_path() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE u (id BIGINT, email TEXT)");
        ok(
            &mut ex,
            "INSERT INTO u VALUES (1, 'a@x.com'), (2, 'b@x.com'), (3, 'c@x.com')",
        );
        ok(&mut ex, "CREATE INDEX u_email ON u (email)");

        let result = ok(&mut ex, "SELECT id FROM u WHERE email = 'b@x.com'");
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.rows[0].get(0), Some(&Value::Int64(2)));

        // index maintained through DML
        ok(&mut ex, "UPDATE u SET email = 'z@x.com' WHERE id = 2");
        let result = ok(&mut ex, "SELECT id FROM u WHERE email = 'b@x.com'");
        assert_eq!(result.row_count(), 0);
        let result = ok(&mut ex, "SELECT id FROM u WHERE email = 'z@x.com'");
        assert_eq!(result.row_count(), 1);

        ok(&mut ex, "DELETE FROM u WHERE id = 2");
        let result = ok(&mut ex, "SELECT id FROM u WHERE email = 'z@x.com'");
        assert_eq!(result.row_count(), 0);
    }

    #[test]
    fn test_distinct() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE t (v INTEGER)");
        ok(&mut ex, "INSERT INTO t VALUES (1), (1), (2)");
        let result = ok(&mut ex, "SELECT DISTINCT v FROM t");
        assert_eq!(result.row_count(), 2);
    }

    #[test]
    fn test_transaction_errors() {
        let (_dir, mut ex) = setup();
        assert!(ex.execute_sql("COMMIT").error.is_some());
        assert!(ex.execute_sql("ROLLBACK").error.is_some());

        assert!(ex.execute_sql("BEGIN").is_ok());
        assert!(ex.execute_sql("BEGIN").error.is_some());
        assert!(ex.execute_sql("COMMIT").is_ok());
    }

    #[test]
    fn test_rollback_reverses_inserts() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE t (v BIGINT)");
        ok(&mut ex, "INSERT INTO t VALUES (1)");

        ok(&mut ex, "BEGIN");
        ok(&mut ex, "INSERT INTO t VALUES (2), (3)");
        ok(&mut ex, "ROLLBACK");

        let result = ok(&mut ex, "SELECT v FROM t");
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.rows[0].get(0), Some(&Value::Int64(1)));
    }

    #[test]
    fn test_explicit_transaction_commits() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE t (v BIGINT)");

        ok(&mut ex, "BEGIN");
        ok(&mut ex, "INSERT INTO t VALUES (1)");
        ok(&mut ex, "COMMIT");

        assert_eq!(ok(&mut ex, "SELECT v FROM t").row_count(), 1);
    }

    #[test]
    fn test_drop_table() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE t (v BIGINT)");
        ok(&mut ex, "DROP TABLE t");
        assert!(ex.execute_sql("SELECT v FROM t").error.is_some());
        // and the name is free again
        ok(&mut ex, "CREATE TABLE t (v BIGINT)");
        assert!(ex.execute_sql("DROP TABLE missing").error.is_some());
        ok(&mut ex, "DROP TABLE IF EXISTS missing");
    }

    #[test]
    fn test_execution_time_recorded() {
        let (_dir, mut ex) = setup();
        ok(&mut ex, "CREATE TABLE t (v BIGINT)");
        let result = ok(&mut ex, "SELECT v FROM t");
        // zero is possible on a fast machine only if the clock is coarse
        assert!(result.execution_time_us < 10_000_000);
    }
}
