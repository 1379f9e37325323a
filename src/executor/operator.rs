//! Volcano-style pull operators
//!
//! Each operator exposes `open`, `next` and `close`, owns its children, and
//! pulls tuples from them one at a time. Dispatch is a tagged enum rather
//! than trait objects; the set of operators is closed.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::cmp::Ordering;

use tracing::debug;

use crate::catalog::{DataType, Schema};
use crate::error::{Error, Result};
use crate::executor::eval::{evaluate, infer_type, is_truthy};
use crate::sql::ast::Expr;
use crate::storage::btree::BTreeIndex;
use crate::storage::heap::{HeapScan, HeapTable, RecordId};
use crate::storage::tuple::{Tuple, Value};

/// Operator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecState {
    Init,
    Open,
    Done,
}

/// Which aggregate a spec computes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// One aggregate requested from the Aggregate operator
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub func: AggFunc,
    /// Argument expression; None for COUNT(*)
    pub expr: Option<Expr>,
    pub distinct: bool,
    /// Canonical output column name, e.g. "SUM(val)"
    pub name: String,
}

impl AggregateSpec {
    /// Build a spec from an aggregate function expression
    pub fn from_expr(expr: &Expr) -> Option<AggregateSpec> {
        let Expr::Function {
            name,
            args,
            distinct,
        } = expr
        else {
            return None;
        };
        let func = match name.to_uppercase().as_str() {
            "COUNT" => AggFunc::Count,
            "SUM" => AggFunc::Sum,
            "AVG" => AggFunc::Avg,
            "MIN" => AggFunc::Min,
            "MAX" => AggFunc::Max,
            _ => return None,
        };
        Some(AggregateSpec {
            func,
            expr: args.first().cloned(),
            distinct: *distinct,
            name: expr.to_string(),
        })
    }
}

/// A node of the operator tree
pub enum Operator {
    SeqScan(SeqScanOp),
    IndexScan(IndexScanOp),
    Filter(FilterOp),
    Project(ProjectOp),
    Sort(SortOp),
    Aggregate(AggregateOp),
    HashJoin(HashJoinOp),
    Limit(LimitOp),
}

impl Operator {
    /// Sequential scan over a heap table
    pub fn seq_scan(table: HeapTable) -> Operator {
        let schema = table.schema().clone();
        Operator::SeqScan(SeqScanOp {
            table,
            schema,
            scan: None,
            state: ExecState::Init,
        })
    }

    /// Point lookup through a B+ tree index
    pub fn index_scan(table: HeapTable, index: BTreeIndex, key: Value) -> Operator {
        let schema = table.schema().clone();
        Operator::IndexScan(IndexScanOp {
            table,
            index,
            key,
            schema,
            rids: Vec::new(),
            pos: 0,
            state: ExecState::Init,
        })
    }

    /// Keep tuples whose predicate evaluates to TRUE
    pub fn filter(child: Operator, predicate: Expr) -> Operator {
        let schema = child.output_schema().clone();
        Operator::Filter(FilterOp {
            child: Box::new(child),
            predicate,
            schema,
            state: ExecState::Init,
        })
    }

    /// Evaluate a projection list against each input tuple
    pub fn project(child: Operator, exprs: Vec<Expr>) -> Operator {
        let input = child.output_schema();
        let mut schema = Schema::new();
        for expr in &exprs {
            match expr {
                Expr::Wildcard => {
                    for col in input.columns() {
                        schema.add_column(col.name.clone(), col.data_type.clone());
                    }
                }
                other => schema.add_column(other.to_string(), infer_type(other, input)),
            }
        }
        Operator::Project(ProjectOp {
            child: Box::new(child),
            exprs,
            schema,
            state: ExecState::Init,
        })
    }

    /// Stable sort on key expressions, each with its own direction
    pub fn sort(child: Operator, keys: Vec<(Expr, bool)>) -> Operator {
        let schema = child.output_schema().clone();
        Operator::Sort(SortOp {
            child: Box::new(child),
            keys,
            schema,
            rows: Vec::new(),
            pos: 0,
            state: ExecState::Init,
        })
    }

    /// Group and aggregate. Groups are keyed by the joined string form of
    /// the group-key values and emitted in that key order.
    pub fn aggregate(child: Operator, group_keys: Vec<Expr>, aggs: Vec<AggregateSpec>) -> Operator {
        let input = child.output_schema();
        let mut schema = Schema::new();
        for key in &group_keys {
            schema.add_column(key.to_string(), infer_type(key, input));
        }
        for agg in &aggs {
            let data_type = match agg.func {
                AggFunc::Count => DataType::Int64,
                AggFunc::Sum | AggFunc::Avg => DataType::Float64,
                AggFunc::Min | AggFunc::Max => agg
                    .expr
                    .as_ref()
                    .map(|e| infer_type(e, input))
                    .unwrap_or(DataType::Text),
            };
            schema.add_column(agg.name.clone(), data_type);
        }
        Operator::Aggregate(AggregateOp {
            child: Box::new(child),
            group_keys,
            aggs,
            schema,
            rows: Vec::new(),
            pos: 0,
            state: ExecState::Init,
        })
    }

    /// Hash join: the right side is built into a multimap at open, the left
    /// side streams through and probes it.
    pub fn hash_join(left: Operator, right: Operator, left_key: Expr, right_key: Expr) -> Operator {
        let schema = left.output_schema().join(right.output_schema());
        Operator::HashJoin(HashJoinOp {
            left: Box::new(left),
            right: Box::new(right),
            left_key,
            right_key,
            schema,
            table: HashMap::new(),
            pending: VecDeque::new(),
            state: ExecState::Init,
        })
    }

    /// Skip `offset` tuples, then emit at most `limit`
    pub fn limit(child: Operator, limit: Option<u64>, offset: u64) -> Operator {
        let schema = child.output_schema().clone();
        Operator::Limit(LimitOp {
            child: Box::new(child),
            limit,
            offset,
            emitted: 0,
            schema,
            state: ExecState::Init,
        })
    }

    /// Prepare the operator for pulling
    pub fn open(&mut self) -> Result<()> {
        match self {
            Operator::SeqScan(op) => op.open(),
            Operator::IndexScan(op) => op.open(),
            Operator::Filter(op) => op.open(),
            Operator::Project(op) => op.open(),
            Operator::Sort(op) => op.open(),
            Operator::Aggregate(op) => op.open(),
            Operator::HashJoin(op) => op.open(),
            Operator::Limit(op) => op.open(),
        }
    }

    /// Pull the next tuple, or None when exhausted
    pub fn next(&mut self) -> Result<Option<Tuple>> {
        match self {
            Operator::SeqScan(op) => op.next(),
            Operator::IndexScan(op) => op.next(),
            Operator::Filter(op) => op.next(),
            Operator::Project(op) => op.next(),
            Operator::Sort(op) => op.next(),
            Operator::Aggregate(op) => op.next(),
            Operator::HashJoin(op) => op.next(),
            Operator::Limit(op) => op.next(),
        }
    }

    /// Release resources, including children, whether or not the operator
    /// was drained
    pub fn close(&mut self) {
        match self {
            Operator::SeqScan(op) => op.close(),
            Operator::IndexScan(op) => op.close(),
            Operator::Filter(op) => op.child.close(),
            Operator::Project(op) => op.child.close(),
            Operator::Sort(op) => {
                op.rows.clear();
                op.child.close();
            }
            Operator::Aggregate(op) => {
                op.rows.clear();
                op.child.close();
            }
            Operator::HashJoin(op) => {
                op.table.clear();
                op.pending.clear();
                op.left.close();
                op.right.close();
            }
            Operator::Limit(op) => op.child.close(),
        }
    }

    /// Schema of the tuples this operator emits
    pub fn output_schema(&self) -> &Schema {
        match self {
            Operator::SeqScan(op) => &op.schema,
            Operator::IndexScan(op) => &op.schema,
            Operator::Filter(op) => &op.schema,
            Operator::Project(op) => &op.schema,
            Operator::Sort(op) => &op.schema,
            Operator::Aggregate(op) => &op.schema,
            Operator::HashJoin(op) => &op.schema,
            Operator::Limit(op) => &op.schema,
        }
    }
}

/// Sequential heap scan
pub struct SeqScanOp {
    table: HeapTable,
    schema: Schema,
    scan: Option<HeapScan>,
    state: ExecState,
}

impl SeqScanOp {
    fn open(&mut self) -> Result<()> {
        debug!(table = self.table.name(), "opening sequential scan");
        self.scan = Some(self.table.scan());
        self.state = ExecState::Open;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.state != ExecState::Open {
            return Ok(None);
        }
        let scan = self.scan.as_mut().expect("scan opened");
        match scan.next()? {
            Some((_, tuple)) => Ok(Some(tuple)),
            None => {
                self.state = ExecState::Done;
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.scan = None;
        self.state = ExecState::Done;
    }
}

/// Index point lookup resolving record ids against the heap
pub struct IndexScanOp {
    table: HeapTable,
    index: BTreeIndex,
    key: Value,
    schema: Schema,
    rids: Vec<RecordId>,
    pos: usize,
    state: ExecState,
}

impl IndexScanOp {
    fn open(&mut self) -> Result<()> {
        debug!(
            table = self.table.name(),
            index = self.index.filename(),
            "opening index scan"
        );
        self.rids = self.index.search(&self.key)?;
        self.pos = 0;
        self.state = ExecState::Open;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.state != ExecState::Open {
            return Ok(None);
        }
        while self.pos < self.rids.len() {
            let rid = self.rids[self.pos];
            self.pos += 1;
            // the index may run ahead of the heap; skip missing rows
            if let Some(tuple) = self.table.get(rid)? {
                return Ok(Some(tuple));
            }
        }
        self.state = ExecState::Done;
        Ok(None)
    }

    fn close(&mut self) {
        self.rids.clear();
        self.state = ExecState::Done;
    }
}

/// Predicate filter. NULL predicates drop the tuple.
pub struct FilterOp {
    child: Box<Operator>,
    predicate: Expr,
    schema: Schema,
    state: ExecState,
}

impl FilterOp {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;
        self.state = ExecState::Open;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.state != ExecState::Open {
            return Ok(None);
        }
        while let Some(tuple) = self.child.next()? {
            let verdict = evaluate(&self.predicate, Some((&tuple, &self.schema)))?;
            if is_truthy(&verdict) {
                return Ok(Some(tuple));
            }
        }
        self.state = ExecState::Done;
        Ok(None)
    }
}

/// Projection over the child's tuples
pub struct ProjectOp {
    child: Box<Operator>,
    exprs: Vec<Expr>,
    schema: Schema,
    state: ExecState,
}

impl ProjectOp {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;
        self.state = ExecState::Open;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.state != ExecState::Open {
            return Ok(None);
        }
        let Some(tuple) = self.child.next()? else {
            self.state = ExecState::Done;
            return Ok(None);
        };

        let input_schema = self.child.output_schema();
        let mut values = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            match expr {
                Expr::Wildcard => values.extend(tuple.values().iter().cloned()),
                other => values.push(evaluate(other, Some((&tuple, input_schema)))?),
            }
        }
        Ok(Some(Tuple::new(values)))
    }
}

/// Materializing stable sort
pub struct SortOp {
    child: Box<Operator>,
    /// (key expression, ascending) pairs
    keys: Vec<(Expr, bool)>,
    schema: Schema,
    rows: Vec<Tuple>,
    pos: usize,
    state: ExecState,
}

impl SortOp {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;

        // evaluate every key once per row, then sort on the materialized keys
        let mut keyed: Vec<(Vec<Value>, Tuple)> = Vec::new();
        while let Some(tuple) = self.child.next()? {
            let mut key_values = Vec::with_capacity(self.keys.len());
            for (expr, _) in &self.keys {
                key_values.push(evaluate(expr, Some((&tuple, &self.schema)))?);
            }
            keyed.push((key_values, tuple));
        }

        let directions: Vec<bool> = self.keys.iter().map(|(_, asc)| *asc).collect();
        keyed.sort_by(|(a, _), (b, _)| {
            for (i, asc) in directions.iter().enumerate() {
                let ord = a[i].compare(&b[i]).unwrap_or(Ordering::Equal);
                if ord != Ordering::Equal {
                    return if *asc { ord } else { ord.reverse() };
                }
            }
            Ordering::Equal
        });

        self.rows = keyed.into_iter().map(|(_, t)| t).collect();
        self.pos = 0;
        self.state = ExecState::Open;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.state != ExecState::Open {
            return Ok(None);
        }
        if self.pos < self.rows.len() {
            let tuple = self.rows[self.pos].clone();
            self.pos += 1;
            Ok(Some(tuple))
        } else {
            self.state = ExecState::Done;
            Ok(None)
        }
    }
}

/// Per-group running state for one aggregate
#[derive(Debug, Default)]
struct AggState {
    count: u64,
    sum: f64,
    min: Option<Value>,
    max: Option<Value>,
    seen: BTreeSet<String>,
}

impl AggState {
    fn update(&mut self, spec: &AggregateSpec, value: Option<Value>) -> Result<()> {
        let Some(value) = value else {
            // COUNT(*): no argument, every row counts
            self.count += 1;
            return Ok(());
        };
        if value.is_null() {
            return Ok(());
        }
        if spec.distinct && !self.seen.insert(value.to_string()) {
            return Ok(());
        }

        self.count += 1;
        match spec.func {
            AggFunc::Sum | AggFunc::Avg => {
                let n = value.as_f64().ok_or_else(|| Error::TypeMismatch {
                    expected: "numeric".to_string(),
                    found: value.type_name().to_string(),
                })?;
                self.sum += n;
            }
            AggFunc::Min => {
                let smaller = match &self.min {
                    Some(current) => value.compare(current) == Some(Ordering::Less),
                    None => true,
                };
                if smaller {
                    self.min = Some(value);
                }
            }
            AggFunc::Max => {
                let larger = match &self.max {
                    Some(current) => value.compare(current) == Some(Ordering::Greater),
                    None => true,
                };
                if larger {
                    self.max = Some(value);
                }
            }
            AggFunc::Count => {}
        }
        Ok(())
    }

    fn finish(&self, func: AggFunc) -> Value {
        match func {
            AggFunc::Count => Value::Int64(self.count as i64),
            AggFunc::Sum => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Float64(self.sum)
                }
            }
            AggFunc::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Float64(self.sum / self.count as f64)
                }
            }
            AggFunc::Min => self.min.clone().unwrap_or(Value::Null),
            AggFunc::Max => self.max.clone().unwrap_or(Value::Null),
        }
    }
}

struct GroupState {
    key_values: Vec<Value>,
    aggs: Vec<AggState>,
}

/// Grouping aggregate. The group map is ordered by the joined string form
/// of the key so output order is deterministic.
pub struct AggregateOp {
    child: Box<Operator>,
    group_keys: Vec<Expr>,
    aggs: Vec<AggregateSpec>,
    schema: Schema,
    rows: Vec<Tuple>,
    pos: usize,
    state: ExecState,
}

impl AggregateOp {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;

        let mut groups: BTreeMap<String, GroupState> = BTreeMap::new();
        let input_schema = self.child.output_schema().clone();

        while let Some(tuple) = self.child.next()? {
            let row = Some((&tuple, &input_schema));
            let mut key_values = Vec::with_capacity(self.group_keys.len());
            for key in &self.group_keys {
                key_values.push(evaluate(key, row)?);
            }
            let key = key_values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("|");

            let group = groups.entry(key).or_insert_with(|| GroupState {
                key_values,
                aggs: self.aggs.iter().map(|_| AggState::default()).collect(),
            });

            for (spec, state) in self.aggs.iter().zip(group.aggs.iter_mut()) {
                let value = match &spec.expr {
                    Some(expr) => Some(evaluate(expr, row)?),
                    None => None,
                };
                state.update(spec, value)?;
            }
        }

        // a global aggregate over an empty input still produces one row
        if groups.is_empty() && self.group_keys.is_empty() {
            groups.insert(
                String::new(),
                GroupState {
                    key_values: Vec::new(),
                    aggs: self.aggs.iter().map(|_| AggState::default()).collect(),
                },
            );
        }

        self.rows = groups
            .into_values()
            .map(|group| {
                let mut values = group.key_values;
                for (spec, state) in self.aggs.iter().zip(&group.aggs) {
                    values.push(state.finish(spec.func));
                }
                Tuple::new(values)
            })
            .collect();
        self.pos = 0;
        self.state = ExecState::Open;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.state != ExecState::Open {
            return Ok(None);
        }
        if self.pos < self.rows.len() {
            let tuple = self.rows[self.pos].clone();
            self.pos += 1;
            Ok(Some(tuple))
        } else {
            self.state = ExecState::Done;
            Ok(None)
        }
    }
}

/// Hash join keyed on the string form of the key expressions
pub struct HashJoinOp {
    left: Box<Operator>,
    right: Box<Operator>,
    left_key: Expr,
    right_key: Expr,
    schema: Schema,
    /// Build side: right tuples by key string
    table: HashMap<String, Vec<Tuple>>,
    /// Joined tuples for the current left row, drained before the next pull
    pending: VecDeque<Tuple>,
    state: ExecState,
}

impl HashJoinOp {
    fn open(&mut self) -> Result<()> {
        self.left.open()?;
        self.right.open()?;

        let right_schema = self.right.output_schema().clone();
        while let Some(tuple) = self.right.next()? {
            let key = evaluate(&self.right_key, Some((&tuple, &right_schema)))?;
            if key.is_null() {
                continue;
            }
            self.table.entry(key.to_string()).or_default().push(tuple);
        }
        self.state = ExecState::Open;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.state != ExecState::Open {
            return Ok(None);
        }
        loop {
            if let Some(tuple) = self.pending.pop_front() {
                return Ok(Some(tuple));
            }
            let Some(left_tuple) = self.left.next()? else {
                self.state = ExecState::Done;
                return Ok(None);
            };
            let left_schema = self.left.output_schema();
            let key = evaluate(&self.left_key, Some((&left_tuple, left_schema)))?;
            if key.is_null() {
                continue;
            }
            if let Some(matches) = self.table.get(&key.to_string()) {
                for right_tuple in matches {
                    self.pending.push_back(left_tuple.concat(right_tuple));
                }
            }
        }
    }
}

/// Offset and limit
pub struct LimitOp {
    child: Box<Operator>,
    /// None means no limit; the parser's unset state is preserved
    limit: Option<u64>,
    offset: u64,
    emitted: u64,
    schema: Schema,
    state: ExecState,
}

impl LimitOp {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;
        for _ in 0..self.offset {
            if self.child.next()?.is_none() {
                break;
            }
        }
        self.emitted = 0;
        self.state = ExecState::Open;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        if self.state != ExecState::Open {
            return Ok(None);
        }
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                self.state = ExecState::Done;
                return Ok(None);
            }
        }
        match self.child.next()? {
            Some(tuple) => {
                self.emitted += 1;
                Ok(Some(tuple))
            }
            None => {
                self.state = ExecState::Done;
                Ok(None)
            }
        }
    }
}
