//! Expression evaluation
//!
//! Evaluates expression trees against an optional (tuple, schema) context.
//! Aggregate functions have no meaning here on their own; once an Aggregate
//! operator has materialized them as output columns they resolve by their
//! canonical name, otherwise they evaluate to NULL.

use std::cmp::Ordering;

use crate::catalog::{DataType, Schema};
use crate::error::{Error, Result};
use crate::sql::ast::{BinaryOp, Expr, UnaryOp};
use crate::storage::tuple::{Tuple, Value};

/// Evaluation context: the current tuple and the schema it belongs to
pub type RowContext<'a> = Option<(&'a Tuple, &'a Schema)>;

/// Evaluate an expression. With no row context, column references are NULL.
pub fn evaluate(expr: &Expr, row: RowContext) -> Result<Value> {
    match expr {
        Expr::Constant(value) => Ok(value.clone()),

        Expr::Column { name, .. } => match row {
            Some((tuple, schema)) => {
                let idx = schema
                    .find_column(name)
                    .ok_or_else(|| Error::ColumnNotFound(name.clone()))?;
                Ok(tuple.get(idx).cloned().unwrap_or(Value::Null))
            }
            None => Ok(Value::Null),
        },

        Expr::Wildcard => Err(Error::ExecutionError(
            "'*' is only valid in a projection list".to_string(),
        )),

        Expr::Binary { left, op, right } => {
            let lhs = evaluate(left, row)?;
            let rhs = evaluate(right, row)?;
            evaluate_binary(&lhs, *op, &rhs)
        }

        Expr::Unary { op, expr } => {
            let value = evaluate(expr, row)?;
            evaluate_unary(*op, &value)
        }

        Expr::Function {
            name,
            args,
            distinct: _,
        } => evaluate_function(expr, name, args, row),

        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = evaluate(expr, row)?;
            if needle.is_null() {
                return Ok(Value::Null);
            }
            for item in list {
                let candidate = evaluate(item, row)?;
                if needle.compare(&candidate) == Some(Ordering::Equal) {
                    return Ok(Value::Bool(!negated));
                }
            }
            Ok(Value::Bool(*negated))
        }

        Expr::IsNull { expr, negated } => {
            let value = evaluate(expr, row)?;
            Ok(Value::Bool(value.is_null() != *negated))
        }

        Expr::Nested(inner) => evaluate(inner, row),
    }
}

/// Truthiness of a predicate result: only Bool(true) passes, NULL is falsy
pub fn is_truthy(value: &Value) -> bool {
    value.as_bool() == Some(true)
}

fn evaluate_binary(left: &Value, op: BinaryOp, right: &Value) -> Result<Value> {
    let type_error = || Error::TypeMismatch {
        expected: left.type_name().to_string(),
        found: right.type_name().to_string(),
    };

    match op {
        BinaryOp::Add => left.add(right).ok_or_else(type_error),
        BinaryOp::Sub => left.sub(right).ok_or_else(type_error),
        BinaryOp::Mul => left.mul(right).ok_or_else(type_error),
        BinaryOp::Div => {
            if right.as_f64() == Some(0.0) {
                return Err(Error::DivisionByZero);
            }
            left.div(right).ok_or_else(type_error)
        }
        BinaryOp::Mod => {
            if right.as_f64() == Some(0.0) {
                return Err(Error::DivisionByZero);
            }
            left.rem(right).ok_or_else(type_error)
        }

        BinaryOp::Concat => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Text(format!("{}{}", left, right)))
        }

        BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Lte
        | BinaryOp::Gte => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let ord = left.compare(right).ok_or_else(type_error)?;
            let result = match op {
                BinaryOp::Eq => ord == Ordering::Equal,
                BinaryOp::Neq => ord != Ordering::Equal,
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Gt => ord == Ordering::Greater,
                BinaryOp::Lte => ord != Ordering::Greater,
                BinaryOp::Gte => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }

        BinaryOp::And | BinaryOp::Or => {
            if left.is_null() || right.is_null() {
                return Ok(Value::Null);
            }
            let l = left.as_bool().ok_or_else(type_error)?;
            let r = right.as_bool().ok_or_else(type_error)?;
            Ok(Value::Bool(if op == BinaryOp::And {
                l && r
            } else {
                l || r
            }))
        }
    }
}

fn evaluate_unary(op: UnaryOp, value: &Value) -> Result<Value> {
    match op {
        UnaryOp::Not => {
            if value.is_null() {
                return Ok(Value::Null);
            }
            let b = value.as_bool().ok_or_else(|| Error::TypeMismatch {
                expected: "BOOLEAN".to_string(),
                found: value.type_name().to_string(),
            })?;
            Ok(Value::Bool(!b))
        }
        UnaryOp::Minus => match value {
            Value::Null => Ok(Value::Null),
            Value::Int32(i) => Ok(Value::Int32(-i)),
            Value::Int64(i) => Ok(Value::Int64(-i)),
            Value::Float64(f) => Ok(Value::Float64(-f)),
            other => Err(Error::TypeMismatch {
                expected: "numeric".to_string(),
                found: other.type_name().to_string(),
            }),
        },
        UnaryOp::Plus => Ok(value.clone()),
    }
}

fn evaluate_function(expr: &Expr, name: &str, args: &[Expr], row: RowContext) -> Result<Value> {
    let upper = name.to_uppercase();
    match upper.as_str() {
        // aggregates resolve against a schema the Aggregate operator built,
        // identified by their canonical printed name
        "COUNT" | "SUM" | "AVG" | "MIN" | "MAX" => {
            if let Some((tuple, schema)) = row {
                if let Some(idx) = schema.find_column(&expr.to_string()) {
                    return Ok(tuple.get(idx).cloned().unwrap_or(Value::Null));
                }
            }
            Ok(Value::Null)
        }

        "ABS" => {
            let value = eval_single_arg(&upper, args, row)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Int32(i) => Ok(Value::Int32(i.abs())),
                Value::Int64(i) => Ok(Value::Int64(i.abs())),
                Value::Float64(f) => Ok(Value::Float64(f.abs())),
                other => Err(Error::TypeMismatch {
                    expected: "numeric".to_string(),
                    found: other.type_name().to_string(),
                }),
            }
        }
        "UPPER" => {
            let value = eval_single_arg(&upper, args, row)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Text(s) => Ok(Value::Text(s.to_uppercase())),
                other => Err(Error::TypeMismatch {
                    expected: "TEXT".to_string(),
                    found: other.type_name().to_string(),
                }),
            }
        }
        "LOWER" => {
            let value = eval_single_arg(&upper, args, row)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Text(s) => Ok(Value::Text(s.to_lowercase())),
                other => Err(Error::TypeMismatch {
                    expected: "TEXT".to_string(),
                    found: other.type_name().to_string(),
                }),
            }
        }
        "LENGTH" => {
            let value = eval_single_arg(&upper, args, row)?;
            match value {
                Value::Null => Ok(Value::Null),
                Value::Text(s) => Ok(Value::Int64(s.chars().count() as i64)),
                other => Err(Error::TypeMismatch {
                    expected: "TEXT".to_string(),
                    found: other.type_name().to_string(),
                }),
            }
        }

        _ => Err(Error::ExecutionError(format!("unknown function: {}", name))),
    }
}

fn eval_single_arg(name: &str, args: &[Expr], row: RowContext) -> Result<Value> {
    let [arg] = args else {
        return Err(Error::ExecutionError(format!(
            "{} takes exactly one argument",
            name
        )));
    };
    evaluate(arg, row)
}

/// Best-effort result type of an expression under a given input schema,
/// used to synthesize operator output schemas.
pub fn infer_type(expr: &Expr, schema: &Schema) -> DataType {
    match expr {
        Expr::Constant(value) => match value {
            Value::Bool(_) => DataType::Bool,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float64(_) => DataType::Float64,
            Value::Bytes(_) => DataType::Bytes,
            Value::Date(_) => DataType::Date,
            Value::Timestamp(_) => DataType::Timestamp,
            _ => DataType::Text,
        },
        Expr::Column { name, .. } => schema
            .find_column(name)
            .map(|i| schema.column(i).unwrap().data_type.clone())
            .unwrap_or(DataType::Text),
        Expr::Wildcard => DataType::Text,
        Expr::Binary { left, op, right } => match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Mod => {
                if infer_type(left, schema) == DataType::Float64
                    || infer_type(right, schema) == DataType::Float64
                {
                    DataType::Float64
                } else {
                    DataType::Int64
                }
            }
            BinaryOp::Div => DataType::Float64,
            BinaryOp::Concat => DataType::Text,
            _ => DataType::Bool,
        },
        Expr::Unary { op, expr } => match op {
            UnaryOp::Not => DataType::Bool,
            _ => infer_type(expr, schema),
        },
        Expr::Function { name, args, .. } => match name.to_uppercase().as_str() {
            "COUNT" | "LENGTH" => DataType::Int64,
            "SUM" | "AVG" => DataType::Float64,
            "MIN" | "MAX" | "ABS" => args
                .first()
                .map(|a| infer_type(a, schema))
                .unwrap_or(DataType::Text),
            "UPPER" | "LOWER" => DataType::Text,
            _ => DataType::Text,
        },
        Expr::InList { .. } | Expr::IsNull { .. } => DataType::Bool,
        Expr::Nested(inner) => infer_type(inner, schema),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Parser;

    fn expr(sql: &str) -> Expr {
        // parse the predicate of a probe statement
        let stmt = Parser::new(&format!("SELECT a FROM t WHERE {}", sql))
            .unwrap()
            .parse()
            .unwrap();
        match stmt {
            crate::sql::Statement::Select(s) => s.where_clause.unwrap(),
            _ => unreachable!(),
        }
    }

    fn ctx() -> (Tuple, Schema) {
        let schema = Schema::from_columns(vec![
            ("id".to_string(), DataType::Int64),
            ("name".to_string(), DataType::Text),
            ("score".to_string(), DataType::Float64),
            ("missing".to_string(), DataType::Text),
        ]);
        let tuple = Tuple::new(vec![
            Value::Int64(7),
            Value::Text("Ada".to_string()),
            Value::Float64(2.5),
            Value::Null,
        ]);
        (tuple, schema)
    }

    #[test]
    fn test_constant_and_column() {
        let (tuple, schema) = ctx();
        assert_eq!(
            evaluate(&expr("id = 7"), Some((&tuple, &schema))).unwrap(),
            Value::Bool(true)
        );
        // no context: columns are NULL
        assert_eq!(evaluate(&expr("id"), None).unwrap(), Value::Null);
        // unknown column is a name resolution error
        assert!(matches!(
            evaluate(&expr("nope = 1"), Some((&tuple, &schema))),
            Err(Error::ColumnNotFound(_))
        ));
    }

    #[test]
    fn test_arithmetic_and_promotion() {
        let (tuple, schema) = ctx();
        let row = Some((&tuple, &schema));
        assert_eq!(evaluate(&expr("1 + 2 * 3"), row).unwrap(), Value::Int64(7));
        assert_eq!(
            evaluate(&expr("id + score"), row).unwrap(),
            Value::Float64(9.5)
        );
        assert_eq!(evaluate(&expr("7 / 2"), row).unwrap(), Value::Float64(3.5));
        assert_eq!(evaluate(&expr("7 % 4"), row).unwrap(), Value::Int64(3));
        assert!(matches!(
            evaluate(&expr("1 / 0"), row),
            Err(Error::DivisionByZero)
        ));
    }

    #[test]
    fn test_null_propagation() {
        let (tuple, schema) = ctx();
        let row = Some((&tuple, &schema));
        assert_eq!(evaluate(&expr("missing + 1"), row).unwrap(), Value::Null);
        assert_eq!(evaluate(&expr("missing = 1"), row).unwrap(), Value::Null);
        assert_eq!(
            evaluate(&expr("missing IS NULL"), row).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate(&expr("id IS NOT NULL"), row).unwrap(),
            Value::Bool(true)
        );
        assert!(!is_truthy(&Value::Null));
    }

    #[test]
    fn test_in_list() {
        let (tuple, schema) = ctx();
        let row = Some((&tuple, &schema));
        assert_eq!(
            evaluate(&expr("id IN (1, 7, 9)"), row).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate(&expr("id NOT IN (1, 7, 9)"), row).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(evaluate(&expr("missing IN (1)"), row).unwrap(), Value::Null);
    }

    #[test]
    fn test_logic_and_unary() {
        let (tuple, schema) = ctx();
        let row = Some((&tuple, &schema));
        assert_eq!(
            evaluate(&expr("id > 5 AND score < 3"), row).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate(&expr("NOT id > 5"), row).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(evaluate(&expr("-id"), row).unwrap(), Value::Int64(-7));
    }

    #[test]
    fn test_scalar_functions() {
        let (tuple, schema) = ctx();
        let row = Some((&tuple, &schema));
        assert_eq!(
            evaluate(&expr("UPPER(name) = 'ADA'"), row).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate(&expr("LOWER(name)"), row).unwrap(),
            Value::Text("ada".to_string())
        );
        assert_eq!(evaluate(&expr("ABS(0 - 4)"), row).unwrap(), Value::Int64(4));
        assert_eq!(evaluate(&expr("LENGTH(name)"), row).unwrap(), Value::Int64(3));
    }

    #[test]
    fn test_aggregate_without_operator_is_null() {
        let (tuple, schema) = ctx();
        assert_eq!(
            evaluate(&expr("COUNT(id)"), Some((&tuple, &schema))).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_aggregate_resolves_by_name() {
        // the Aggregate operator exposes "COUNT(val)" as a column
        let schema = Schema::from_columns(vec![
            ("cat".to_string(), DataType::Text),
            ("COUNT(val)".to_string(), DataType::Int64),
        ]);
        let tuple = Tuple::new(vec![Value::Text("A".to_string()), Value::Int64(2)]);
        assert_eq!(
            evaluate(&expr("COUNT(val) > 1"), Some((&tuple, &schema))).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_referential_transparency() {
        let (tuple, schema) = ctx();
        let row = Some((&tuple, &schema));
        let e = expr("id * 2 + LENGTH(name)");
        let first = evaluate(&e, row).unwrap();
        let second = evaluate(&e, row).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_infer_type() {
        let (_, schema) = ctx();
        assert_eq!(infer_type(&expr("id"), &schema), DataType::Int64);
        assert_eq!(infer_type(&expr("id + 1"), &schema), DataType::Int64);
        assert_eq!(infer_type(&expr("id / 2"), &schema), DataType::Float64);
        assert_eq!(infer_type(&expr("id > 1"), &schema), DataType::Bool);
        assert_eq!(infer_type(&expr("COUNT(id)"), &schema), DataType::Int64);
        assert_eq!(infer_type(&expr("SUM(id)"), &schema), DataType::Float64);
        assert_eq!(infer_type(&expr("MIN(name)"), &schema), DataType::Text);
    }
}
