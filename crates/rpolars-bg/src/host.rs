//! Host callbacks evaluated inside worker processes.
//!
//! The worker never interprets a [`SerializedCallable`] itself; it hands the
//! bytes to a [`HostEvaluator`]. [`BuiltinHost`] is the evaluator shipped
//! with the `rpolars-worker` binary: its callables are small JSON programs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RPolarsErr, RResult, Rctx, WithRctx};
use crate::transfer::{Column, ColumnValues, Scalar, SerializedCallable};

/// Evaluates host callables on behalf of a worker.
pub trait HostEvaluator {
    /// Map a whole column through `callable`.
    fn call_column(&self, callable: &SerializedCallable, column: &Column) -> RResult<Column>;

    /// Call `callable` on one value.
    fn call_scalar(&self, callable: &SerializedCallable, arg: &Scalar) -> RResult<Scalar>;
}

/// Programs understood by [`BuiltinHost`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Callable {
    Identity,
    /// Multiply numbers; the result is always `f64`.
    Scale { factor: f64 },
    /// Add to numbers; the result is always `f64`.
    Offset { by: f64 },
    /// The evaluating process id.
    Pid,
    /// Sleep, then behave like `identity`.
    Sleep { ms: u64 },
    Panic { message: String },
    Raise { message: String },
    /// Terminate the evaluating process.
    Exit { code: i32 },
    Abort,
}

impl Callable {
    pub fn to_serialized(&self) -> SerializedCallable {
        // A tagged enum of plain fields always serializes.
        SerializedCallable::new(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn parse(callable: &SerializedCallable) -> RResult<Self> {
        serde_json::from_slice(callable.as_bytes())
            .map_err(RPolarsErr::from)
            .with_ctx(|| Rctx::Mistyped("builtin callable".to_string()))
    }
}

/// Evaluator for JSON-encoded [`Callable`] programs.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinHost;

impl HostEvaluator for BuiltinHost {
    fn call_column(&self, callable: &SerializedCallable, column: &Column) -> RResult<Column> {
        let values = match Callable::parse(callable)? {
            Callable::Identity => column.values.clone(),
            Callable::Scale { factor } => map_numeric(&column.values, |x| x * factor)?,
            Callable::Offset { by } => map_numeric(&column.values, |x| x + by)?,
            Callable::Pid => {
                ColumnValues::Int64(vec![Some(i64::from(std::process::id())); column.len()])
            }
            Callable::Sleep { ms } => {
                std::thread::sleep(Duration::from_millis(ms));
                column.values.clone()
            }
            other => return Err(terminal(other)),
        };
        Ok(Column::new(column.name.clone(), values))
    }

    fn call_scalar(&self, callable: &SerializedCallable, arg: &Scalar) -> RResult<Scalar> {
        match Callable::parse(callable)? {
            Callable::Identity => Ok(arg.clone()),
            Callable::Scale { factor } => scalar_numeric(arg, |x| x * factor),
            Callable::Offset { by } => scalar_numeric(arg, |x| x + by),
            Callable::Pid => Ok(Scalar::Int64(i64::from(std::process::id()))),
            Callable::Sleep { ms } => {
                std::thread::sleep(Duration::from_millis(ms));
                Ok(arg.clone())
            }
            other => Err(terminal(other)),
        }
    }
}

/// Programs that never produce a value.
fn terminal(callable: Callable) -> RPolarsErr {
    match callable {
        Callable::Panic { message } => panic!("{message}"),
        Callable::Raise { message } => RPolarsErr::lift(message),
        Callable::Exit { code } => {
            tracing::warn!("Exiting with code {} on request", code);
            std::process::exit(code)
        }
        Callable::Abort => std::process::abort(),
        other => RPolarsErr::new(Rctx::Plain(format!("{other:?} produces a value"))),
    }
}

fn map_numeric(values: &ColumnValues, f: impl Fn(f64) -> f64) -> RResult<ColumnValues> {
    match values {
        ColumnValues::Float64(v) => Ok(ColumnValues::Float64(
            v.iter().map(|x| x.map(&f)).collect(),
        )),
        ColumnValues::Int64(v) => Ok(ColumnValues::Float64(
            v.iter().map(|x| x.map(|i| f(i as f64))).collect(),
        )),
        other => Err(RPolarsErr::new(Rctx::Mistyped("f64 or i64".to_string()))
            .push(Rctx::BadVal(format!("a {} column", other.dtype())))),
    }
}

fn scalar_numeric(arg: &Scalar, f: impl Fn(f64) -> f64) -> RResult<Scalar> {
    match arg {
        Scalar::Null => Ok(Scalar::Null),
        Scalar::Float64(x) => Ok(Scalar::Float64(f(*x))),
        Scalar::Int64(i) => Ok(Scalar::Float64(f(*i as f64))),
        other => Err(RPolarsErr::new(Rctx::Mistyped("f64 or i64".to_string()))
            .push(Rctx::BadVal(other.to_string()))),
    }
}
