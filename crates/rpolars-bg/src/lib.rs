//! Background execution and structured errors for the rpolars binding layer.
//!
//! Two pieces:
//!
//! - [`error`]: the error context stack. Every layer that sees a failure can
//!   push one frame of context; the stack renders most recent frame first.
//! - A background execution engine. Native work runs on a thread
//!   ([`Handle::spawn_local`]); work that must call back into the host runs in
//!   a bounded pool of `rpolars-worker` processes ([`WorkerPool`]), with bulk
//!   columns handed over through shared memory ([`transfer`]).
//!
//! ```no_run
//! use rpolars_bg::{BackgroundEngine, HostCall, PoolConfig, Scalar, Work, WorkerPool};
//! use rpolars_bg::host::Callable;
//!
//! # fn main() -> rpolars_bg::RResult<()> {
//! let engine = BackgroundEngine::new(WorkerPool::new(PoolConfig::from_env()?)?);
//! let call = HostCall::CallScalar {
//!     callable: Callable::Scale { factor: 2.0 }.to_serialized(),
//!     arg: Scalar::Int64(21),
//! };
//! let mut handle = engine.execute(Work::<Scalar>::host(call), true)?;
//! assert_eq!(handle.join()?, Scalar::Float64(42.0));
//! # Ok(())
//! # }
//! ```

#[cfg(not(unix))]
compile_error!("rpolars-bg needs Unix domain sockets and POSIX shared memory");

pub mod config;
pub mod error;
pub mod execute;
pub mod handle;
pub mod host;
pub mod ipc;
pub mod pool;
pub mod transfer;

pub use config::PoolConfig;
pub use error::{ContextRecord, RPolarsErr, RResult, Rctx, RctxKind, WithRctx};
pub use execute::{BackgroundEngine, Work};
pub use handle::{Handle, ResponseSender, oneshot};
pub use host::{BuiltinHost, HostEvaluator};
pub use pool::{CallError, FromJobOutput, HostCall, Lease, PoolStatus, WorkerPool};
pub use transfer::{Column, ColumnValues, Scalar, SerializedCallable};
