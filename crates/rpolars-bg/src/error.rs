//! Error context stacks for rpolars-bg.
//!
//! A failure is an [`RPolarsErr`]: a root cause plus the context frames
//! ([`Rctx`]) pushed onto it while it propagates outward through call layers.
//! A frame's text is finished the moment it is pushed.
//!
//! ```
//! use rpolars_bg::error::{RPolarsErr, RResult, WithRctx};
//!
//! let r: RResult<i32> = Err(RPolarsErr::lift("disk full"));
//! let err = r
//!     .when("writing the parquet file")
//!     .hint("check free space")
//!     .unwrap_err();
//!
//! assert_eq!(
//!     err.render(),
//!     "0: Hint: check free space\n1: When writing the parquet file\n2: disk full"
//! );
//! ```

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

/// Result type for every fallible operation in this crate.
pub type RResult<T> = std::result::Result<T, RPolarsErr>;

/// One context frame of an error stack.
#[derive(Debug, Clone, PartialEq, Eq, Error, Archive, Serialize, Deserialize)]
pub enum Rctx {
    /// What was being attempted when the failure happened.
    #[error("When {0}")]
    When(String),

    /// Suggestion for the user.
    #[error("Hint: {0}")]
    Hint(String),

    /// A rendered value that was rejected.
    #[error("Encountered bad value: {0}")]
    BadVal(String),

    /// Name of the argument that caused the failure.
    #[error("The argument [{0}] caused an error")]
    BadArgument(String),

    /// Expected type of a value.
    #[error("Expected a value of type [{0}]")]
    Mistyped(String),

    /// Expectation a value did not meet.
    #[error("Expected a value that {0}")]
    Misvalued(String),

    /// Allowed choices for a value.
    #[error("Expected one of {0}")]
    NotAChoice(String),

    #[error("Type mismatch: expected [{expected}], got [{actual}]")]
    TypeMismatch { expected: String, actual: String },

    /// A host callback raised while being evaluated.
    #[error("Evaluating [{expr}] with argument [{arg}] raised an error")]
    EvalError { expr: String, arg: String },

    /// Spawning a worker, or talking to one, failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A background thread or host callback panicked.
    #[error("Background task panicked: {0}")]
    Panic(String),

    /// `join` was called on a handle that was already joined.
    #[error("Handle was already joined")]
    UseAfterJoin,

    #[error("{0}")]
    Plain(String),

    /// A foreign error lifted into a stack. Always a root frame.
    #[error("{0}")]
    Foreign(String),
}

/// Discriminant of an [`Rctx`], for matching without parsing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RctxKind {
    When,
    Hint,
    BadVal,
    BadArgument,
    Mistyped,
    Misvalued,
    NotAChoice,
    TypeMismatch,
    EvalError,
    Transport,
    Panic,
    UseAfterJoin,
    Plain,
    Foreign,
}

impl RctxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::When => "when",
            Self::Hint => "hint",
            Self::BadVal => "bad_val",
            Self::BadArgument => "bad_argument",
            Self::Mistyped => "mistyped",
            Self::Misvalued => "misvalued",
            Self::NotAChoice => "not_a_choice",
            Self::TypeMismatch => "type_mismatch",
            Self::EvalError => "eval_error",
            Self::Transport => "transport",
            Self::Panic => "panic",
            Self::UseAfterJoin => "use_after_join",
            Self::Plain => "plain",
            Self::Foreign => "foreign",
        }
    }
}

impl fmt::Display for RctxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Rctx {
    pub fn kind(&self) -> RctxKind {
        match self {
            Self::When(_) => RctxKind::When,
            Self::Hint(_) => RctxKind::Hint,
            Self::BadVal(_) => RctxKind::BadVal,
            Self::BadArgument(_) => RctxKind::BadArgument,
            Self::Mistyped(_) => RctxKind::Mistyped,
            Self::Misvalued(_) => RctxKind::Misvalued,
            Self::NotAChoice(_) => RctxKind::NotAChoice,
            Self::TypeMismatch { .. } => RctxKind::TypeMismatch,
            Self::EvalError { .. } => RctxKind::EvalError,
            Self::Transport(_) => RctxKind::Transport,
            Self::Panic(_) => RctxKind::Panic,
            Self::UseAfterJoin => RctxKind::UseAfterJoin,
            Self::Plain(_) => RctxKind::Plain,
            Self::Foreign(_) => RctxKind::Foreign,
        }
    }
}

/// A frame as exposed to the binding layer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ContextRecord {
    pub kind: RctxKind,
    pub message: String,
}

/// An error stack: the root cause plus every context frame pushed onto it.
///
/// Never empty. Frames are exposed most recent first, so the root cause is
/// always the last entry of [`contexts`](Self::contexts) and the last line of
/// [`render`](Self::render).
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct RPolarsErr {
    /// Push order: index 0 is the root cause.
    frames: Vec<Rctx>,
    /// Host call that triggered the failure, attached by the binding layer.
    rcall: Option<String>,
    /// Free-form extra information from the binding layer.
    rinfo: Option<String>,
}

impl RPolarsErr {
    /// Create a stack whose root cause is `root`.
    pub fn new(root: Rctx) -> Self {
        Self {
            frames: vec![root],
            rcall: None,
            rinfo: None,
        }
    }

    /// Wrap a foreign failure as a one-frame stack.
    pub fn lift(err: impl fmt::Display) -> Self {
        Self::new(Rctx::Foreign(err.to_string()))
    }

    /// Shorthand for a stack rooted in a transport failure.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::new(Rctx::Transport(msg.into()))
    }

    /// Append a frame.
    pub fn push(mut self, frame: Rctx) -> Self {
        self.frames.push(frame);
        self
    }

    /// Number of frames, root included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Frames, most recent first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Rctx> + ExactSizeIterator {
        self.frames.iter().rev()
    }

    /// The deepest cause.
    pub fn root(&self) -> &Rctx {
        &self.frames[0]
    }

    /// The frame pushed last (the root for a one-frame stack).
    pub fn last_pushed(&self) -> &Rctx {
        &self.frames[self.frames.len() - 1]
    }

    /// `(kind, message)` records, most recent first.
    pub fn contexts(&self) -> Vec<ContextRecord> {
        self.iter()
            .map(|frame| ContextRecord {
                kind: frame.kind(),
                message: frame.to_string(),
            })
            .collect()
    }

    /// Numbered rendering, one `N: <frame>` entry per frame, most recent
    /// first. Continuation lines of multi-line frame text are indented under
    /// the text of their own entry.
    pub fn render(&self) -> String {
        self.iter()
            .enumerate()
            .map(|(i, frame)| {
                let prefix = format!("{i}: ");
                let indent = format!("\n{}", " ".repeat(prefix.len()));
                format!("{prefix}{}", frame.to_string().replace('\n', &indent))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Whether any frame records a transport failure.
    pub fn is_transport(&self) -> bool {
        self.frames
            .iter()
            .any(|f| matches!(f, Rctx::Transport(_)))
    }

    pub fn with_rcall(mut self, rcall: impl Into<String>) -> Self {
        self.rcall = Some(rcall.into());
        self
    }

    pub fn with_rinfo(mut self, rinfo: impl Into<String>) -> Self {
        self.rinfo = Some(rinfo.into());
        self
    }

    pub fn rcall(&self) -> Option<&str> {
        self.rcall.as_deref()
    }

    pub fn rinfo(&self) -> Option<&str> {
        self.rinfo.as_deref()
    }
}

impl fmt::Display for RPolarsErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl std::error::Error for RPolarsErr {}

impl From<Rctx> for RPolarsErr {
    fn from(root: Rctx) -> Self {
        Self::new(root)
    }
}

impl From<std::io::Error> for RPolarsErr {
    fn from(e: std::io::Error) -> Self {
        Self::lift(e)
    }
}

impl From<rkyv::rancor::Error> for RPolarsErr {
    fn from(e: rkyv::rancor::Error) -> Self {
        Self::lift(e)
    }
}

impl From<serde_json::Error> for RPolarsErr {
    fn from(e: serde_json::Error) -> Self {
        Self::lift(e)
    }
}

/// Push a frame onto a failing result.
///
/// A successful `result` is returned as is: `frame` is never called, so
/// nothing is allocated.
#[inline]
pub fn push<T, F>(result: RResult<T>, frame: F) -> RResult<T>
where
    F: FnOnce() -> Rctx,
{
    match result {
        Ok(value) => Ok(value),
        Err(err) => Err(err.push(frame())),
    }
}

/// Context-pushing combinators on [`RResult`].
///
/// String arguments are only converted on the failure branch.
pub trait WithRctx<T>: Sized {
    /// Push a frame built by `f`, called only on failure.
    fn with_ctx<F: FnOnce() -> Rctx>(self, f: F) -> RResult<T>;

    /// Push an already built frame.
    fn ctx(self, frame: Rctx) -> RResult<T> {
        self.with_ctx(|| frame)
    }

    fn when(self, what: impl Into<String>) -> RResult<T> {
        self.with_ctx(|| Rctx::When(what.into()))
    }

    fn hint(self, hint: impl Into<String>) -> RResult<T> {
        self.with_ctx(|| Rctx::Hint(hint.into()))
    }

    fn bad_val(self, val: impl Into<String>) -> RResult<T> {
        self.with_ctx(|| Rctx::BadVal(val.into()))
    }

    fn bad_arg(self, arg: impl Into<String>) -> RResult<T> {
        self.with_ctx(|| Rctx::BadArgument(arg.into()))
    }

    fn mistyped(self, ty: impl Into<String>) -> RResult<T> {
        self.with_ctx(|| Rctx::Mistyped(ty.into()))
    }

    fn misvalued(self, expectation: impl Into<String>) -> RResult<T> {
        self.with_ctx(|| Rctx::Misvalued(expectation.into()))
    }

    fn plain(self, text: impl Into<String>) -> RResult<T> {
        self.with_ctx(|| Rctx::Plain(text.into()))
    }

    fn transport(self, what: impl Into<String>) -> RResult<T> {
        self.with_ctx(|| Rctx::Transport(what.into()))
    }
}

impl<T> WithRctx<T> for RResult<T> {
    #[inline]
    fn with_ctx<F: FnOnce() -> Rctx>(self, f: F) -> RResult<T> {
        push(self, f)
    }
}
