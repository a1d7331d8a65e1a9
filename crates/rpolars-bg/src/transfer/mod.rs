//! Payloads moved between the pool and its worker processes.
//!
//! ## Transfer Paths
//!
//! 1. **Inline**: host callables ([`SerializedCallable`], already serialized by
//!    the host) and small values ([`Scalar`]) travel inside the job message.
//!
//! 2. **Shared memory**: a [`Column`] larger than the configured threshold is
//!    rkyv-encoded into a named shared-memory segment and only its
//!    [`ShmDescriptor`] travels through the channel.
//!
//! Both ends still encode and decode the column. Shared memory saves the
//! copy through the socket, not the (de)serialization, because the engine's
//! column buffers cannot be mapped onto a segment directly.

mod shm;

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{RPolarsErr, RResult, Rctx, WithRctx};

pub use shm::SharedSegment;

/// Encode a value with rkyv.
pub fn encode(
    value: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> RResult<Vec<u8>> {
    rkyv::to_bytes::<rkyv::rancor::Error>(value)
        .map(|v| v.into_vec())
        .map_err(RPolarsErr::from)
        .when("encoding a payload")
}

/// Decode a value produced by [`encode`].
///
/// # Safety
///
/// Uses unchecked deserialization. Only bytes written by this crate (our own
/// worker processes and segments) are ever decoded.
pub fn decode<T>(bytes: &[u8]) -> RResult<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    // Archived data must sit at its natural alignment.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    // SAFETY: the bytes come from `encode` on the other end of our own channel.
    unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&aligned) }
        .map_err(RPolarsErr::from)
        .when("decoding a payload")
}

/// A host-language callable serialized by the host's own serializer.
///
/// Opaque to this crate: it is only carried and handed back to the host.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct SerializedCallable(Vec<u8>);

impl SerializedCallable {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short printable form for error frames.
    pub fn describe(&self) -> String {
        const MAX: usize = 80;
        match std::str::from_utf8(&self.0) {
            Ok(text) if text.chars().count() > MAX => {
                let head: String = text.chars().take(MAX).collect();
                format!("{head}...")
            }
            Ok(text) => text.to_string(),
            Err(_) => format!("<{} bytes of serialized callable>", self.0.len()),
        }
    }
}

/// A small value passed inline.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Int64(i) => write!(f, "{i}"),
            Self::Float64(x) => write!(f, "{x}"),
            Self::Utf8(s) => write!(f, "{s:?}"),
        }
    }
}

/// Typed, nullable column values.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ColumnValues {
    Float64(Vec<Option<f64>>),
    Int64(Vec<Option<i64>>),
    Boolean(Vec<Option<bool>>),
    Utf8(Vec<Option<String>>),
}

impl ColumnValues {
    pub fn dtype(&self) -> &'static str {
        match self {
            Self::Float64(_) => "f64",
            Self::Int64(_) => "i64",
            Self::Boolean(_) => "bool",
            Self::Utf8(_) => "str",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float64(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Boolean(v) => v.len(),
            Self::Utf8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named column of bulk data.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub values: ColumnValues,
}

impl Column {
    pub fn new(name: impl Into<String>, values: ColumnValues) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "column [{}] of type {} and length {}",
            self.name,
            self.values.dtype(),
            self.len()
        )
    }
}

/// Locates a shared-memory segment.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct ShmDescriptor {
    pub name: String,
    pub len: u64,
}

/// How a column travels through a job channel.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ColumnPayload {
    /// rkyv bytes carried in the message itself.
    Inline(Vec<u8>),
    /// rkyv bytes placed in a shared-memory segment.
    Shared(ShmDescriptor),
}

/// Segment backing a staged payload. Unlinked when dropped.
pub type SegmentGuard = SharedSegment;

/// Encode `column` for sending.
///
/// Columns whose encoding exceeds `shm_threshold` bytes are placed in shared
/// memory; the returned guard owns that segment and must outlive the send.
pub fn stage_column(
    column: &Column,
    shm_threshold: usize,
) -> RResult<(ColumnPayload, Option<SegmentGuard>)> {
    let bytes = encode(column).when("staging a column for a worker")?;

    if bytes.len() > shm_threshold {
        let segment = SharedSegment::create(&bytes)?;
        tracing::debug!(
            "Staged {} ({} bytes) in shared segment {}",
            column,
            bytes.len(),
            segment.name()
        );
        return Ok((ColumnPayload::Shared(segment.descriptor()), Some(segment)));
    }

    Ok((ColumnPayload::Inline(bytes), None))
}

/// Decode a received column.
///
/// With `claim`, a shared segment is unlinked after reading: the receiver
/// of a response owns the segments in it.
pub fn unstage_column(payload: &ColumnPayload, claim: bool) -> RResult<Column> {
    match payload {
        ColumnPayload::Inline(bytes) => decode(bytes),
        ColumnPayload::Shared(desc) => {
            let segment = SharedSegment::open(desc)?;
            let segment = if claim { segment.claim() } else { segment };
            decode(segment.as_bytes())
                .with_ctx(|| Rctx::When(format!("reading shared segment {}", desc.name)))
        }
    }
}

/// Free a received column without reading it.
///
/// For responses nobody will decode: unlinks a shared segment so it does not
/// outlive both processes.
pub fn discard_column(payload: &ColumnPayload) {
    let ColumnPayload::Shared(desc) = payload else {
        return;
    };
    match SharedSegment::open(desc) {
        Ok(segment) => drop(segment.claim()),
        Err(err) => tracing::debug!("Shared segment {} already gone: {}", desc.name, err.root()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(n: usize) -> Column {
        Column::new(
            "x",
            ColumnValues::Float64((0..n).map(|i| if i % 7 == 0 { None } else { Some(i as f64 * 0.5) }).collect()),
        )
    }

    #[test]
    fn test_small_column_stays_inline() {
        let column = floats(4);
        let (payload, guard) = stage_column(&column, 1 << 20).unwrap();
        assert!(matches!(payload, ColumnPayload::Inline(_)));
        assert!(guard.is_none());
        assert_eq!(unstage_column(&payload, true).unwrap(), column);
    }

    #[test]
    fn test_large_column_goes_through_shared_memory() {
        let column = floats(50_000);
        let (payload, guard) = stage_column(&column, 1024).unwrap();
        let ColumnPayload::Shared(desc) = &payload else {
            panic!("expected a shared payload, got {:?}", payload);
        };
        assert!(desc.len > 1024);

        // The reader borrows; the guard still owns the segment.
        assert_eq!(unstage_column(&payload, false).unwrap(), column);
        drop(guard);
        assert!(unstage_column(&payload, false).is_err());
    }

    #[test]
    fn test_discard_unlinks_shared_segment() {
        let (payload, guard) = stage_column(&floats(64), 0).unwrap();
        let ColumnPayload::Shared(desc) = &payload else {
            panic!("expected a shared payload");
        };
        // The sender gives the segment up, as a worker does with its reply.
        let desc = desc.clone();
        if let Some(guard) = guard {
            guard.hand_off();
        }

        discard_column(&payload);
        assert!(SharedSegment::open(&desc).is_err());

        // Inline payloads and missing segments are left alone.
        discard_column(&ColumnPayload::Inline(vec![1, 2, 3]));
        discard_column(&payload);
    }

    #[test]
    fn test_callable_describe() {
        let short = SerializedCallable::new("function(x) x * 2");
        assert_eq!(short.describe(), "function(x) x * 2");

        let long = SerializedCallable::new("a".repeat(200));
        assert_eq!(long.describe().len(), 83);

        let binary = SerializedCallable::new(vec![0xff, 0xfe, 0x00]);
        assert_eq!(binary.describe(), "<3 bytes of serialized callable>");
    }

    #[test]
    fn test_scalar_display() {
        assert_eq!(Scalar::Null.to_string(), "null");
        assert_eq!(Scalar::Int64(-3).to_string(), "-3");
        assert_eq!(Scalar::Utf8("a".into()).to_string(), "\"a\"");
    }

    #[test]
    fn test_column_display() {
        let column = Column::new("ok", ColumnValues::Boolean(vec![Some(true), None]));
        assert_eq!(column.to_string(), "column [ok] of type bool and length 2");
    }
}
