//! IPC protocol messages for rpolars worker processes.
//!
//! Uses length-prefixed rkyv messages over Unix sockets.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{ErrorKind, Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{RPolarsErr, RResult, Rctx};
use crate::transfer::{ColumnPayload, Scalar, SerializedCallable, decode, encode};

/// Sanity cap on a single message (100MB).
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Sent by a freshly started worker over the rendezvous channel.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Handshake {
    /// Worker process id.
    pub pid: u32,
    /// Name of the job channel the worker is listening on.
    pub job_channel: String,
}

/// A unit of work for a worker process.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Job {
    /// Map a column through a host callback.
    MapColumn {
        callable: SerializedCallable,
        column: ColumnPayload,
    },

    /// Call a host callback on one value.
    CallScalar {
        callable: SerializedCallable,
        arg: Scalar,
    },
}

impl Job {
    /// Operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MapColumn { .. } => "map_column",
            Self::CallScalar { .. } => "call_scalar",
        }
    }
}

/// Successful result of a job.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum JobOutput {
    Column(ColumnPayload),
    Scalar(Scalar),
}

/// What a worker sends back for one job.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum JobOutcome {
    Ok(JobOutput),
    /// The full error stack built inside the worker.
    Err(RPolarsErr),
}

impl From<RResult<JobOutput>> for JobOutcome {
    fn from(result: RResult<JobOutput>) -> Self {
        match result {
            Ok(output) => Self::Ok(output),
            Err(err) => Self::Err(err),
        }
    }
}

impl From<JobOutcome> for RResult<JobOutput> {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Ok(output) => Ok(output),
            JobOutcome::Err(err) => Err(err),
        }
    }
}

/// Pool → worker.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: u64,
    pub job: Job,
}

/// Worker → pool. Exactly one per request.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: u64,
    pub outcome: JobOutcome,
}

fn io_failure(e: std::io::Error, what: &'static str) -> RPolarsErr {
    RPolarsErr::lift(e).push(Rctx::Transport(what.to_string()))
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> RResult<()> {
    let bytes = encode(message)?;
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(RPolarsErr::transport(format!(
            "IPC message too large: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| io_failure(e, "writing IPC message length"))?;
    writer
        .write_all(&bytes)
        .map_err(|e| io_failure(e, "writing IPC message body"))?;
    writer
        .flush()
        .map_err(|e| io_failure(e, "flushing IPC stream"))?;

    Ok(())
}

/// Read one message, or `None` if the peer closed the channel cleanly
/// before a new message started.
pub fn try_read_message<R: Read, T>(reader: &mut R) -> RResult<Option<T>>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(io_failure(e, "reading IPC message length")),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(RPolarsErr::transport(format!(
            "IPC message too large: {} bytes",
            len
        )));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| io_failure(e, "reading IPC message body"))?;

    decode(&bytes).map(Some)
}

/// Read one message; a closed channel is a transport error.
pub fn read_message<R: Read, T>(reader: &mut R) -> RResult<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    try_read_message(reader)?
        .ok_or_else(|| RPolarsErr::transport("peer closed the IPC channel"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RctxKind, WithRctx};
    use std::io::Cursor;

    #[test]
    fn test_request_roundtrip() {
        let request = JobRequest {
            job_id: 9,
            job: Job::MapColumn {
                callable: SerializedCallable::new("function(s) s * 2"),
                column: ColumnPayload::Inline(vec![1, 2, 3]),
            },
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &request).unwrap();

        let mut cursor = Cursor::new(buf);
        let decoded: JobRequest = read_message(&mut cursor).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.job.name(), "map_column");
    }

    #[test]
    fn test_error_outcome_keeps_stack() {
        let err = Err::<JobOutput, _>(RPolarsErr::lift("callback failed"))
            .with_ctx(|| Rctx::EvalError {
                expr: "f".into(),
                arg: "1".into(),
            })
            .unwrap_err();
        let response = JobResponse {
            job_id: 1,
            outcome: JobOutcome::Err(err.clone()),
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &response).unwrap();
        let decoded: JobResponse = read_message(&mut Cursor::new(buf)).unwrap();

        let result: RResult<JobOutput> = decoded.outcome.into();
        assert_eq!(result.unwrap_err(), err);
    }

    #[test]
    fn test_clean_eof_is_none() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        let msg: Option<JobRequest> = try_read_message(&mut empty).unwrap();
        assert!(msg.is_none());

        let err = read_message::<_, JobRequest>(&mut Cursor::new(Vec::new())).unwrap_err();
        assert_eq!(err.root().kind(), RctxKind::Transport);
    }

    #[test]
    fn test_truncated_body_is_transport_error() {
        let mut buf = Vec::new();
        write_message(
            &mut buf,
            &Handshake {
                pid: 42,
                job_channel: "/tmp/x.sock".into(),
            },
        )
        .unwrap();
        buf.truncate(buf.len() - 2);

        let err = read_message::<_, Handshake>(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = ((MAX_MESSAGE_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        let err = read_message::<_, Handshake>(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.render().contains("too large"));
    }
}
