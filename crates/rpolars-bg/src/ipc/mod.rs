//! Inter-process communication with worker processes.

pub mod protocol;
mod rendezvous;
pub mod serve;
mod worker;

pub use protocol::{
    Handshake, Job, JobOutcome, JobOutput, JobRequest, JobResponse, MAX_MESSAGE_LEN,
    read_message, try_read_message, write_message,
};
pub use rendezvous::{OneShotListener, connect};
pub use serve::{execute_job, run_worker, serve};
pub use worker::{ProcessLauncher, WORKER_BIN, WorkerProcess, find_worker_binary};
