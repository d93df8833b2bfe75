//! `jobforge-protocol` — supervisor ⇄ worker wire protocol.
//!
//! Newline-delimited JSON over the worker's stdin/stdout. One message per
//! line; the worker's stderr is left for its logs.

pub mod codec;
pub mod message;

pub use codec::{LineReader, LineWriter, ProtocolError, decode_line, encode_line};
pub use message::{ExecuteJob, FromWorker, Reply, RequestBody, RequestId, ToWorker};
