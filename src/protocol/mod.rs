//! Client-master communication protocol.
//!
//! This module defines the binary protocol spoken between the client runtime and the master
//! server: primitive encodings, request framing, response status codes, structured error
//! descriptions and the invalidation list that follows mutating calls.
//!
//! # Overview
//!
//! A request is a compressed command identifier followed by command-specific parameters in a
//! fixed order. A response is a sequence of logical units, each introduced by one status byte:
//!
//! - [`status::DONE`]: the request succeeded and a fixed-shape result follows.
//! - [`status::NEXT`]: one more streamed row follows.
//! - any other value routes through [`check_result`], which decodes an error description and
//!   raises the matching [`ClientError`](crate::ClientError).
//!
//! # Key Components
//!
//! - [`StreamOutput`] / [`StreamInput`]: version-aware primitive writers and readers.
//! - [`ProtocolVersion`]: the totally ordered version tag negotiated per connection.
//! - [`CommandId`] / [`TableId`]: identifiers exchanged on the wire.
//!
//! # Extensibility
//!
//! Fields can be added over time without breaking older peers: a field introduced in version
//! *V* is guarded by a `since(V)` check on both sides, so peers older than *V* never see it.
//!
//! # See Also
//!
//! - [`connector`](crate::connector): executes requests over pooled connections.
mod codec;
mod command;
pub mod status;
mod version;

pub use codec::{Compressed, MAX_UTF_LENGTH, Readable, StreamInput, StreamOutput, Streamable};
pub use command::{CommandId, TableId};
pub use status::{RemoteError, RemoteErrorKind, check_result};
pub use version::ProtocolVersion;
