//! Response status codes, structured remote errors and invalidation lists.
use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};

use crate::{ClientError, connector::retry::is_immediate_fail_message};

use super::{Readable, StreamInput, StreamOutput, Streamable, TableId};

/// Request succeeded; a fixed-shape result follows.
pub const DONE: u8 = 0;
/// One more streamed row follows.
pub const NEXT: u8 = 1;
/// Server-side I/O failure; a bounded message follows.
pub const IO_EXCEPTION: u8 = 2;
/// Server-side SQL failure; a bounded message follows.
pub const SQL_EXCEPTION: u8 = 3;
/// Structured [`RemoteError`] follows.
pub const ERROR: u8 = 4;

/// Terminates an invalidation list on the wire.
const END_OF_LIST: i32 = -1;

fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Io,
    Sql,
    Authentication,
    Authorization,
    DataIntegrity,
    Unsupported,
    Other,
}

/// Error description sent by the server after an [`ERROR`] status.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<RemoteError> for ClientError {
    fn from(value: RemoteError) -> Self {
        match value.kind {
            RemoteErrorKind::Authentication | RemoteErrorKind::Authorization => {
                ClientError::ImmediateFail(value.message)
            }
            RemoteErrorKind::DataIntegrity => ClientError::DataIntegrity(value.message),
            RemoteErrorKind::Unsupported => ClientError::Unsupported(value.message),
            _ if is_immediate_fail_message(&value.message) => {
                ClientError::ImmediateFail(value.message)
            }
            kind => ClientError::Remote {
                kind,
                message: value.message,
            },
        }
    }
}

/// Decodes the error description that follows a non-`DONE`, non-`NEXT` status.
///
/// Always produces an error; a failure while decoding the description is returned in
/// its place.
pub fn check_result(code: u8, input: &mut StreamInput<'_>) -> ClientError {
    let decoded = match code {
        IO_EXCEPTION => input
            .read_utf()
            .map(|message| RemoteError::new(RemoteErrorKind::Io, message)),
        SQL_EXCEPTION => input
            .read_utf()
            .map(|message| RemoteError::new(RemoteErrorKind::Sql, message)),
        ERROR => decode_from_std_read::<RemoteError, _, _>(&mut input.reader(), config())
            .map_err(|e| ClientError::protocol(format!("failed to decode remote error: {e}"))),
        DONE | NEXT => {
            return ClientError::protocol(format!("unexpected status code {code}"));
        }
        other => return ClientError::protocol(format!("unknown status code {other}")),
    };

    match decoded {
        Ok(remote) => remote.into(),
        Err(e) => e,
    }
}

/// Reads one status byte, succeeding only on [`DONE`].
pub fn expect_done(input: &mut StreamInput<'_>) -> Result<(), ClientError> {
    match input.read_status()? {
        DONE => Ok(()),
        code => Err(check_result(code, input)),
    }
}

pub fn write_remote_error(out: &mut StreamOutput<'_>, err: &RemoteError) -> Result<(), ClientError> {
    out.write_byte(ERROR)?;
    encode_into_std_write(err, &mut out.writer(), config())
        .map_err(|e| ClientError::protocol(format!("failed to encode remote error: {e}")))?;
    Ok(())
}

/// Reads an invalidation list; an empty list means no change.
pub fn read_invalidation_list(input: &mut StreamInput<'_>) -> Result<Vec<TableId>, ClientError> {
    let mut list = Vec::new();
    loop {
        let id = input.read_compressed_int()?;
        if id == END_OF_LIST {
            return Ok(list);
        }
        if id < 0 {
            return Err(ClientError::protocol(format!(
                "invalid table id {id} in invalidation list"
            )));
        }
        list.push(TableId(id as u32));
    }
}

pub fn write_invalidation_list(
    out: &mut StreamOutput<'_>,
    list: &[TableId],
) -> Result<(), ClientError> {
    for id in list {
        id.write_to(out)?;
    }
    out.write_compressed_int(END_OF_LIST)
}

impl Readable for Vec<TableId> {
    fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
        read_invalidation_list(input)
    }
}
