use std::fmt;

use crate::ClientError;

use super::{Readable, StreamInput, StreamOutput, Streamable};

/// Identifier of a remote command, written as a compressed int at the start of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub i32);

impl CommandId {
    pub const PING: CommandId = CommandId(1);
    pub const TEST_CONNECTION: CommandId = CommandId(2);
    /// Streams every row of one table. Param: table id.
    pub const GET_TABLE: CommandId = CommandId(3);
    /// Asks the server to invalidate one table. Param: table id.
    pub const INVALIDATE_TABLE: CommandId = CommandId(4);
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CommandId::PING => write!(f, "PING"),
            CommandId::TEST_CONNECTION => write!(f, "TEST_CONNECTION"),
            CommandId::GET_TABLE => write!(f, "GET_TABLE"),
            CommandId::INVALIDATE_TABLE => write!(f, "INVALIDATE_TABLE"),
            CommandId(id) => write!(f, "#{id}"),
        }
    }
}

/// Entity type identifier: dense index of a table in the connector's table list and the
/// value exchanged on the wire when referring to that table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableId(pub u32);

impl TableId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Streamable for TableId {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        let id = i32::try_from(self.0)
            .map_err(|_| ClientError::protocol(format!("table id {} out of range", self.0)))?;
        out.write_compressed_int(id)
    }
}

impl Readable for TableId {
    fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
        let id = input.read_compressed_int()?;
        if id < 0 {
            return Err(ClientError::protocol(format!("negative table id {id}")));
        }
        Ok(TableId(id as u32))
    }
}
