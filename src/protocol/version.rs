use std::{fmt, str::FromStr};

use crate::ClientError;

/// Totally ordered protocol version tag negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    /// Oldest version this client still speaks.
    pub const V1_0_0: ProtocolVersion = ProtocolVersion::new(1, 0, 0);
    /// Adds the "want progress" flag and declared row count to streamed fetches.
    pub const V1_1_0: ProtocolVersion = ProtocolVersion::new(1, 1, 0);

    pub const OLDEST: ProtocolVersion = Self::V1_0_0;
    pub const CURRENT: ProtocolVersion = Self::V1_1_0;

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.trim().split('.').collect::<Vec<&str>>();
        if parts.len() != 3 {
            return Err(ClientError::protocol(format!(
                "malformed protocol version '{s}'"
            )));
        }

        let mut out = [0u16; 3];
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = part.parse::<u16>().map_err(|_| {
                ClientError::protocol(format!("malformed protocol version '{s}'"))
            })?;
        }

        Ok(Self::new(out[0], out[1], out[2]))
    }
}
