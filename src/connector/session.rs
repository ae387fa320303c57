use std::sync::{Mutex, PoisonError};

use log::info;

use crate::{
    ClientError,
    protocol::{ProtocolVersion, status::expect_done},
};

use super::connection::{Connection, Transport};

/// Marker for a connector id the server has not assigned yet.
pub const UNASSIGNED_ID: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Identity the session acts as.
    pub connect_as: String,
    /// Identity whose password is checked; may differ when switching users.
    pub authenticate_as: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            authenticate_as: username.clone(),
            connect_as: username,
            password: password.into(),
        }
    }
}

/// Identity of one logical client and the handshake every fresh transport performs.
#[derive(Debug)]
pub struct Session {
    credentials: Credentials,
    version: ProtocolVersion,
    id: Mutex<i64>,
}

impl Session {
    pub fn new(credentials: Credentials, version: ProtocolVersion) -> Self {
        Self {
            credentials,
            version,
            id: Mutex::new(UNASSIGNED_ID),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Version this client offers during the handshake.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Server-assigned connector id, `None` until the first successful handshake.
    pub fn connector_id(&self) -> Option<i64> {
        let id = *self.id.lock().unwrap_or_else(PoisonError::into_inner);
        (id != UNASSIGNED_ID).then_some(id)
    }

    fn assign(&self, assigned: i64) {
        let mut id = self.id.lock().unwrap_or_else(PoisonError::into_inner);
        if *id == UNASSIGNED_ID && assigned != UNASSIGNED_ID {
            info!("server assigned connector id {assigned}");
            *id = assigned;
        }
    }

    /// Authenticates a fresh transport and negotiates its protocol version.
    pub(crate) fn handshake(&self, transport: Transport) -> Result<Connection, ClientError> {
        let mut conn = Connection::new(transport, self.version);
        let current = *self.id.lock().unwrap_or_else(PoisonError::into_inner);

        let mut out = conn.output();
        out.write_utf(&self.version.to_string())?;
        out.write_utf(&self.credentials.connect_as)?;
        out.write_utf(&self.credentials.authenticate_as)?;
        out.write_utf(&self.credentials.password)?;
        out.write_long(current)?;
        out.flush()?;

        let mut input = conn.response_reader();
        expect_done(&mut input)?;
        let negotiated: ProtocolVersion = input.read_utf()?.parse()?;
        let assigned = input.read_long()?;

        if negotiated > self.version || negotiated < ProtocolVersion::OLDEST {
            return Err(ClientError::protocol(format!(
                "server negotiated unsupported protocol version {negotiated}"
            )));
        }
        conn.set_version(negotiated);
        self.assign(assigned);

        Ok(conn)
    }
}
