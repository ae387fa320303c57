use std::{
    io::{self, BufReader, BufWriter, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use log::{debug, trace};

use crate::{
    ClientError,
    protocol::{CommandId, ProtocolVersion, StreamInput, StreamOutput},
};

use super::pool::ConnectionPool;

/// Duplex byte stream split into its read and write halves.
pub struct Transport {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl Transport {
    pub fn new(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Establishes fresh transports for a connection pool.
pub trait Dialer: Send + Sync {
    fn dial(&self) -> io::Result<Transport>;
}

/// Plain TCP dialer. Socket security setup lives outside this crate.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new(
        hostname: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            address: format!("{hostname}:{port}"),
            connect_timeout,
            read_timeout,
        }
    }
}

impl Dialer for TcpDialer {
    fn dial(&self) -> io::Result<Transport> {
        let mut last_err = None;
        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(self.read_timeout)?;
                    debug!("connected to {addr}");
                    let reader = stream.try_clone()?;
                    return Ok(Transport::new(reader, stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {}", self.address),
            )
        }))
    }
}

/// One authenticated transport, used for one request/response exchange at a time.
pub struct Connection {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: BufWriter<Box<dyn Write + Send>>,
    version: ProtocolVersion,
    opened: Instant,
}

impl Connection {
    pub(crate) fn new(transport: Transport, version: ProtocolVersion) -> Self {
        Self {
            reader: BufReader::new(transport.reader),
            writer: BufWriter::new(transport.writer),
            version,
            opened: Instant::now(),
        }
    }

    /// Version negotiated for this connection.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Writer already primed with the encoded command identifier.
    pub fn request_writer(&mut self, command: CommandId) -> Result<StreamOutput<'_>, ClientError> {
        trace!("writing command {command}");
        let mut out = StreamOutput::new(&mut self.writer, self.version);
        out.write_compressed_int(command.0)?;
        Ok(out)
    }

    /// Reader positioned at the start of the response.
    pub fn response_reader(&mut self) -> StreamInput<'_> {
        StreamInput::new(&mut self.reader, self.version)
    }

    pub(crate) fn output(&mut self) -> StreamOutput<'_> {
        StreamOutput::new(&mut self.writer, self.version)
    }
}

/// A connection checked out of its pool.
///
/// Dropping the guard without calling [`PooledConnection::close`] aborts the connection, so
/// a connection that saw an error or a panic is never returned to the pool.
pub struct PooledConnection<'p> {
    conn: Option<Connection>,
    pool: &'p dyn ConnectionPool,
}

impl<'p> PooledConnection<'p> {
    pub(crate) fn new(conn: Connection, pool: &'p dyn ConnectionPool) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// Returns the connection to its pool.
    pub fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }

    /// Destroys the transport; the next acquisition establishes a fresh one.
    pub fn abort(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.abort(conn);
        }
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until close or abort")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until close or abort")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.abort(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Cursor,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn request_writer_is_primed_with_command() {
        let sink = Shared::default();
        let transport = Transport::new(Cursor::new(vec![0u8]), sink.clone());
        let mut conn = Connection::new(transport, ProtocolVersion::CURRENT);

        let mut out = conn.request_writer(CommandId(300)).unwrap();
        out.write_boolean(true).unwrap();
        out.flush().unwrap();

        let written = sink.0.lock().unwrap().clone();
        let mut cursor = Cursor::new(written);
        let mut input = StreamInput::new(&mut cursor, ProtocolVersion::CURRENT);
        assert_eq!(input.read_compressed_int().unwrap(), 300);
        assert!(input.read_boolean().unwrap());

        assert_eq!(conn.response_reader().read_status().unwrap(), 0);
    }
}
