use std::{
    collections::HashMap,
    io::{BufReader, BufWriter},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, warn};

use crate::{
    ClientError,
    connector::{Credentials, UNASSIGNED_ID},
    protocol::{
        CommandId, ProtocolVersion, Readable, RemoteError, RemoteErrorKind, StreamInput,
        StreamOutput, Streamable, TableId,
        status::{DONE, NEXT, write_invalidation_list, write_remote_error},
    },
};

/// Reads one command's parameters and writes its complete response.
pub type Handler = Arc<dyn Fn(&mut Exchange<'_, '_>) -> Result<(), ClientError> + Send + Sync>;

/// Request/response streams of one command on a simulated connection.
pub struct Exchange<'i, 'o> {
    pub input: StreamInput<'i>,
    pub output: StreamOutput<'o>,
}

impl Exchange<'_, '_> {
    /// Reads the "want progress" flag of a streamed fetch; older peers never send it.
    pub fn read_progress_flag(&mut self) -> Result<bool, ClientError> {
        if self.input.since(ProtocolVersion::V1_1_0) {
            self.input.read_boolean()
        } else {
            Ok(false)
        }
    }

    pub fn done(&mut self) -> Result<(), ClientError> {
        self.output.write_byte(DONE)
    }

    pub fn error(&mut self, error: &RemoteError) -> Result<(), ClientError> {
        write_remote_error(&mut self.output, error)
    }

    /// Streams `rows` as `NEXT` frames, preceded by `declared` when progress was requested.
    pub fn rows(
        &mut self,
        want_progress: bool,
        declared: usize,
        rows: &[&dyn Streamable],
    ) -> Result<(), ClientError> {
        if want_progress {
            let declared = i32::try_from(declared)
                .map_err(|_| ClientError::protocol(format!("row count {declared} out of range")))?;
            self.output.write_byte(NEXT)?;
            self.output.write_compressed_int(declared)?;
        }
        for row in rows {
            self.output.write_byte(NEXT)?;
            row.write_to(&mut self.output)?;
        }
        self.done()
    }
}

type Rows = Vec<Arc<dyn Streamable + Send + Sync>>;

struct Shared {
    version: ProtocolVersion,
    accounts: HashMap<String, String>,
    handlers: RwLock<HashMap<i32, Handler>>,
    tables: RwLock<HashMap<TableId, Rows>>,
    next_id: AtomicI64,
    handshakes: AtomicUsize,
    requests: AtomicUsize,
    stopping: AtomicBool,
    next_client: AtomicU64,
    clients: Mutex<HashMap<u64, TcpStream>>,
}

pub struct SimServerBuilder {
    version: ProtocolVersion,
    accounts: HashMap<String, String>,
}

impl SimServerBuilder {
    /// Accepts `username` with `password`.
    pub fn account(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.accounts.insert(username.into(), password.into());
        self
    }

    /// Highest protocol version the server negotiates.
    pub fn version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn bind(self, address: impl ToSocketAddrs) -> Result<SimServer, ClientError> {
        let listener = TcpListener::bind(address)?;
        let address = listener.local_addr()?;
        let shared = Arc::new(Shared {
            version: self.version,
            accounts: self.accounts,
            handlers: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            handshakes: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            next_client: AtomicU64::new(0),
            clients: Mutex::new(HashMap::new()),
        });

        let accepting = Arc::clone(&shared);
        let acceptor = thread::Builder::new()
            .name("hcrpc-sim-accept".into())
            .spawn(move || accept_loop(listener, accepting))?;
        info!("simulated master listening at {address}");

        Ok(SimServer {
            address,
            shared,
            acceptor: Some(acceptor),
        })
    }
}

/// In-process master server speaking the wire protocol over TCP.
///
/// `PING` and `TEST_CONNECTION` answer `DONE`, `GET_TABLE` streams the rows registered with
/// [`SimServer::set_rows`], and `INVALIDATE_TABLE` answers with an invalidation list naming the
/// requested table. Any command can be overridden with [`SimServer::handle`].
pub struct SimServer {
    address: SocketAddr,
    shared: Arc<Shared>,
    acceptor: Option<JoinHandle<()>>,
}

impl SimServer {
    pub fn builder() -> SimServerBuilder {
        SimServerBuilder {
            version: ProtocolVersion::CURRENT,
            accounts: HashMap::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Installs `handler` for `command`, replacing any built-in behavior.
    pub fn handle(
        &self,
        command: CommandId,
        handler: impl Fn(&mut Exchange<'_, '_>) -> Result<(), ClientError> + Send + Sync + 'static,
    ) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.0, Arc::new(handler));
    }

    /// Rows served by `GET_TABLE` for `table`.
    pub fn set_rows(&self, table: TableId, rows: Rows) {
        self.shared
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table, rows);
    }

    /// Completed and attempted handshakes.
    pub fn handshakes(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    /// Commands received after a successful handshake.
    pub fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Stops accepting and closes every open connection.
    pub fn shutdown(&mut self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept.
        let _ = TcpStream::connect(self.address);
        for client in self
            .shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, client)| client)
        {
            let _ = client.shutdown(Shutdown::Both);
        }
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                warn!("simulated master acceptor panicked");
            }
        }
        info!("simulated master at {} stopped", self.address);
    }
}

impl Drop for SimServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.stopping.load(Ordering::SeqCst) {
            return;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("broken connection: {e:?}");
                continue;
            }
        };
        let client = shared.next_client.fetch_add(1, Ordering::SeqCst);
        if let Ok(clone) = stream.try_clone() {
            shared
                .clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(client, clone);
        }

        let handle = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("hcrpc-sim-conn".into())
            .spawn(move || {
                if let Err(e) = handle_connection(stream, &handle) {
                    debug!("simulated connection closed: {e}");
                }
                handle
                    .clients
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&client);
            });
        if let Err(e) = spawned {
            warn!("failed to spawn connection thread: {e}");
        }
    }
}

fn handle_connection(stream: TcpStream, shared: &Shared) -> Result<(), ClientError> {
    let result = serve(&stream, shared);
    let _ = stream.shutdown(Shutdown::Both);
    result
}

fn serve(stream: &TcpStream, shared: &Shared) -> Result<(), ClientError> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream.try_clone()?);

    let version = handshake(&mut reader, &mut writer, shared)?;
    let Some(version) = version else {
        return Ok(());
    };

    loop {
        let mut input = StreamInput::new(&mut reader, version);
        let command = match input.read_compressed_int() {
            Ok(command) => CommandId(command),
            Err(ClientError::Protocol(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        shared.requests.fetch_add(1, Ordering::SeqCst);
        debug!("simulated master received {command}");

        let handler = shared
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&command.0)
            .cloned();

        let mut exchange = Exchange {
            input,
            output: StreamOutput::new(&mut writer, version),
        };
        match handler {
            Some(handler) => handler(&mut exchange)?,
            None => builtin(command, &mut exchange, shared)?,
        }
        exchange.output.flush()?;
    }
}

/// Returns the negotiated version, or `None` when the client was rejected.
fn handshake(
    reader: &mut BufReader<TcpStream>,
    writer: &mut BufWriter<TcpStream>,
    shared: &Shared,
) -> Result<Option<ProtocolVersion>, ClientError> {
    shared.handshakes.fetch_add(1, Ordering::SeqCst);
    let mut input = StreamInput::new(reader, ProtocolVersion::OLDEST);
    let offered = input.read_utf()?;
    let credentials = Credentials {
        connect_as: input.read_utf()?,
        authenticate_as: input.read_utf()?,
        password: input.read_utf()?,
    };
    let id = input.read_long()?;

    let mut output = StreamOutput::new(writer, ProtocolVersion::OLDEST);
    let negotiated = match offered.parse::<ProtocolVersion>() {
        Ok(offered) if offered >= ProtocolVersion::OLDEST => {
            authenticate(&credentials, shared).map(|()| offered.min(shared.version))
        }
        _ => Err(RemoteError::new(
            RemoteErrorKind::Unsupported,
            format!("unsupported protocol version {offered}"),
        )),
    };
    let negotiated = match negotiated {
        Ok(negotiated) => negotiated,
        Err(rejection) => {
            warn!("rejecting {}: {}", credentials.connect_as, rejection.message);
            write_remote_error(&mut output, &rejection)?;
            output.flush()?;
            return Ok(None);
        }
    };
    let id = if id == UNASSIGNED_ID {
        shared.next_id.fetch_add(1, Ordering::SeqCst)
    } else {
        id
    };
    output.write_byte(DONE)?;
    output.write_utf(&negotiated.to_string())?;
    output.write_long(id)?;
    output.flush()?;
    debug!("accepted {} as connector {id} at {negotiated}", credentials.connect_as);
    Ok(Some(negotiated))
}

fn authenticate(credentials: &Credentials, shared: &Shared) -> Result<(), RemoteError> {
    if credentials.connect_as.is_empty() {
        return Err(RemoteError::new(
            RemoteErrorKind::Authentication,
            "Connection attempted with empty connect username",
        ));
    }
    if credentials.password.is_empty() {
        return Err(RemoteError::new(
            RemoteErrorKind::Authentication,
            "Connection attempted with empty password",
        ));
    }
    match shared.accounts.get(&credentials.authenticate_as) {
        Some(password) if *password == credentials.password => {}
        _ => {
            return Err(RemoteError::new(
                RemoteErrorKind::Authentication,
                "Connection attempted with invalid password",
            ));
        }
    }
    if credentials.connect_as != credentials.authenticate_as {
        return Err(RemoteError::new(
            RemoteErrorKind::Authorization,
            format!(
                "Not allowed to switch users from {} to {}",
                credentials.authenticate_as, credentials.connect_as
            ),
        ));
    }
    Ok(())
}

fn builtin(
    command: CommandId,
    exchange: &mut Exchange<'_, '_>,
    shared: &Shared,
) -> Result<(), ClientError> {
    match command {
        CommandId::PING | CommandId::TEST_CONNECTION => exchange.done(),
        CommandId::INVALIDATE_TABLE => {
            let table = TableId::read_from(&mut exchange.input)?;
            exchange.done()?;
            write_invalidation_list(&mut exchange.output, &[table])
        }
        CommandId::GET_TABLE => {
            let want_progress = exchange.read_progress_flag()?;
            let table = TableId::read_from(&mut exchange.input)?;
            let rows = shared
                .tables
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&table)
                .cloned()
                .unwrap_or_default();
            let rows = rows
                .iter()
                .map(|row| row.as_ref() as &dyn Streamable)
                .collect::<Vec<_>>();
            exchange.rows(want_progress, rows.len(), &rows)
        }
        other => exchange.error(&RemoteError::new(
            RemoteErrorKind::Unsupported,
            format!("unknown command {other}"),
        )),
    }
}

/// Writes a complete `DONE` frame, followed by `value` and an optional invalidation list.
pub fn write_result(
    output: &mut StreamOutput<'_>,
    value: &dyn Streamable,
    invalidations: Option<&[TableId]>,
) -> Result<(), ClientError> {
    output.write_byte(DONE)?;
    value.write_to(output)?;
    if let Some(list) = invalidations {
        write_invalidation_list(output, list)?;
    }
    output.flush()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn rejects_unknown_accounts_before_commands() {
        let mut server = SimServer::builder().account("admin", "secret").bind("127.0.0.1:0").unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        {
            let mut out = StreamOutput::new(&mut stream, ProtocolVersion::OLDEST);
            out.write_utf("1.1.0").unwrap();
            out.write_utf("admin").unwrap();
            out.write_utf("admin").unwrap();
            out.write_utf("wrong").unwrap();
            out.write_long(UNASSIGNED_ID).unwrap();
            out.flush().unwrap();
        }
        let mut reader = stream.try_clone().unwrap();
        let mut input = StreamInput::new(&mut reader, ProtocolVersion::OLDEST);
        let status = input.read_status().unwrap();
        let err = crate::protocol::check_result(status, &mut input);
        assert!(matches!(err, ClientError::ImmediateFail(_)));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(server.requests(), 0);
        server.shutdown();
    }
}
