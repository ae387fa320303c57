//! Session, pooling, retry and dispatch.
//!
//! The [`Connector`] is the client-side handle for one logical session with the master
//! server. It owns a [`ConnectionPool`], the [`Session`] identity used to authenticate fresh
//! transports, the ordered list of table caches, and the [`Executor`] used to notify
//! immediate table listeners.
//!
//! # Request Template
//!
//! Every remote operation runs through one retry loop:
//!
//! 1. acquire a connection, write the command and its parameters, flush, read the response;
//! 2. on any error the connection is aborted, otherwise it is returned to the pool;
//! 3. post-processing (invalidation dispatch, result extraction) runs strictly after the
//!    connection is released;
//! 4. retryable failures sleep per the [`RetryPolicy`] schedule and try again, while
//!    immediate-fail, data-integrity and cancellation errors surface on first occurrence.
//!
//! # Example
//! ```no_run
//! use hcrpc::{Connector, ConnectorConfig, Credentials, protocol::CommandId};
//!
//! let config = ConnectorConfig::new("master.example.com", 4582, Credentials::new("admin", "secret"));
//! let connector = Connector::builder(config).build().unwrap();
//!
//! let latency = connector.ping().unwrap();
//! let count: i32 = connector.request_int_query(true, CommandId(100), &[&"example.com"]).unwrap();
//! # let _ = (latency, count);
//! ```
pub mod cancel;
mod connection;
mod pool;
pub(crate) mod retry;
mod session;
mod thread;

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{
    ClientError, ConnectorConfig,
    protocol::{
        CommandId, Readable, StreamInput, StreamOutput, Streamable, TableId,
        status::{expect_done, read_invalidation_list},
    },
    table::{Resolver, Row, Table, TableContext, TableDef, TableHandle, Value},
};

pub use cancel::{CancelGuard, CancelToken};
pub use connection::{Connection, Dialer, PooledConnection, TcpDialer, Transport};
pub use pool::{ConnectionPool, IdlePool, PoolStats};
pub use retry::{DEFAULT_RETRY_DELAYS, RetryPolicy, is_immediate_fail_message};
pub use session::{Credentials, Session, UNASSIGNED_ID};
pub use thread::{Executor, Job, ThreadPool};

/// General request returning an arbitrary deserialized value.
pub trait ResultRequest {
    type Output;

    /// Writes the command parameters; the command id is already on the stream.
    fn write_request(&mut self, out: &mut StreamOutput<'_>) -> Result<(), ClientError>;

    /// Reads the response while the connection is held.
    fn read_response(&mut self, input: &mut StreamInput<'_>) -> Result<(), ClientError>;

    /// Runs after the connection is released; may touch caches or issue further calls.
    fn after_release(&mut self, connector: &Connector) -> Result<Self::Output, ClientError>;
}

/// Fire-and-confirm request with caller-supplied payload handling.
pub trait UpdateRequest {
    fn write_request(&mut self, out: &mut StreamOutput<'_>) -> Result<(), ClientError>;

    fn read_response(&mut self, input: &mut StreamInput<'_>) -> Result<(), ClientError>;

    fn after_release(&mut self, _connector: &Connector) -> Result<(), ClientError> {
        Ok(())
    }
}

struct Update<'r, U: UpdateRequest>(&'r mut U);

impl<U: UpdateRequest> ResultRequest for Update<'_, U> {
    type Output = ();

    fn write_request(&mut self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        self.0.write_request(out)
    }

    fn read_response(&mut self, input: &mut StreamInput<'_>) -> Result<(), ClientError> {
        self.0.read_response(input)
    }

    fn after_release(&mut self, connector: &Connector) -> Result<(), ClientError> {
        self.0.after_release(connector)
    }
}

/// `DONE` followed by one typed value and, optionally, an invalidation list.
struct Query<'p, T> {
    params: &'p [&'p dyn Streamable],
    with_invalidation: bool,
    value: Option<T>,
    invalidations: Vec<TableId>,
}

impl<'p, T> Query<'p, T> {
    fn new(params: &'p [&'p dyn Streamable], with_invalidation: bool) -> Self {
        Self {
            params,
            with_invalidation,
            value: None,
            invalidations: Vec::new(),
        }
    }
}

impl<T: Readable> ResultRequest for Query<'_, T> {
    type Output = T;

    fn write_request(&mut self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        out.write_params(self.params)
    }

    fn read_response(&mut self, input: &mut StreamInput<'_>) -> Result<(), ClientError> {
        expect_done(input)?;
        self.value = Some(T::read_from(input)?);
        if self.with_invalidation {
            self.invalidations = read_invalidation_list(input)?;
        }
        Ok(())
    }

    fn after_release(&mut self, connector: &Connector) -> Result<T, ClientError> {
        connector.dispatch_invalidation(&std::mem::take(&mut self.invalidations));
        self.value
            .take()
            .ok_or_else(|| ClientError::protocol("response carried no result"))
    }
}

struct RegisteredTable {
    handle: Arc<dyn TableHandle>,
    typed: Arc<dyn Any + Send + Sync>,
}

type TableFactory = Box<dyn FnOnce(&TableContext) -> RegisteredTable>;

pub struct ConnectorBuilder {
    config: ConnectorConfig,
    pool: Option<Box<dyn ConnectionPool>>,
    executor: Option<Arc<dyn Executor>>,
    names: Vec<&'static str>,
    references: Vec<(&'static str, &'static str)>,
    factories: Vec<TableFactory>,
}

impl ConnectorBuilder {
    /// Registers a table; identifiers are assigned densely in registration order and must
    /// match the server's numbering.
    pub fn table<R: Row + Readable>(&mut self, def: TableDef<R>) -> TableId {
        let id = TableId(self.factories.len() as u32);
        self.names.push(def.name());
        for target in def.referenced_tables() {
            self.references.push((def.name(), target));
        }
        self.factories.push(Box::new(move |ctx: &TableContext| {
            let table = Arc::new(Table::new(id, def, ctx));
            RegisteredTable {
                handle: table.clone(),
                typed: table,
            }
        }));
        id
    }

    pub fn pool(mut self, pool: impl ConnectionPool + 'static) -> Self {
        self.pool = Some(Box::new(pool));
        self
    }

    /// Uses the default idle pool over a custom dialer.
    pub fn dialer(self, dialer: impl Dialer + 'static) -> Self {
        let pool = IdlePool::new(
            dialer,
            self.config.pool_size,
            self.config.max_connection_age,
        );
        self.pool(pool)
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<Arc<Connector>, ClientError> {
        let mut ids = HashMap::with_capacity(self.names.len());
        for (index, name) in self.names.iter().enumerate() {
            if ids.insert(*name, TableId(index as u32)).is_some() {
                return Err(ClientError::Config(format!("duplicate table name '{name}'")));
            }
        }
        for (table, target) in &self.references {
            if !ids.contains_key(target) {
                return Err(ClientError::Config(format!(
                    "table '{table}' references unknown table '{target}'"
                )));
            }
        }

        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => {
                if self.config.listener_threads == 0 {
                    return Err(ClientError::Config(
                        "listener thread count must be positive".into(),
                    ));
                }
                let pool = ThreadPool::new("hcrpc-listener", self.config.listener_threads)
                    .map_err(|e| {
                        ClientError::Config(format!("failed to start listener threads: {e}"))
                    })?;
                Arc::new(pool)
            }
        };
        let pool = match self.pool {
            Some(pool) => pool,
            None => Box::new(IdlePool::new(
                TcpDialer::new(
                    &self.config.hostname,
                    self.config.port,
                    self.config.connect_timeout,
                    self.config.read_timeout,
                ),
                self.config.pool_size,
                self.config.max_connection_age,
            )),
        };
        let session = Session::new(
            self.config.credentials.clone(),
            self.config.protocol_version,
        );
        let retry = self.config.retry.clone();
        let factories = self.factories;
        let config = self.config;

        Ok(Arc::new_cyclic(|weak: &Weak<Connector>| {
            let ctx = TableContext {
                connector: weak.clone(),
                executor: executor.clone(),
                ids,
            };
            let tables = factories.into_iter().map(|factory| factory(&ctx)).collect();
            Connector {
                config,
                session,
                pool,
                retry,
                executor,
                tables,
            }
        }))
    }
}

/// Client-side handle for one authenticated logical connection to the master server.
pub struct Connector {
    config: ConnectorConfig,
    session: Session,
    pool: Box<dyn ConnectionPool>,
    retry: RetryPolicy,
    executor: Arc<dyn Executor>,
    tables: Vec<RegisteredTable>,
}

impl Connector {
    pub fn builder(config: ConnectorConfig) -> ConnectorBuilder {
        ConnectorBuilder {
            config,
            pool: None,
            executor: None,
            names: Vec::new(),
            references: Vec::new(),
            factories: Vec::new(),
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Server-assigned id of this connector, if a handshake has completed.
    pub fn connector_id(&self) -> Option<i64> {
        self.session.connector_id()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Typed table registered under `id`.
    pub fn table<R: Row + Readable>(&self, id: TableId) -> Option<Arc<Table<R>>> {
        self.tables
            .get(id.index())?
            .typed
            .clone()
            .downcast::<Table<R>>()
            .ok()
    }

    pub fn table_handle(&self, id: TableId) -> Option<&Arc<dyn TableHandle>> {
        self.tables.get(id.index()).map(|t| &t.handle)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<dyn TableHandle>> {
        self.tables.iter().map(|t| &t.handle)
    }

    /// Drops every cached row without notifying listeners.
    pub fn clear_caches(&self) {
        for table in self.tables() {
            table.clear_cache();
        }
    }

    /// Clears then notifies every listed table.
    ///
    /// All caches are cleared before any listener of any listed table is notified.
    pub fn dispatch_invalidation(&self, list: &[TableId]) {
        if list.is_empty() {
            return;
        }
        debug!("invalidating tables {list:?}");

        let tables = list
            .iter()
            .filter_map(|id| match self.table_handle(*id) {
                Some(handle) => Some(handle),
                None => {
                    warn!("ignoring unknown table id {id} in invalidation list");
                    None
                }
            })
            .collect::<Vec<_>>();

        for table in &tables {
            table.clear_cache();
        }
        for table in &tables {
            table.table_updated();
        }
    }

    /// Round-trip time of one `PING`.
    pub fn ping(&self) -> Result<Duration, ClientError> {
        let start = Instant::now();
        self.request_update(true, CommandId::PING, &[])?;
        Ok(start.elapsed())
    }

    /// Single, non-retried exchange verifying credentials and connectivity.
    pub fn test_connect(&self) -> Result<(), ClientError> {
        self.request_update(false, CommandId::TEST_CONNECTION, &[])
    }

    /// Asks the server to invalidate `table` and applies the returned invalidation list.
    pub fn invalidate(&self, table: TableId) -> Result<(), ClientError> {
        self.request_update_il(true, CommandId::INVALIDATE_TABLE, &[&table])
    }

    pub fn request_update(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<(), ClientError> {
        self.request_query::<()>(allow_retry, command, params)
    }

    pub fn request_update_il(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<(), ClientError> {
        self.request_query_il::<()>(allow_retry, command, params)
    }

    pub fn request_update_with<U: UpdateRequest>(
        &self,
        allow_retry: bool,
        command: CommandId,
        request: &mut U,
    ) -> Result<(), ClientError> {
        self.request_result(allow_retry, command, Update(request))
    }

    pub fn request_query<T: Readable>(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<T, ClientError> {
        self.request_result(allow_retry, command, Query::new(params, false))
    }

    /// Like [`Connector::request_query`], with an invalidation list after the value.
    pub fn request_query_il<T: Readable>(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<T, ClientError> {
        self.request_result(allow_retry, command, Query::new(params, true))
    }

    pub fn request_boolean_query(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<bool, ClientError> {
        self.request_query(allow_retry, command, params)
    }

    pub fn request_boolean_query_il(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<bool, ClientError> {
        self.request_query_il(allow_retry, command, params)
    }

    pub fn request_int_query(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<i32, ClientError> {
        self.request_query(allow_retry, command, params)
    }

    pub fn request_int_query_il(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<i32, ClientError> {
        self.request_query_il(allow_retry, command, params)
    }

    pub fn request_long_query(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<i64, ClientError> {
        self.request_query(allow_retry, command, params)
    }

    pub fn request_long_query_il(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<i64, ClientError> {
        self.request_query_il(allow_retry, command, params)
    }

    pub fn request_short_query(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<i16, ClientError> {
        self.request_query(allow_retry, command, params)
    }

    pub fn request_short_query_il(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<i16, ClientError> {
        self.request_query_il(allow_retry, command, params)
    }

    pub fn request_string_query(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<String, ClientError> {
        self.request_query(allow_retry, command, params)
    }

    pub fn request_string_query_il(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<String, ClientError> {
        self.request_query_il(allow_retry, command, params)
    }

    /// General form of every request; see the module documentation for the retry rules.
    pub fn request_result<Q: ResultRequest>(
        &self,
        allow_retry: bool,
        command: CommandId,
        mut request: Q,
    ) -> Result<Q::Output, ClientError> {
        let max_attempts = self.retry.max_attempts(allow_retry);
        let mut attempt = 1;

        loop {
            let mut last_status = None;
            let result = self
                .exchange(command, &mut request, &mut last_status)
                .and_then(|()| request.after_release(self));

            let err = match result {
                Ok(output) => return Ok(output),
                Err(err) => err,
            };
            let fail = move |source: ClientError| ClientError::Request {
                command,
                attempts: attempt,
                last_status,
                source: Box::new(source),
            };

            if cancel::cancelled() {
                return Err(fail(ClientError::Cancelled));
            }
            if attempt >= max_attempts || !err.is_retryable() {
                return Err(fail(err));
            }

            warn!("{command} attempt {attempt}/{max_attempts} failed, retrying: {err}");
            if let Err(cancelled) = cancel::sleep(self.retry.delay(attempt)) {
                return Err(fail(cancelled));
            }
            attempt += 1;
        }
    }

    /// One request/response exchange on a pooled connection.
    fn exchange<Q: ResultRequest>(
        &self,
        command: CommandId,
        request: &mut Q,
        last_status: &mut Option<u8>,
    ) -> Result<(), ClientError> {
        let conn = self.pool.acquire(&self.session)?;
        let mut conn = PooledConnection::new(conn, self.pool.as_ref());

        match write_and_read(&mut conn, command, request, last_status) {
            Ok(()) => {
                conn.close();
                Ok(())
            }
            Err(e) => {
                debug!("{command} failed mid-exchange: {e}");
                conn.abort();
                Err(e)
            }
        }
    }
}

fn write_and_read<Q: ResultRequest>(
    conn: &mut Connection,
    command: CommandId,
    request: &mut Q,
    last_status: &mut Option<u8>,
) -> Result<(), ClientError> {
    let mut out = conn.request_writer(command)?;
    request.write_request(&mut out)?;
    out.flush()?;

    let mut input = conn.response_reader();
    let res = request.read_response(&mut input);
    *last_status = input.last_status();
    res
}

impl Resolver for Connector {
    fn foreign_key(&self, table: TableId, column: &str) -> Option<TableId> {
        self.table_handle(table)?.foreign_key(column)
    }

    fn resolve(&self, table: TableId, key: &Value) -> Result<Option<Arc<dyn Row>>, ClientError> {
        match self.table_handle(table) {
            Some(handle) => handle.get_row_dyn(key),
            None => Err(ClientError::Unsupported(format!("unknown table id {table}"))),
        }
    }
}
