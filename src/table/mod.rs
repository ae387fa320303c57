//! Per-entity-type row caches.
//!
//! A [`Table`] holds the full row set of one entity type once it has been fetched, along with
//! lazily built unique and secondary indexes. Caches are dropped wholesale on invalidation and
//! refetched on the next read. Every read is safe to run concurrently with [`Table::clear_cache`]:
//! a fetch that overlaps a clear returns its rows to the caller but does not populate the cache.
mod expression;
mod listener;
mod load;
mod row;

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak},
    time::Duration,
};

use log::{debug, trace};

use crate::{
    ClientError,
    connector::{Connector, Executor, UpdateRequest},
    protocol::{
        CommandId, ProtocolVersion, Readable, StreamInput, StreamOutput, Streamable, TableId,
        check_result,
        status::{DONE, NEXT},
    },
};

pub use expression::{JoinPath, OrderBy, Resolver, sort_rows};
pub use listener::TableListener;
pub use load::{LoadParam, ProgressListener, TableLoadListener};
pub use row::{Row, Value};

use listener::Listeners;
use load::{LoadListeners, Progress};

/// Identity of a table as seen by listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    pub id: TableId,
    pub name: &'static str,
}

/// Shared state handed to each table while the connector is being built.
pub struct TableContext {
    pub(crate) connector: Weak<Connector>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) ids: HashMap<&'static str, TableId>,
}

/// Type-erased view of a [`Table`], used by the invalidation dispatcher and join resolution.
pub trait TableHandle: Send + Sync {
    fn info(&self) -> TableInfo;

    fn clear_cache(&self);

    /// Notifies listeners that the table changed on the server.
    fn table_updated(&self);

    fn is_loaded(&self) -> bool;

    /// Table referenced by `column`, if it is a declared foreign key.
    fn foreign_key(&self, column: &str) -> Option<TableId>;

    /// Row whose primary key equals `key`.
    fn get_row_dyn(&self, key: &Value) -> Result<Option<Arc<dyn Row>>, ClientError>;

    fn add_table_listener(
        &self,
        listener: Arc<dyn TableListener>,
        batch_delay: Duration,
    ) -> Result<(), ClientError>;

    fn remove_table_listener(&self, listener: &Arc<dyn TableListener>);
}

/// Column layout of one entity type.
pub struct TableDef<R> {
    name: &'static str,
    primary_key: &'static str,
    unique: Vec<&'static str>,
    indexed: Vec<&'static str>,
    references: Vec<(&'static str, &'static str)>,
    order: Option<Vec<OrderBy>>,
    _row: PhantomData<fn() -> R>,
}

impl<R> TableDef<R> {
    /// A table keyed by `primary_key`, kept in server order.
    pub fn new(name: &'static str, primary_key: &'static str) -> Self {
        Self {
            name,
            primary_key,
            unique: Vec::new(),
            indexed: Vec::new(),
            references: Vec::new(),
            order: None,
            _row: PhantomData,
        }
    }

    /// Declares an additional unique column.
    pub fn unique(mut self, column: &'static str) -> Self {
        self.unique.push(column);
        self
    }

    /// Declares a non-unique column served by [`Table::get_indexed_rows`].
    pub fn indexed(mut self, column: &'static str) -> Self {
        self.indexed.push(column);
        self
    }

    /// Declares `column` as a foreign key into the primary key of `table`.
    pub fn references(mut self, column: &'static str, table: &'static str) -> Self {
        self.references.push((column, table));
        self
    }

    pub fn order_by(mut self, order: Vec<OrderBy>) -> Self {
        self.order = Some(order);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn primary_key(&self) -> &'static str {
        self.primary_key
    }

    pub fn referenced_tables(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.references.iter().map(|(_, table)| *table)
    }

    fn unique_column(&self, column: &str) -> Option<&'static str> {
        std::iter::once(self.primary_key)
            .chain(self.unique.iter().copied())
            .find(|c| *c == column)
    }

    fn indexed_column(&self, column: &str) -> Option<&'static str> {
        self.indexed.iter().copied().find(|c| *c == column)
    }
}

type Rows<R> = Arc<Vec<Arc<R>>>;

struct Cache<R> {
    /// Bumped on every clear.
    generation: u64,
    rows: Option<Rows<R>>,
    unique: HashMap<&'static str, Arc<HashMap<Value, Arc<R>>>>,
    indexed: HashMap<&'static str, Arc<HashMap<Value, Vec<Arc<R>>>>>,
}

impl<R> Default for Cache<R> {
    fn default() -> Self {
        Self {
            generation: 0,
            rows: None,
            unique: HashMap::new(),
            indexed: HashMap::new(),
        }
    }
}

pub struct Table<R> {
    info: TableInfo,
    def: TableDef<R>,
    foreign_keys: HashMap<&'static str, TableId>,
    connector: Weak<Connector>,
    cache: RwLock<Cache<R>>,
    listeners: Arc<Listeners>,
    loads: LoadListeners<R>,
}

impl<R: Row + Readable> Table<R> {
    pub(crate) fn new(id: TableId, def: TableDef<R>, ctx: &TableContext) -> Self {
        let info = TableInfo { id, name: def.name };
        let foreign_keys = def
            .references
            .iter()
            .filter_map(|(column, table)| ctx.ids.get(table).map(|id| (*column, *id)))
            .collect();
        Self {
            info,
            def,
            foreign_keys,
            connector: ctx.connector.clone(),
            cache: RwLock::new(Cache::default()),
            listeners: Listeners::new(info, ctx.executor.clone()),
            loads: LoadListeners::default(),
        }
    }

    pub fn info(&self) -> TableInfo {
        self.info
    }

    pub fn id(&self) -> TableId {
        self.info.id
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    fn read(&self) -> RwLockReadGuard<'_, Cache<R>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Cache<R>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn connector(&self) -> Result<Arc<Connector>, ClientError> {
        self.connector.upgrade().ok_or(ClientError::Closed)
    }

    /// Row whose primary key equals `key`.
    pub fn get(&self, key: &Value) -> Result<Option<Arc<R>>, ClientError> {
        self.get_unique_row(self.def.primary_key, key)
    }

    /// Row whose unique `column` equals `value`; a null value finds nothing.
    pub fn get_unique_row(&self, column: &str, value: &Value) -> Result<Option<Arc<R>>, ClientError> {
        let column = self.def.unique_column(column).ok_or_else(|| {
            ClientError::Unsupported(format!("{}.{column} is not a unique column", self.info.name))
        })?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(self.unique_index(column)?.get(value).cloned())
    }

    /// Rows whose indexed `column` equals `value`, in cache order.
    pub fn get_indexed_rows(&self, column: &str, value: &Value) -> Result<Vec<Arc<R>>, ClientError> {
        let column = self.def.indexed_column(column).ok_or_else(|| {
            ClientError::Unsupported(format!("{}.{column} is not indexed", self.info.name))
        })?;
        Ok(self
            .secondary_index(column)?
            .get(value)
            .cloned()
            .unwrap_or_default())
    }

    /// Full row set, fetched with `GET_TABLE` and cached on first use.
    pub fn get_rows(&self) -> Result<Rows<R>, ClientError> {
        self.rows_at().map(|(rows, _)| rows)
    }

    /// Cached rows together with the generation they belong to.
    fn rows_at(&self) -> Result<(Rows<R>, u64), ClientError> {
        let generation = {
            let cache = self.read();
            if let Some(rows) = &cache.rows {
                return Ok((rows.clone(), cache.generation));
            }
            cache.generation
        };

        let rows = Arc::new(self.get_objects(true, CommandId::GET_TABLE, &[&self.info.id])?);

        let mut cache = self.write();
        if cache.generation == generation {
            if let Some(existing) = &cache.rows {
                return Ok((existing.clone(), generation));
            }
            debug!("cached {} rows of table {}", rows.len(), self.info.name);
            cache.rows = Some(rows.clone());
        } else {
            debug!("table {} cleared during fetch, not caching", self.info.name);
        }
        Ok((rows, generation))
    }

    fn unique_index(&self, column: &'static str) -> Result<Arc<HashMap<Value, Arc<R>>>, ClientError> {
        {
            let cache = self.read();
            if let (Some(_), Some(index)) = (&cache.rows, cache.unique.get(column)) {
                return Ok(index.clone());
            }
        }

        let (rows, generation) = self.rows_at()?;
        let mut index = HashMap::with_capacity(rows.len());
        for row in rows.iter() {
            let value = self.column_of(row, column)?;
            if value.is_null() {
                continue;
            }
            if index.contains_key(&value) {
                return Err(ClientError::DataIntegrity(format!(
                    "duplicate value {value} in unique column {}.{column}",
                    self.info.name
                )));
            }
            index.insert(value, row.clone());
        }

        let index = Arc::new(index);
        let mut cache = self.write();
        if cache.generation == generation {
            cache.unique.insert(column, index.clone());
        }
        Ok(index)
    }

    fn secondary_index(
        &self,
        column: &'static str,
    ) -> Result<Arc<HashMap<Value, Vec<Arc<R>>>>, ClientError> {
        {
            let cache = self.read();
            if let (Some(_), Some(index)) = (&cache.rows, cache.indexed.get(column)) {
                return Ok(index.clone());
            }
        }

        let (rows, generation) = self.rows_at()?;
        let mut index: HashMap<Value, Vec<Arc<R>>> = HashMap::new();
        for row in rows.iter() {
            index
                .entry(self.column_of(row, column)?)
                .or_default()
                .push(row.clone());
        }

        let index = Arc::new(index);
        let mut cache = self.write();
        if cache.generation == generation {
            cache.indexed.insert(column, index.clone());
        }
        Ok(index)
    }

    fn column_of(&self, row: &R, column: &str) -> Result<Value, ClientError> {
        row.column(column).ok_or_else(|| {
            ClientError::Unsupported(format!("{} rows have no column {column}", self.info.name))
        })
    }

    /// Drops all cached rows and indexes.
    pub fn clear_cache(&self) {
        let mut cache = self.write();
        cache.generation += 1;
        cache.rows = None;
        cache.unique.clear();
        cache.indexed.clear();
    }

    pub fn is_loaded(&self) -> bool {
        self.read().rows.is_some()
    }

    /// Number of cached rows, zero when not loaded.
    pub fn cached_row_count(&self) -> usize {
        self.read().rows.as_ref().map_or(0, |rows| rows.len())
    }

    /// Registers `listener`; a zero `batch_delay` delivers every update, a positive one
    /// coalesces updates within that window.
    pub fn add_table_listener(
        &self,
        listener: Arc<dyn TableListener>,
        batch_delay: Duration,
    ) -> Result<(), ClientError> {
        self.listeners.add(listener, batch_delay)
    }

    pub fn remove_table_listener(&self, listener: &Arc<dyn TableListener>) {
        self.listeners.remove(listener);
    }

    pub fn add_table_load_listener(&self, listener: Arc<dyn TableLoadListener<R>>, param: LoadParam) {
        self.loads.add_load(listener, param);
    }

    pub fn remove_table_load_listener(&self, listener: &Arc<dyn TableLoadListener<R>>) {
        self.loads.remove_load(listener);
    }

    pub fn add_progress_listener(&self, listener: Arc<dyn ProgressListener>) {
        self.loads.add_progress(listener);
    }

    pub fn remove_progress_listener(&self, listener: &Arc<dyn ProgressListener>) {
        self.loads.remove_progress(listener);
    }

    /// Streams the rows returned by `command`, driving load and progress listeners, and sorts
    /// them by the default ordering once the connection has been released.
    pub fn get_objects(
        &self,
        allow_retry: bool,
        command: CommandId,
        params: &[&dyn Streamable],
    ) -> Result<Vec<Arc<R>>, ClientError> {
        let connector = self.connector()?;
        let mut fetch = Fetch {
            table: self,
            params,
            want_progress: false,
            rows: Vec::new(),
        };
        connector.request_update_with(allow_retry, command, &mut fetch)?;
        let rows = fetch.rows;

        match &self.def.order {
            Some(order) if !order.is_empty() => {
                let resolver = FetchResolver::new(self, &rows, connector.as_ref());
                sort_rows(rows, order, self.info.id, &resolver)
            }
            _ => Ok(rows),
        }
    }
}

impl<R> Drop for Table<R> {
    fn drop(&mut self) {
        self.listeners.close();
    }
}

impl<R: Row + Readable> TableHandle for Table<R> {
    fn info(&self) -> TableInfo {
        self.info
    }

    fn clear_cache(&self) {
        Table::clear_cache(self);
    }

    fn table_updated(&self) {
        self.listeners.table_updated();
    }

    fn is_loaded(&self) -> bool {
        Table::is_loaded(self)
    }

    fn foreign_key(&self, column: &str) -> Option<TableId> {
        self.foreign_keys.get(column).copied()
    }

    fn get_row_dyn(&self, key: &Value) -> Result<Option<Arc<dyn Row>>, ClientError> {
        Ok(self.get(key)?.map(|row| row as Arc<dyn Row>))
    }

    fn add_table_listener(
        &self,
        listener: Arc<dyn TableListener>,
        batch_delay: Duration,
    ) -> Result<(), ClientError> {
        Table::add_table_listener(self, listener, batch_delay)
    }

    fn remove_table_listener(&self, listener: &Arc<dyn TableListener>) {
        Table::remove_table_listener(self, listener);
    }
}

/// Upper bound on the capacity reserved from a declared row count.
const MAX_PREALLOCATED_ROWS: usize = 4096;

/// One streamed fetch; rows are reset on every attempt.
struct Fetch<'a, R> {
    table: &'a Table<R>,
    params: &'a [&'a dyn Streamable],
    want_progress: bool,
    rows: Vec<Arc<R>>,
}

impl<R: Row + Readable> UpdateRequest for Fetch<'_, R> {
    fn write_request(&mut self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        self.want_progress = false;
        if out.since(ProtocolVersion::V1_1_0) {
            self.want_progress = self.table.loads.wants_progress();
            out.write_boolean(self.want_progress)?;
        }
        out.write_params(self.params)
    }

    fn read_response(&mut self, input: &mut StreamInput<'_>) -> Result<(), ClientError> {
        let table = self.table;
        let info = table.info;
        self.rows.clear();

        let mut progress: Progress = table.loads.progress();
        let mut declared = None;
        if self.want_progress {
            match input.read_status()? {
                NEXT => {}
                code => return Err(check_result(code, input)),
            }
            let count = input.read_compressed_int()?;
            let count = usize::try_from(count)
                .map_err(|_| ClientError::protocol(format!("negative row count {count}")))?;
            self.rows.reserve(count.min(MAX_PREALLOCATED_ROWS));
            progress.set_total(count);
            declared = Some(count);
        }

        table.loads.started(&info);
        loop {
            match input.read_status()? {
                NEXT => {
                    let row = Arc::new(R::read_from(input)?);
                    table.loads.row_loaded(&info, &row, self.rows.len());
                    self.rows.push(row);
                    progress.advance(self.rows.len());
                }
                DONE => break,
                code => return Err(check_result(code, input)),
            }
        }
        trace!("read {} rows of table {}", self.rows.len(), info.name);

        if let Some(count) = declared {
            if count != self.rows.len() {
                return Err(ClientError::protocol(format!(
                    "table {} declared {count} rows but sent {}",
                    info.name,
                    self.rows.len()
                )));
            }
        }
        table.loads.completed(&info);
        progress.finish();
        Ok(())
    }
}

/// Resolves joins back into the table being fetched against the fetched rows themselves.
struct FetchResolver<'a> {
    table: TableId,
    own: HashMap<Value, Arc<dyn Row>>,
    connector: &'a Connector,
}

impl<'a> FetchResolver<'a> {
    fn new<R: Row>(table: &Table<R>, rows: &[Arc<R>], connector: &'a Connector) -> Self {
        let own = rows
            .iter()
            .filter_map(|row| {
                let key = row.column(table.def.primary_key)?;
                Some((key, row.clone() as Arc<dyn Row>))
            })
            .collect();
        Self {
            table: table.info.id,
            own,
            connector,
        }
    }
}

impl Resolver for FetchResolver<'_> {
    fn foreign_key(&self, table: TableId, column: &str) -> Option<TableId> {
        self.connector.foreign_key(table, column)
    }

    fn resolve(&self, table: TableId, key: &Value) -> Result<Option<Arc<dyn Row>>, ClientError> {
        if table == self.table {
            return Ok(self.own.get(key).cloned());
        }
        self.connector.resolve(table, key)
    }
}

#[cfg(test)]
mod tests {
    use crate::connector::ThreadPool;

    use super::*;

    #[derive(Debug)]
    struct Zone {
        id: i64,
    }

    impl Row for Zone {
        fn column(&self, name: &str) -> Option<Value> {
            (name == "id").then(|| Value::Int(self.id))
        }
    }

    impl Readable for Zone {
        fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
            Ok(Self {
                id: input.read_long()?,
            })
        }
    }

    fn orphan_table() -> Table<Zone> {
        let ctx = TableContext {
            connector: Weak::new(),
            executor: Arc::new(ThreadPool::new("table-test", 1).unwrap()),
            ids: HashMap::from([("zones", TableId(0))]),
        };
        let def = TableDef::new("zones", "id")
            .indexed("kind")
            .references("parent", "zones");
        Table::new(TableId(0), def, &ctx)
    }

    #[test]
    fn null_key_finds_nothing_without_fetching() {
        let table = orphan_table();
        assert!(table.get(&Value::Null).unwrap().is_none());
        assert!(!table.is_loaded());
    }

    #[test]
    fn undeclared_columns_are_unsupported() {
        let table = orphan_table();
        let err = table.get_unique_row("name", &Value::Int(1)).unwrap_err();
        assert!(matches!(err, ClientError::Unsupported(_)));
        let err = table.get_indexed_rows("id", &Value::Int(1)).unwrap_err();
        assert!(matches!(err, ClientError::Unsupported(_)));
    }

    #[test]
    fn dropped_connector_is_reported() {
        let table = orphan_table();
        assert!(matches!(table.get_rows(), Err(ClientError::Closed)));
        assert_eq!(table.cached_row_count(), 0);
    }

    #[test]
    fn foreign_keys_resolve_by_table_name() {
        let table = orphan_table();
        assert_eq!(TableHandle::foreign_key(&table, "parent"), Some(TableId(0)));
        assert_eq!(TableHandle::foreign_key(&table, "id"), None);
        assert_eq!(table.def.referenced_tables().collect::<Vec<_>>(), vec!["zones"]);
    }

    #[test]
    fn clear_cache_is_idempotent() {
        let table = orphan_table();
        table.clear_cache();
        table.clear_cache();
        assert_eq!(table.read().generation, 2);
        assert!(!table.is_loaded());
    }
}
