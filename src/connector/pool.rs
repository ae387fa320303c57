use std::{
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, info};

use crate::ClientError;

use super::{Session, connection::{Connection, Dialer}};

/// Acquisition strategy for connections.
///
/// Implementations serialize access to their shared state; a connection handed out by
/// [`ConnectionPool::acquire`] is owned by exactly one caller until it is released or
/// aborted.
pub trait ConnectionPool: Send + Sync {
    fn acquire(&self, session: &Session) -> Result<Connection, ClientError>;

    /// Normal return path after a clean exchange.
    fn release(&self, conn: Connection);

    /// Destroys a connection that saw an error.
    fn abort(&self, conn: Connection);

    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh transports established.
    pub connects: u64,
    /// Connections destroyed after an error.
    pub aborts: u64,
    /// Connections currently parked in the pool.
    pub idle: usize,
}

/// Default pool: keeps up to `max_idle` released connections and dials on demand.
pub struct IdlePool {
    dialer: Box<dyn Dialer>,
    idle: Mutex<Vec<Connection>>,
    max_idle: usize,
    max_age: Duration,
    connects: AtomicU64,
    aborts: AtomicU64,
}

impl IdlePool {
    pub fn new(dialer: impl Dialer + 'static, max_idle: usize, max_age: Duration) -> Self {
        Self {
            dialer: Box::new(dialer),
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            max_age,
            connects: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        }
    }
}

impl ConnectionPool for IdlePool {
    fn acquire(&self, session: &Session) -> Result<Connection, ClientError> {
        {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            while let Some(conn) = idle.pop() {
                if conn.age() <= self.max_age {
                    debug!("reusing pooled connection ({} idle)", idle.len());
                    return Ok(conn);
                }
                debug!("discarding connection older than {:?}", self.max_age);
            }
        }

        let transport = self.dialer.dial()?;
        let conn = session.handshake(transport)?;
        let connects = self.connects.fetch_add(1, Ordering::Relaxed) + 1;
        info!("opened connection #{connects} (protocol {})", conn.version());
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        if conn.age() > self.max_age {
            debug!("connection exceeded max age; closing instead of pooling");
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(conn);
        } else {
            debug!("pool full; closing connection");
        }
    }

    fn abort(&self, conn: Connection) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
        debug!("aborting connection");
        drop(conn);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            connects: self.connects.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            idle: self.idle.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }
}
