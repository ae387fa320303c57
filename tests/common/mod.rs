#![allow(dead_code)]

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use hcrpc::{
    ClientError, Connector, ConnectorBuilder, ConnectorConfig, Credentials, RetryPolicy, Row,
    Value,
    connector::{Dialer, Transport},
    protocol::{Readable, StreamInput, StreamOutput, Streamable},
    sim::SimServer,
};

pub const USER: &str = "admin";
pub const PASSWORD: &str = "secret";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn server() -> SimServer {
    init_logging();
    SimServer::builder()
        .account(USER, PASSWORD)
        .bind("127.0.0.1:0")
        .unwrap()
}

pub fn config(server: &SimServer, password: &str) -> ConnectorConfig {
    let addr = server.local_addr();
    let mut config =
        ConnectorConfig::new(addr.ip().to_string(), addr.port(), Credentials::new(USER, password));
    config.retry = RetryPolicy::from_millis(&[1, 1]);
    config.read_timeout = Some(Duration::from_secs(5));
    config
}

pub fn connector(server: &SimServer) -> Arc<Connector> {
    Connector::builder(config(server, PASSWORD)).build().unwrap()
}

pub fn builder(server: &SimServer) -> ConnectorBuilder {
    Connector::builder(config(server, PASSWORD))
}

/// Dialer that always fails and counts its attempts.
#[derive(Clone, Default)]
pub struct RefusingDialer {
    pub dials: Arc<AtomicUsize>,
}

impl Dialer for RefusingDialer {
    fn dial(&self) -> io::Result<Transport> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }
}

pub fn wait_until(f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub id: i64,
    pub name: String,
    pub parent: Option<i64>,
}

impl Zone {
    pub fn new(id: i64, name: &str, parent: Option<i64>) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent,
        }
    }
}

impl Row for Zone {
    fn column(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::Int(self.id)),
            "name" => Some(Value::from(self.name.as_str())),
            "parent" => Some(Value::from(self.parent)),
            _ => None,
        }
    }
}

impl Readable for Zone {
    fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
        Ok(Self {
            id: input.read_long()?,
            name: input.read_utf()?,
            parent: input.read_nullable::<i64>()?,
        })
    }
}

impl Streamable for Zone {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        out.write_long(self.id)?;
        out.write_utf(&self.name)?;
        out.write_nullable(self.parent.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Site {
    pub id: i64,
    pub zone: i64,
    pub name: String,
}

impl Site {
    pub fn new(id: i64, zone: i64, name: &str) -> Self {
        Self {
            id,
            zone,
            name: name.to_string(),
        }
    }
}

impl Row for Site {
    fn column(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::Int(self.id)),
            "zone" => Some(Value::Int(self.zone)),
            "name" => Some(Value::from(self.name.as_str())),
            _ => None,
        }
    }
}

impl Readable for Site {
    fn read_from(input: &mut StreamInput<'_>) -> Result<Self, ClientError> {
        Ok(Self {
            id: input.read_long()?,
            zone: input.read_long()?,
            name: input.read_utf()?,
        })
    }
}

impl Streamable for Site {
    fn write_to(&self, out: &mut StreamOutput<'_>) -> Result<(), ClientError> {
        out.write_long(self.id)?;
        out.write_long(self.zone)?;
        out.write_utf(&self.name)
    }
}

pub fn rows<T: Streamable + Send + Sync + 'static>(
    items: Vec<T>,
) -> Vec<Arc<dyn Streamable + Send + Sync>> {
    items
        .into_iter()
        .map(|item| Arc::new(item) as Arc<dyn Streamable + Send + Sync>)
        .collect()
}
