//! Connector configuration.
//!
//! Configuration is built in code with [`ConnectorConfig::new`] or loaded from a `key=value`
//! properties file. Durations in properties files are given in milliseconds.
use std::{fs, path::Path, str::FromStr, time::Duration};

use crate::{
    ClientError,
    connector::{Credentials, RetryPolicy},
    protocol::ProtocolVersion,
};

pub const DEFAULT_PORT: u16 = 4582;
pub const DEFAULT_POOL_SIZE: usize = 32;
pub const DEFAULT_MAX_CONNECTION_AGE: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_LISTENER_THREADS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    pub hostname: String,
    pub port: u16,
    pub credentials: Credentials,
    /// Maximum number of idle connections kept for reuse.
    pub pool_size: usize,
    /// Connections older than this are closed instead of being pooled.
    pub max_connection_age: Duration,
    pub connect_timeout: Duration,
    /// `None` blocks indefinitely on reads.
    pub read_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Version offered during the handshake.
    pub protocol_version: ProtocolVersion,
    /// Workers dispatching immediate table listeners.
    pub listener_threads: usize,
}

impl ConnectorConfig {
    pub fn new(hostname: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            credentials,
            pool_size: DEFAULT_POOL_SIZE,
            max_connection_age: DEFAULT_MAX_CONNECTION_AGE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            retry: RetryPolicy::default(),
            protocol_version: ProtocolVersion::CURRENT,
            listener_threads: DEFAULT_LISTENER_THREADS,
        }
    }

    pub fn from_properties(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse_properties(&text)
    }

    /// Parses `hcrpc.*` keys; unknown keys are ignored.
    pub fn parse_properties(text: &str) -> Result<Self, ClientError> {
        let props = Properties::from_text(text)?;

        let hostname = props.required("hcrpc.hostname")?;
        let port = props.parse("hcrpc.port")?.unwrap_or(DEFAULT_PORT);
        let connect_as = props.required("hcrpc.connect_as")?;
        let password = props.required("hcrpc.password")?;
        let mut credentials = Credentials::new(connect_as, password);
        if let Some(authenticate_as) = props.get("hcrpc.authenticate_as") {
            credentials.authenticate_as = authenticate_as.to_string();
        }

        let mut config = Self::new(hostname, port, credentials);
        if let Some(size) = props.parse("hcrpc.pool.size")? {
            config.pool_size = size;
        }
        if let Some(age) = props.millis("hcrpc.pool.max_connection_age")? {
            config.max_connection_age = age;
        }
        if let Some(timeout) = props.millis("hcrpc.connect_timeout")? {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = props.millis("hcrpc.read_timeout")? {
            config.read_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(delays) = props.get("hcrpc.retry_delays") {
            config.retry = parse_delays(delays)?;
        }
        if let Some(version) = props.parse("hcrpc.protocol_version")? {
            config.protocol_version = version;
        }
        if let Some(threads) = props.parse("hcrpc.listener_threads")? {
            config.listener_threads = threads;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.hostname.is_empty() {
            return Err(ClientError::Config("hostname must not be empty".into()));
        }
        if self.protocol_version < ProtocolVersion::OLDEST
            || self.protocol_version > ProtocolVersion::CURRENT
        {
            return Err(ClientError::Config(format!(
                "unsupported protocol version {}",
                self.protocol_version
            )));
        }
        if self.listener_threads == 0 {
            return Err(ClientError::Config(
                "listener thread count must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse_delays(list: &str) -> Result<RetryPolicy, ClientError> {
    let delays = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map_err(|_| ClientError::Config(format!("invalid retry delay '{s}'")))
        })
        .collect::<Result<Vec<u64>, ClientError>>()?;
    Ok(RetryPolicy::from_millis(&delays))
}

struct Properties<'a> {
    entries: Vec<(&'a str, &'a str)>,
}

impl<'a> Properties<'a> {
    fn from_text(text: &'a str) -> Result<Self, ClientError> {
        let mut entries = Vec::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                ClientError::Config(format!("line {}: expected key=value", number + 1))
            })?;
            entries.push((key.trim(), value.trim()));
        }
        Ok(Self { entries })
    }

    /// Last value given for `key`.
    fn get(&self, key: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    fn required(&self, key: &str) -> Result<&'a str, ClientError> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ClientError::Config(format!("missing required property {key}")))
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ClientError> {
        self.get(key)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|_| ClientError::Config(format!("invalid value '{v}' for {key}")))
            })
            .transpose()
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ClientError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;

    use tempdir::TempDir;

    use super::*;

    const MINIMAL: &str = "\
hcrpc.hostname = master.example.com
hcrpc.connect_as = admin
hcrpc.password = secret
";

    #[test]
    fn minimal_properties_use_defaults() {
        let config = ConnectorConfig::parse_properties(MINIMAL).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.credentials.authenticate_as, "admin");
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.read_timeout, Some(DEFAULT_READ_TIMEOUT));
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn overrides_are_applied() {
        let text = format!(
            "{MINIMAL}\n# switch users\nhcrpc.authenticate_as = root\nhcrpc.port=9000\n\
             hcrpc.retry_delays = 10, 20,30\nhcrpc.read_timeout=0\nhcrpc.protocol_version=1.0.0\n\
             hcrpc.pool.max_connection_age=1500\n"
        );
        let config = ConnectorConfig::parse_properties(&text).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.credentials.connect_as, "admin");
        assert_eq!(config.credentials.authenticate_as, "root");
        assert_eq!(config.retry.max_attempts(true), 4);
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.protocol_version, ProtocolVersion::V1_0_0);
        assert_eq!(config.max_connection_age, Duration::from_millis(1500));
    }

    #[test]
    fn invalid_properties_are_config_errors() {
        for text in [
            "hcrpc.hostname=h\nhcrpc.password=p\n",
            "hcrpc.hostname=h\nhcrpc.connect_as=u\nhcrpc.password=p\nhcrpc.port=abc\n",
            "hcrpc.hostname=h\nhcrpc.connect_as=u\nhcrpc.password=p\nhcrpc.retry_delays=1,x\n",
            "hcrpc.hostname=h\nhcrpc.connect_as=u\nhcrpc.password=p\nhcrpc.protocol_version=9.0.0\n",
            "not a property line\n",
        ] {
            let err = ConnectorConfig::parse_properties(text).unwrap_err();
            assert!(matches!(err, ClientError::Config(_)), "{text}: {err}");
        }
    }

    #[test]
    fn loads_from_file() {
        let dir = TempDir::new("hcrpc-config").unwrap();
        let path = dir.path().join("client.properties");
        File::create(&path)
            .unwrap()
            .write_all(MINIMAL.as_bytes())
            .unwrap();

        let config = ConnectorConfig::from_properties(&path).unwrap();
        assert_eq!(config.hostname, "master.example.com");

        let missing = ConnectorConfig::from_properties(dir.path().join("absent"));
        assert!(matches!(missing, Err(ClientError::Config(_))));
    }
}
