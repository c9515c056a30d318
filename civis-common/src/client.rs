//! Blocking client a worker uses to talk to the session's signal server.
//!
//! Test framework callbacks are synchronous, so this uses
//! `std::net` rather than the async runtime the server runs on.

use crate::config::{EnvParser, vars};
use crate::protocol::{CodecError, Signal, SignalResponse, decode_line, encode_line};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_CLIENT_TIMEOUT_MS);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to signal server at {address}: {source}")]
    Connect {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("signal server address '{0}' could not be resolved")]
    Resolve(String),

    #[error("i/o error talking to signal server: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("signal server closed the connection without responding")]
    Closed,

    #[error("signal server rejected {signal}: {message}")]
    Rejected { signal: String, message: String },
}

/// Sends one [`Signal`] per connection and waits for its response.
#[derive(Debug, Clone)]
pub struct SignalClient {
    address: SocketAddr,
    timeout: Duration,
}

impl SignalClient {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `host:port` into a client.
    pub fn connect_to(host: &str, port: u16) -> Result<Self, ClientError> {
        let target = format!("{host}:{port}");
        let address = target
            .to_socket_addrs()
            .map_err(|_| ClientError::Resolve(target.clone()))?
            .next()
            .ok_or(ClientError::Resolve(target))?;
        Ok(Self::new(address))
    }

    /// Build a client from the discovery variables a session exports.
    ///
    /// Returns `Ok(None)` when no signal server is advertised.
    pub fn from_env() -> Result<Option<Self>, ClientError> {
        let mut parser = EnvParser::new();
        let host = parser.get_optional_string(vars::SIGNAL_SERVER_HOST).value;
        let port = parser.get_u16_range(vars::SIGNAL_SERVER_PORT, 0, 1, u16::MAX).value;
        let timeout_ms = parser
            .get_u64_range(
                vars::SIGNAL_CLIENT_TIMEOUT_MS,
                DEFAULT_CLIENT_TIMEOUT_MS,
                1,
                3_600_000,
            )
            .value;
        for error in parser.take_errors() {
            warn!("{error}");
        }
        let Some(host) = host.filter(|_| port != 0) else {
            return Ok(None);
        };
        let client = Self::connect_to(&host, port)?;
        Ok(Some(client.with_timeout(Duration::from_millis(timeout_ms))))
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a signal and return the server's response verbatim.
    ///
    /// An `Error` response is returned as `Ok`; see [`Self::request`].
    pub fn send(&self, signal: &Signal) -> Result<SignalResponse, ClientError> {
        let stream = TcpStream::connect_timeout(&self.address, self.timeout).map_err(|source| {
            ClientError::Connect {
                address: self.address,
                source,
            }
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut writer = stream.try_clone()?;
        writer.write_all(&encode_line(signal)?)?;
        writer.flush()?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(ClientError::Closed);
        }
        let response: SignalResponse = decode_line(&line)?;
        debug!(
            signal = %signal.signal_type(),
            error = response.is_error(),
            "Signal answered"
        );
        Ok(response)
    }

    /// Like [`Self::send`], but turns an `Error` response into [`ClientError::Rejected`].
    pub fn request(&self, signal: &Signal) -> Result<SignalResponse, ClientError> {
        match self.send(signal)? {
            SignalResponse::Error { message } => Err(ClientError::Rejected {
                signal: signal.signal_type().to_string(),
                message,
            }),
            response => Ok(response),
        }
    }
}
