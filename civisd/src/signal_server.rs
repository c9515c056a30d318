//! Process-boundary listener that routes worker signals to typed handlers.
//!
//! Requests are newline-delimited JSON [`Signal`]s; each gets exactly one
//! [`SignalResponse`] line back on the same connection. Handlers run on the
//! blocking pool so they may take locks and do file I/O. A handler error or
//! panic is reported to the worker as an error response and never takes
//! the server down.

use anyhow::anyhow;
use civis_common::protocol::{
    Signal, SignalPayload, SignalResponse, SignalType, decode_line, encode_line,
};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Default bind address: loopback, ephemeral port.
pub const DEFAULT_BIND_ADDR: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(Ipv4Addr::LOCALHOST),
    0,
);

type Handler = Arc<dyn Fn(Signal) -> anyhow::Result<SignalResponse> + Send + Sync>;
type HandlerMap = HashMap<SignalType, Handler>;

#[derive(Debug, Error)]
pub enum SignalServerError {
    #[error("failed to bind signal server to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("a handler for {0} signals is already registered")]
    DuplicateHandler(SignalType),

    #[error("signal server is already started")]
    AlreadyStarted,
}

struct Running {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

pub struct SignalServer {
    bind_addr: SocketAddr,
    handlers: HandlerMap,
    running: Option<Running>,
}

impl std::fmt::Debug for SignalServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalServer")
            .field("bind_addr", &self.bind_addr)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("address", &self.address())
            .finish()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_ADDR)
    }
}

impl SignalServer {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            handlers: HashMap::new(),
            running: None,
        }
    }

    /// Install the handler for payload type `T`.
    ///
    /// Must be called before [`Self::start`]; one handler per signal type.
    pub fn register_signal_handler<T, F>(&mut self, handler: F) -> Result<(), SignalServerError>
    where
        T: SignalPayload,
        F: Fn(T) -> anyhow::Result<SignalResponse> + Send + Sync + 'static,
    {
        if self.running.is_some() {
            return Err(SignalServerError::AlreadyStarted);
        }
        match self.handlers.entry(T::TYPE) {
            Entry::Occupied(_) => Err(SignalServerError::DuplicateHandler(T::TYPE)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(move |signal: Signal| {
                    match T::from_signal(signal) {
                        Ok(payload) => handler(payload),
                        Err(other) => Err(anyhow!(
                            "{} signal routed to the {} handler",
                            other.signal_type(),
                            T::TYPE
                        )),
                    }
                }));
                Ok(())
            }
        }
    }

    /// Bind the listener and start accepting workers.
    pub async fn start(&mut self) -> Result<SocketAddr, SignalServerError> {
        if self.running.is_some() {
            return Err(SignalServerError::AlreadyStarted);
        }
        let listener =
            TcpListener::bind(self.bind_addr)
                .await
                .map_err(|source| SignalServerError::Bind {
                    address: self.bind_addr,
                    source,
                })?;
        let address = listener
            .local_addr()
            .map_err(|source| SignalServerError::Bind {
                address: self.bind_addr,
                source,
            })?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handlers = Arc::new(self.handlers.clone());
        let accept_task = tokio::spawn(accept_loop(listener, handlers, shutdown_rx));
        info!(%address, handlers = self.handlers.len(), "Signal server listening");

        self.running = Some(Running {
            address,
            shutdown,
            accept_task,
        });
        Ok(address)
    }

    /// Address workers should connect to, once started.
    pub fn address(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.address)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stop accepting, let in-flight requests answer, then close every connection.
    ///
    /// No-op if the server was never started.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!("Signal server stop requested but it was never started");
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept_task.await {
            warn!("Signal server accept task failed: {}", e);
        }
        info!(address = %running.address, "Signal server stopped");
    }
}

impl Drop for SignalServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            let _ = running.shutdown.send(true);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handlers: Arc<HandlerMap>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Worker connected");
                    let handlers = Arc::clone(&handlers);
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, handlers, shutdown).await {
                            warn!(%peer, "Connection error: {}", e);
                        }
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_connection_exit(joined);
            }
        }
    }

    drop(listener);
    debug!(open = connections.len(), "Draining signal connections");
    while let Some(joined) = connections.join_next().await {
        log_connection_exit(joined);
    }
}

fn log_connection_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!("Connection task failed: {}", e);
    }
}

async fn handle_connection(
    stream: TcpStream,
    handlers: Arc<HandlerMap>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let line = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = dispatch(&handlers, &line).await;
        let encoded = encode_line(&response)
            .or_else(|e| encode_line(&SignalResponse::error(e.to_string())))
            .map_err(std::io::Error::other)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

async fn dispatch(handlers: &HandlerMap, line: &str) -> SignalResponse {
    let signal: Signal = match decode_line(line) {
        Ok(signal) => signal,
        Err(e) => {
            warn!("Rejecting undecodable signal: {}", e);
            return SignalResponse::error(format!("Could not decode signal: {e}"));
        }
    };
    let signal_type = signal.signal_type();
    let Some(handler) = handlers.get(&signal_type).cloned() else {
        warn!(%signal_type, "No handler registered");
        return SignalResponse::error(format!(
            "No handler registered for signal type {signal_type}"
        ));
    };

    match tokio::task::spawn_blocking(move || handler(signal)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(%signal_type, "Signal handler failed: {:#}", e);
            SignalResponse::error(format!("{e:#}"))
        }
        Err(join) => {
            let message = panic_message(join);
            error!(%signal_type, "Signal handler panicked: {}", message);
            SignalResponse::error(format!("Handler for {signal_type} panicked: {message}"))
        }
    }
}

fn panic_message(join: JoinError) -> String {
    if !join.is_panic() {
        return join.to_string();
    }
    let payload = join.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
