//! Network transport layer
//!
//! The protocol engines in [`server`](crate::server) and [`client`](crate::client)
//! never touch sockets. They write outgoing bytes through [`Transport`] and
//! receive incoming bytes through [`ConnectionHandler`]. This module supplies
//! the tokio implementations:
//!
//! - [`TcpServer`]: accepts connections, one task and one
//!   [`ServerSession`] per peer, all sharing one register table
//! - [`TcpClient`]: drives a [`ClientEngine`] over a single connection and
//!   waits for the event that completes each request
//!
//! A `Vec<u8>` is itself a [`Transport`]; the TCP loops use one as an outbox
//! and flush it to the socket after every delivery.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{ClientEngine, ClientEvent};
use crate::config::{ClientConfig, ServerConfig};
use crate::constants::READ_BUFFER_SIZE;
use crate::error::{ModbusError, ModbusResult};
use crate::server::{ServerDispatcher, ServerSession};
use crate::table::{shared, BitSpace, RegisterTable, SharedTable, WordSpace};

/// Outgoing byte sink
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> ModbusResult<()>;
}

impl Transport for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Receiver of connection lifecycle and inbound bytes.
///
/// Chunks may split or merge frames arbitrarily; implementors reassemble.
pub trait ConnectionHandler {
    /// What a delivery produces (responses sent, client events)
    type Output;

    fn on_connect(&mut self);

    fn on_bytes(&mut self, chunk: &[u8]) -> ModbusResult<Self::Output>;

    fn on_disconnect(&mut self) -> Self::Output;
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

// ============================================================================
// Server
// ============================================================================

/// Modbus TCP server bound to a listening socket
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    dispatcher: ServerDispatcher,
}

impl TcpServer {
    /// Bind with a fresh table laid out per `config`.
    pub async fn bind(config: &ServerConfig) -> ModbusResult<Self> {
        config.validate()?;
        let table = shared(config.build_table()?);
        Self::bind_with_table(config, table).await
    }

    /// Bind serving an existing shared table.
    pub async fn bind_with_table(config: &ServerConfig, table: SharedTable) -> ModbusResult<Self> {
        let listener = TcpListener::bind(config.bind_address).await.map_err(|e| {
            ModbusError::connection(format!(
                "Failed to bind to {}: {}",
                config.bind_address, e
            ))
        })?;

        info!(
            "Modbus TCP server listening on {} (unit {})",
            listener.local_addr()?,
            config.unit_id
        );

        Ok(Self {
            listener,
            dispatcher: ServerDispatcher::new(config.unit_id, table),
        })
    }

    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn table(&self) -> &SharedTable {
        self.dispatcher.table()
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> ModbusResult<ServerHandle> {
        let local_addr = self.local_addr()?;
        let table = self.dispatcher.table().clone();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(self.run(shutdown_rx));
        Ok(ServerHandle {
            local_addr,
            table,
            shutdown_tx,
            task,
        })
    }

    /// Accept connections until a shutdown signal arrives, then close every
    /// connection and wait for its task to finish.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let dispatcher = self.dispatcher.clone();
                            let connection_shutdown = shutdown_tx.subscribe();
                            connections.spawn(async move {
                                serve_connection(stream, peer, dispatcher, connection_shutdown).await;
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(());
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("Connection task failed: {}", e);
            }
        }
    }
}

/// Handle to a server running on a background task
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    table: SharedTable,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn table(&self) -> &SharedTable {
        &self.table
    }

    /// Stop accepting, close every connection and wait for the loop to end.
    pub async fn stop(self) -> ModbusResult<()> {
        let _ = self.shutdown_tx.send(());
        self.task
            .await
            .map_err(|e| ModbusError::internal(format!("server task failed: {}", e)))?;
        info!("Modbus TCP server on {} stopped", self.local_addr);
        Ok(())
    }
}

async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    dispatcher: ServerDispatcher,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = ServerSession::new(dispatcher, Vec::new(), peer.to_string());
    session.on_connect();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!("Shutdown signal received for client {}", peer);
                break;
            }
            result = stream.read(&mut buffer) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = session.on_bytes(&buffer[..n]) {
                            if e.is_connection_fatal() {
                                error!("Error processing data from {}: {}", peer, e);
                                break;
                            }
                            warn!("Error processing data from {}: {}", peer, e);
                        }
                        let outbox = std::mem::take(session.transport_mut());
                        if !outbox.is_empty() {
                            if let Err(e) = stream.write_all(&outbox).await {
                                error!("Failed to send response to {}: {}", peer, e);
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Read error from {}: {}", peer, e);
                        break;
                    }
                }
            }
        }
    }

    session.on_disconnect();
}

// ============================================================================
// Client
// ============================================================================

/// Modbus TCP client over one tokio connection.
///
/// Each call issues one request and waits for the event that completes it.
/// Read results are mirrored into the local table and returned; write
/// values are stored in the local table before being sent.
///
/// | Function Code | Primary Name | Semantic Alias |
/// |---------------|--------------|----------------|
/// | 0x01 | `read_01()` | `read_coils()` |
/// | 0x02 | `read_02()` | `read_discrete_inputs()` |
/// | 0x03 | `read_03()` | `read_holding_registers()` |
/// | 0x04 | `read_04()` | `read_input_registers()` |
/// | 0x05 | `write_05()` | `write_single_coil()` |
/// | 0x06 | `write_06()` | `write_single_register()` |
/// | 0x0F | `write_0f()` | `write_multiple_coils()` |
/// | 0x10 | `write_10()` | `write_multiple_registers()` |
///
/// ```rust,no_run
/// use modbus_node::{ClientConfig, ModbusResult, TcpClient};
///
/// #[tokio::main]
/// async fn main() -> ModbusResult<()> {
///     let config = ClientConfig::new().with_server_address("127.0.0.1:502".parse().unwrap());
///     let mut client = TcpClient::connect(&config).await?;
///
///     client.write_06(100, 0x1234).await?;
///     let values = client.read_03(100, 1).await?;
///     assert_eq!(values, vec![0x1234]);
///
///     client.close().await
/// }
/// ```
#[derive(Debug)]
pub struct TcpClient {
    stream: TcpStream,
    engine: ClientEngine<Vec<u8>>,
    server_address: SocketAddr,
    buffer: Vec<u8>,
    /// Events that completed other transactions while one was awaited,
    /// with the time each was recorded
    completed: HashMap<u16, (ClientEvent, Instant)>,
}

impl TcpClient {
    pub async fn connect(config: &ClientConfig) -> ModbusResult<Self> {
        config.validate()?;
        let table = config.build_table()?;
        let mut engine = ClientEngine::new(config.unit_id, table, Vec::new())
            .with_timeout(config.request_timeout);
        engine.mark_connecting();

        let address = config.server_address;
        let stream = match timeout(config.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ModbusError::connection(format!(
                    "Failed to connect to {}: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(ModbusError::timeout(
                    format!("connect to {}", address),
                    config.connect_timeout.as_millis() as u64,
                ))
            }
        };
        stream.set_nodelay(true)?;

        engine.on_connect();
        info!("Connected to Modbus server {}", address);

        Ok(Self {
            stream,
            engine,
            server_address: address,
            buffer: vec![0u8; READ_BUFFER_SIZE],
            completed: HashMap::new(),
        })
    }

    pub fn server_address(&self) -> SocketAddr {
        self.server_address
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    pub fn engine(&self) -> &ClientEngine<Vec<u8>> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ClientEngine<Vec<u8>> {
        &mut self.engine
    }

    pub fn table(&self) -> &RegisterTable {
        self.engine.table()
    }

    pub fn table_mut(&mut self) -> &mut RegisterTable {
        self.engine.table_mut()
    }

    pub fn get_stats(&self) -> TransportStats {
        self.engine.stats()
    }

    /// Flush queued requests and wait for the event completing `transaction_id`.
    ///
    /// Events completing other transactions are kept for their own
    /// `execute` call until one request timeout has passed. Requests older
    /// than the timeout are expired on every call, awaited or not.
    pub async fn execute(&mut self, transaction_id: u16) -> ModbusResult<ClientEvent> {
        self.flush().await?;
        let expired = self.engine.expire(Instant::now().into_std());
        if let Some(event) = self.settle(expired, transaction_id) {
            return Ok(event);
        }

        if !self.engine.is_pending(transaction_id) {
            return self
                .completed
                .remove(&transaction_id)
                .map(|(event, _)| event)
                .ok_or_else(|| {
                    ModbusError::invalid_argument(format!(
                        "transaction {:04X} is not pending",
                        transaction_id
                    ))
                });
        }
        // A kept event under a pending ID belongs to an earlier use of the ID
        if self.completed.remove(&transaction_id).is_some() {
            debug!("Discarding stale event for reused trans_id={:04X}", transaction_id);
        }

        let deadline = Instant::now() + self.engine.request_timeout();
        loop {
            let read = timeout_at(deadline, self.stream.read(&mut self.buffer)).await;
            let events = match read {
                Err(_) => {
                    let mut events = self.engine.expire(Instant::now().into_std());
                    events.extend(self.engine.expire_request(transaction_id));
                    events
                }
                Ok(Ok(0)) => {
                    warn!("Server {} closed the connection", self.server_address);
                    self.engine.on_disconnect()
                }
                Ok(Err(e)) => {
                    let closed = self.engine.on_disconnect();
                    self.settle(closed, transaction_id);
                    return Err(e.into());
                }
                Ok(Ok(n)) => {
                    let mut events = self.engine.on_bytes(&self.buffer[..n])?;
                    events.extend(self.engine.expire(Instant::now().into_std()));
                    events
                }
            };

            if let Some(event) = self.settle(events, transaction_id) {
                return Ok(event);
            }
            if !self.engine.is_pending(transaction_id) {
                return Err(ModbusError::internal(format!(
                    "transaction {:04X} completed without an event",
                    transaction_id
                )));
            }
        }
    }

    /// Pick out the event for `transaction_id`, keeping the others.
    fn settle(&mut self, events: Vec<ClientEvent>, transaction_id: u16) -> Option<ClientEvent> {
        let now = Instant::now();
        let retention = self.engine.request_timeout();
        self.completed
            .retain(|_, (_, recorded)| now.saturating_duration_since(*recorded) < retention);

        let mut awaited = None;
        for event in events {
            if !event.completes_request() {
                debug!("Ignoring event while waiting for {:04X}: {:?}", transaction_id, event);
            } else if event.transaction_id() == transaction_id {
                awaited = Some(event);
            } else {
                self.completed.insert(event.transaction_id(), (event, now));
            }
        }
        awaited
    }

    async fn flush(&mut self) -> ModbusResult<()> {
        let outbox = std::mem::take(self.engine.transport_mut());
        if outbox.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.stream.write_all(&outbox).await {
            self.engine.on_disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    fn check(&self, event: ClientEvent) -> ModbusResult<()> {
        match event {
            ClientEvent::ReadApplied { .. } | ClientEvent::WriteConfirmed { .. } => Ok(()),
            ClientEvent::Exception { function, code, .. } => Err(ModbusError::Exception {
                function: function.to_u8(),
                code,
            }),
            ClientEvent::WriteMismatch {
                expected, received, ..
            } => Err(ModbusError::invalid_data(format!(
                "write echo {:02X?} differs from request {:02X?}",
                received, expected
            ))),
            ClientEvent::MalformedResponse { reason, .. } => Err(ModbusError::invalid_data(reason)),
            ClientEvent::UnexpectedUnit {
                expected, received, ..
            } => Err(ModbusError::invalid_data(format!(
                "response from unit {} (expected {})",
                received, expected
            ))),
            ClientEvent::RequestTimedOut { transaction_id } => Err(ModbusError::timeout(
                format!("request {:04X}", transaction_id),
                self.engine.request_timeout().as_millis() as u64,
            )),
            ClientEvent::ConnectionClosed { .. } => Err(ModbusError::connection(
                "connection closed while request was pending",
            )),
            other => Err(ModbusError::internal(format!("unexpected event {:?}", other))),
        }
    }

    async fn run(&mut self, transaction_id: u16) -> ModbusResult<()> {
        let event = self.execute(transaction_id).await?;
        self.check(event)
    }

    // ===== Function-code API =====

    /// Read coils (0x01)
    pub async fn read_01(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let tid = self.engine.read_coils(address, quantity)?;
        self.run(tid).await?;
        self.engine
            .table()
            .get_bits(BitSpace::Coils, address as usize, quantity as usize)
    }

    /// Read discrete inputs (0x02)
    pub async fn read_02(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        let tid = self.engine.read_discrete_inputs(address, quantity)?;
        self.run(tid).await?;
        self.engine
            .table()
            .get_bits(BitSpace::DiscreteInputs, address as usize, quantity as usize)
    }

    /// Read holding registers (0x03)
    pub async fn read_03(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let tid = self.engine.read_holding_registers(address, quantity)?;
        self.run(tid).await?;
        self.engine.table().get_registers(
            WordSpace::HoldingRegisters,
            address as usize,
            quantity as usize,
        )
    }

    /// Read input registers (0x04)
    pub async fn read_04(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<u16>> {
        let tid = self.engine.read_input_registers(address, quantity)?;
        self.run(tid).await?;
        self.engine.table().get_registers(
            WordSpace::InputRegisters,
            address as usize,
            quantity as usize,
        )
    }

    /// Write single coil (0x05)
    pub async fn write_05(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        self.engine
            .table_mut()
            .set_bit(BitSpace::Coils, address as usize, value)?;
        let tid = self.engine.write_single_coil(address)?;
        self.run(tid).await
    }

    /// Write single register (0x06)
    pub async fn write_06(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        self.engine
            .table_mut()
            .set_register(WordSpace::HoldingRegisters, address as usize, value)?;
        let tid = self.engine.write_single_register(address)?;
        self.run(tid).await
    }

    /// Write multiple coils (0x0F)
    pub async fn write_0f(&mut self, address: u16, values: &[bool]) -> ModbusResult<()> {
        let count = quantity_of(values.len())?;
        self.engine
            .table_mut()
            .set_bits(BitSpace::Coils, address as usize, values)?;
        let tid = self.engine.write_multiple_coils(address, count)?;
        self.run(tid).await
    }

    /// Write multiple registers (0x10)
    pub async fn write_10(&mut self, address: u16, values: &[u16]) -> ModbusResult<()> {
        let count = quantity_of(values.len())?;
        self.engine
            .table_mut()
            .set_registers(WordSpace::HoldingRegisters, address as usize, values)?;
        let tid = self.engine.write_multiple_registers(address, count)?;
        self.run(tid).await
    }

    // ===== Semantic aliases =====

    pub async fn read_coils(&mut self, address: u16, quantity: u16) -> ModbusResult<Vec<bool>> {
        self.read_01(address, quantity).await
    }

    pub async fn read_discrete_inputs(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<bool>> {
        self.read_02(address, quantity).await
    }

    pub async fn read_holding_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_03(address, quantity).await
    }

    pub async fn read_input_registers(
        &mut self,
        address: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u16>> {
        self.read_04(address, quantity).await
    }

    pub async fn write_single_coil(&mut self, address: u16, value: bool) -> ModbusResult<()> {
        self.write_05(address, value).await
    }

    pub async fn write_single_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        self.write_06(address, value).await
    }

    pub async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> ModbusResult<()> {
        self.write_0f(address, values).await
    }

    pub async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> ModbusResult<()> {
        self.write_10(address, values).await
    }

    /// Close the connection; pending requests fail with `ConnectionClosed`.
    pub async fn close(&mut self) -> ModbusResult<()> {
        self.completed.clear();
        let closed = self.engine.on_disconnect();
        if !closed.is_empty() {
            debug!("{} requests abandoned on close", closed.len());
        }
        self.stream.shutdown().await?;
        info!("Disconnected from Modbus server {}", self.server_address);
        Ok(())
    }
}

fn quantity_of(len: usize) -> ModbusResult<u16> {
    u16::try_from(len)
        .map_err(|_| ModbusError::invalid_argument(format!("{} values exceed one request", len)))
}
