//! # Node Configuration
//!
//! Settings for the TCP server and client. Both carry the capacities of the
//! four register spaces of their table and build it with `build_table()`.
//!
//! ## Defaults
//!
//! - **Server**: binds `0.0.0.0:502`, unit ID 1, 100 entries per space
//! - **Client**: connects to `127.0.0.1:502`, unit ID 1, 5 s request timeout

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::constants::MAX_TABLE_CAPACITY;
use crate::error::{ModbusError, ModbusResult};
use crate::table::RegisterTable;
use crate::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS};

/// Default number of entries in each register space.
pub const DEFAULT_SPACE_CAPACITY: usize = 100;

/// Default unit identifier.
pub const DEFAULT_UNIT_ID: u8 = 1;

/// Default TCP connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;

/// Capacities of the four register spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self::uniform(DEFAULT_SPACE_CAPACITY)
    }
}

impl TableLayout {
    /// Same capacity for every space
    pub fn uniform(capacity: usize) -> Self {
        Self {
            coils: capacity,
            discrete_inputs: capacity,
            holding_registers: capacity,
            input_registers: capacity,
        }
    }

    pub fn validate(&self) -> ModbusResult<()> {
        for (name, capacity) in [
            ("coils", self.coils),
            ("discrete_inputs", self.discrete_inputs),
            ("holding_registers", self.holding_registers),
            ("input_registers", self.input_registers),
        ] {
            if capacity > MAX_TABLE_CAPACITY {
                return Err(ModbusError::invalid_argument(format!(
                    "{} capacity {} exceeds {}",
                    name, capacity, MAX_TABLE_CAPACITY
                )));
            }
        }
        Ok(())
    }

    /// Allocate a zero-filled table with this layout.
    pub fn build_table(&self) -> ModbusResult<RegisterTable> {
        RegisterTable::new(
            self.coils,
            self.discrete_inputs,
            self.holding_registers,
            self.input_registers,
        )
    }
}

/// Modbus TCP server settings.
///
/// # Example
///
/// ```rust
/// use modbus_node::ServerConfig;
///
/// let config = ServerConfig::new()
///     .with_bind_address("127.0.0.1:1502".parse().unwrap())
///     .with_unit_id(7)
///     .with_holding_registers(500);
///
/// let table = config.build_table().unwrap();
/// assert_eq!(table.capacity(modbus_node::Space::HoldingRegisters), 500);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_address: SocketAddr,
    /// Unit ID this server answers for.
    pub unit_id: u8,
    /// Table capacities.
    pub layout: TableLayout,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TCP_PORT)),
            unit_id: DEFAULT_UNIT_ID,
            layout: TableLayout::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_layout(mut self, layout: TableLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_coils(mut self, capacity: usize) -> Self {
        self.layout.coils = capacity;
        self
    }

    pub fn with_discrete_inputs(mut self, capacity: usize) -> Self {
        self.layout.discrete_inputs = capacity;
        self
    }

    pub fn with_holding_registers(mut self, capacity: usize) -> Self {
        self.layout.holding_registers = capacity;
        self
    }

    pub fn with_input_registers(mut self, capacity: usize) -> Self {
        self.layout.input_registers = capacity;
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        self.layout.validate()
    }

    pub fn build_table(&self) -> ModbusResult<RegisterTable> {
        self.layout.build_table()
    }
}

/// Modbus TCP client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server to connect to.
    pub server_address: SocketAddr,
    /// Unit ID placed in every request.
    pub unit_id: u8,
    /// How long a request may stay pending.
    pub request_timeout: Duration,
    /// How long to wait for the TCP handshake.
    pub connect_timeout: Duration,
    /// Capacities of the local mirror table.
    pub layout: TableLayout,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_TCP_PORT)),
            unit_id: DEFAULT_UNIT_ID,
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            layout: TableLayout::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_address(mut self, address: SocketAddr) -> Self {
        self.server_address = address;
        self
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_layout(mut self, layout: TableLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn validate(&self) -> ModbusResult<()> {
        if self.request_timeout.is_zero() {
            return Err(ModbusError::invalid_argument("request timeout must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ModbusError::invalid_argument("connect timeout must be non-zero"));
        }
        self.layout.validate()
    }

    pub fn build_table(&self) -> ModbusResult<RegisterTable> {
        self.layout.build_table()
    }
}
