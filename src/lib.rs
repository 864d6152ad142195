//! # Modbus Node - Modbus TCP Protocol Engine
//!
//! A Modbus TCP node that can act as a server (slave) answering requests
//! against a local register table, as a client (master) mirroring a remote
//! unit into its own table, or both at once.
//!
//! ## Features
//!
//! - **Stream Reassembly**: MBAP frames are rebuilt from arbitrarily split TCP chunks
//! - **Validate-then-Commit Tables**: a rejected write never changes a register
//! - **Concurrent Requests**: the client correlates responses by transaction ID
//! - **Async Transport**: tokio server and client built on the sans-io engines
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Server | Client |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modbus_node::{ClientConfig, ModbusResult, ServerConfig, TcpClient, TcpServer};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let server_config = ServerConfig::new().with_bind_address("127.0.0.1:1502".parse().unwrap());
//!     let server = TcpServer::bind(&server_config).await?.spawn()?;
//!
//!     let client_config = ClientConfig::new().with_server_address(server.local_addr());
//!     let mut client = TcpClient::connect(&client_config).await?;
//!
//!     client.write_10(0, &[1, 2, 3]).await?;
//!     println!("Registers: {:?}", client.read_03(0, 3).await?);
//!
//!     client.close().await?;
//!     server.stop().await
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Function and exception code definitions
pub mod protocol;

/// Four-space register table
pub mod table;

/// LSB-first bit packing
pub mod bits;

/// PDU construction and parsing
pub mod pdu;

/// MBAP framing and stream reassembly
pub mod frame;

// ============================================================================
// Node roles
// ============================================================================

/// Server-side request dispatch
pub mod server;

/// Transaction-correlating client engine
pub mod client;

/// Transport seams and tokio TCP implementations
pub mod transport;

/// Server and client configuration
pub mod config;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use modbus_node::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Core types ===
pub use frame::{Frame, FrameDecoder};
pub use pdu::{ModbusPdu, PduBuilder, PduReader};
pub use protocol::{ExceptionCode, FunctionCode};
pub use table::{BitSpace, RegisterTable, SharedTable, Space, WordSpace};

// === Node roles ===
pub use client::{ClientEngine, ClientEvent, LinkState, PendingRequest};
pub use server::{ServerDispatcher, ServerSession};

// === Transport ===
pub use transport::{
    ConnectionHandler, ServerHandle, TcpClient, TcpServer, Transport, TransportStats,
};

// === Configuration ===
pub use config::{ClientConfig, ServerConfig, TableLayout};

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_TABLE_CAPACITY, MAX_WRITE_COILS,
    MAX_WRITE_REGISTERS,
};

/// Default timeout for operations (5 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Modbus Node v{} - Modbus TCP server and client engine", VERSION)
}
