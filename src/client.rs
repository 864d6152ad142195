//! Modbus client (master) side
//!
//! [`ClientEngine`] issues requests against a remote unit and mirrors the
//! results into its own [`RegisterTable`]. Several requests may be in flight
//! at once; responses are correlated by MBAP transaction ID, so they may
//! arrive in any order.
//!
//! The engine never blocks and never reads a socket itself. Bytes received
//! from the network are handed to [`ClientEngine::on_bytes`], which reports
//! what happened as [`ClientEvent`]s. The async [`TcpClient`](crate::transport::TcpClient)
//! drives an engine over tokio.
//!
//! # Requests
//!
//! | Function Code | Method | Table effect on success |
//! |---------------|--------|-------------------------|
//! | 0x01 | `read_coils()` | coils `[start, start+count)` overwritten |
//! | 0x02 | `read_discrete_inputs()` | discrete inputs overwritten |
//! | 0x03 | `read_holding_registers()` | holding registers overwritten |
//! | 0x04 | `read_input_registers()` | input registers overwritten |
//! | 0x05 | `write_single_coil()` | none, value taken from local coils |
//! | 0x06 | `write_single_register()` | none, value taken from local holding registers |
//! | 0x0F | `write_multiple_coils()` | none |
//! | 0x10 | `write_multiple_registers()` | none |
//!
//! # Example
//!
//! ```rust
//! use modbus_node::{ClientEngine, ConnectionHandler, RegisterTable, WordSpace};
//!
//! let table = RegisterTable::new(0, 0, 16, 0).unwrap();
//! let mut engine = ClientEngine::new(1, table, Vec::<u8>::new());
//! engine.on_connect();
//!
//! engine.table_mut().set_register(WordSpace::HoldingRegisters, 3, 0x1234).unwrap();
//! let tid = engine.write_single_register(3).unwrap();
//!
//! assert!(engine.is_pending(tid));
//! assert_eq!(engine.transport().len(), 12);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bits::{packed_len, unpack_bits};
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{Frame, FrameDecoder};
use crate::pdu::{ModbusPdu, PduBuilder, PduReader};
use crate::protocol::{ExceptionCode, FunctionCode};
use crate::table::{BitSpace, RegisterTable, Space, WordSpace};
use crate::transport::{ConnectionHandler, Transport, TransportStats};

/// Connection state as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// A request awaiting its response
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Exact frame that was sent
    pub frame: Frame,
    pub function: FunctionCode,
    pub start: u16,
    pub count: u16,
    pub sent_at: Instant,
}

/// Outcome reported by the client engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Read response accepted and copied into the local table
    ReadApplied {
        transaction_id: u16,
        function: FunctionCode,
        start: u16,
        count: u16,
    },
    /// Write response echoed the request
    WriteConfirmed {
        transaction_id: u16,
        function: FunctionCode,
        start: u16,
        count: u16,
    },
    /// Write response echo differs from what was sent
    WriteMismatch {
        transaction_id: u16,
        function: FunctionCode,
        expected: Vec<u8>,
        received: Vec<u8>,
    },
    /// Remote unit answered with an exception
    Exception {
        transaction_id: u16,
        function: FunctionCode,
        code: ExceptionCode,
    },
    /// No pending request carries this transaction ID
    UnexpectedResponse { transaction_id: u16 },
    /// Transaction ID matched but the unit ID did not; nothing was applied
    UnexpectedUnit {
        transaction_id: u16,
        expected: u8,
        received: u8,
    },
    /// Response could not be interpreted; nothing was applied
    MalformedResponse { transaction_id: u16, reason: String },
    /// No response arrived within the request timeout
    RequestTimedOut { transaction_id: u16 },
    /// Connection dropped while the request was pending
    ConnectionClosed { transaction_id: u16 },
}

impl ClientEvent {
    pub fn transaction_id(&self) -> u16 {
        match self {
            ClientEvent::ReadApplied { transaction_id, .. }
            | ClientEvent::WriteConfirmed { transaction_id, .. }
            | ClientEvent::WriteMismatch { transaction_id, .. }
            | ClientEvent::Exception { transaction_id, .. }
            | ClientEvent::UnexpectedResponse { transaction_id }
            | ClientEvent::UnexpectedUnit { transaction_id, .. }
            | ClientEvent::MalformedResponse { transaction_id, .. }
            | ClientEvent::RequestTimedOut { transaction_id }
            | ClientEvent::ConnectionClosed { transaction_id } => *transaction_id,
        }
    }

    /// Whether the request completed as asked
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ClientEvent::ReadApplied { .. } | ClientEvent::WriteConfirmed { .. }
        )
    }

    /// Whether this event ends the request it refers to
    pub fn completes_request(&self) -> bool {
        !matches!(self, ClientEvent::UnexpectedResponse { .. })
    }
}

/// Transaction-correlating Modbus client
#[derive(Debug)]
pub struct ClientEngine<T> {
    unit_id: u8,
    table: RegisterTable,
    pending: HashMap<u16, PendingRequest>,
    next_transaction_id: u16,
    decoder: FrameDecoder,
    transport: T,
    request_timeout: Duration,
    state: LinkState,
    stats: TransportStats,
}

impl<T: Transport> ClientEngine<T> {
    /// Create a disconnected engine talking to `unit_id`.
    pub fn new(unit_id: u8, table: RegisterTable, transport: T) -> Self {
        Self {
            unit_id,
            table,
            pending: HashMap::new(),
            next_transaction_id: 1,
            decoder: FrameDecoder::new(),
            transport,
            request_timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
            state: LinkState::Disconnected,
            stats: TransportStats::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Record that a connection attempt is under way.
    pub fn mark_connecting(&mut self) {
        self.state = LinkState::Connecting;
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn table(&self) -> &RegisterTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut RegisterTable {
        &mut self.table
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, transaction_id: u16) -> bool {
        self.pending.contains_key(&transaction_id)
    }

    pub fn pending(&self, transaction_id: u16) -> Option<&PendingRequest> {
        self.pending.get(&transaction_id)
    }

    // ===== Requests =====

    /// Request coils `[start, start+count)` (FC01).
    pub fn read_coils(&mut self, start: u16, count: u16) -> ModbusResult<u16> {
        self.read(FunctionCode::ReadCoils, start, count)
    }

    /// Request discrete inputs `[start, start+count)` (FC02).
    pub fn read_discrete_inputs(&mut self, start: u16, count: u16) -> ModbusResult<u16> {
        self.read(FunctionCode::ReadDiscreteInputs, start, count)
    }

    /// Request holding registers `[start, start+count)` (FC03).
    pub fn read_holding_registers(&mut self, start: u16, count: u16) -> ModbusResult<u16> {
        self.read(FunctionCode::ReadHoldingRegisters, start, count)
    }

    /// Request input registers `[start, start+count)` (FC04).
    pub fn read_input_registers(&mut self, start: u16, count: u16) -> ModbusResult<u16> {
        self.read(FunctionCode::ReadInputRegisters, start, count)
    }

    /// Send the local coil at `address` to the remote unit (FC05).
    pub fn write_single_coil(&mut self, address: u16) -> ModbusResult<u16> {
        self.ensure_connected()?;
        let value = self.table.get_bit(BitSpace::Coils, address as usize)?;
        let pdu = PduBuilder::build_write_single_coil(address, value)?;
        self.submit(FunctionCode::WriteSingleCoil, address, 1, pdu)
    }

    /// Send the local holding register at `address` to the remote unit (FC06).
    pub fn write_single_register(&mut self, address: u16) -> ModbusResult<u16> {
        self.ensure_connected()?;
        let value = self.table.get_register(WordSpace::HoldingRegisters, address as usize)?;
        let pdu = PduBuilder::build_write_single_register(address, value)?;
        self.submit(FunctionCode::WriteSingleRegister, address, 1, pdu)
    }

    /// Send local coils `[start, start+count)` to the remote unit (FC0F).
    pub fn write_multiple_coils(&mut self, start: u16, count: u16) -> ModbusResult<u16> {
        self.ensure_connected()?;
        check_request_range(start, count, MAX_WRITE_COILS)?;
        let values = self.table.get_bits(BitSpace::Coils, start as usize, count as usize)?;
        let pdu = PduBuilder::build_write_multiple_coils(start, &values)?;
        self.submit(FunctionCode::WriteMultipleCoils, start, count, pdu)
    }

    /// Send local holding registers `[start, start+count)` to the remote unit (FC10).
    pub fn write_multiple_registers(&mut self, start: u16, count: u16) -> ModbusResult<u16> {
        self.ensure_connected()?;
        check_request_range(start, count, MAX_WRITE_REGISTERS)?;
        let values = self.table.get_registers(
            WordSpace::HoldingRegisters,
            start as usize,
            count as usize,
        )?;
        let pdu = PduBuilder::build_write_multiple_registers(start, &values)?;
        self.submit(FunctionCode::WriteMultipleRegisters, start, count, pdu)
    }

    fn read(&mut self, function: FunctionCode, start: u16, count: u16) -> ModbusResult<u16> {
        self.ensure_connected()?;
        let max = if function.is_bit_access() {
            MAX_READ_COILS
        } else {
            MAX_READ_REGISTERS
        };
        check_request_range(start, count, max)?;

        // The response lands in the local table, so it must fit there too
        let space = local_space(function);
        let capacity = self.table.capacity(space);
        if start as usize + count as usize > capacity {
            return Err(ModbusError::OutOfRange {
                space,
                address: start as usize,
                count: count as usize,
                capacity,
            });
        }

        let pdu = PduBuilder::build_read_request(function, start, count)?;
        self.submit(function, start, count, pdu)
    }

    fn ensure_connected(&self) -> ModbusResult<()> {
        if self.state != LinkState::Connected {
            return Err(ModbusError::connection(format!(
                "cannot send request while {}",
                self.state
            )));
        }
        Ok(())
    }

    fn submit(
        &mut self,
        function: FunctionCode,
        start: u16,
        count: u16,
        pdu: ModbusPdu,
    ) -> ModbusResult<u16> {
        let transaction_id = self.allocate_transaction_id()?;
        let frame = Frame::new(transaction_id, self.unit_id, pdu);
        let bytes = frame.encode()?;

        if let Err(e) = self.transport.write(&bytes) {
            self.stats.errors += 1;
            return Err(e);
        }
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;

        debug!(
            "Sent {} trans_id={:04X} unit={} start={} count={}",
            function, transaction_id, self.unit_id, start, count
        );

        self.pending.insert(
            transaction_id,
            PendingRequest {
                frame,
                function,
                start,
                count,
                sent_at: Instant::now(),
            },
        );
        Ok(transaction_id)
    }

    /// Next free transaction ID, skipping any still pending.
    fn allocate_transaction_id(&mut self) -> ModbusResult<u16> {
        for _ in 0..=u16::MAX {
            let id = self.next_transaction_id;
            self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ModbusError::NoFreeTransactionId)
    }

    // ===== Responses =====

    /// Correlate one decoded response frame with its pending request.
    pub fn handle_response(&mut self, frame: Frame) -> ClientEvent {
        let transaction_id = frame.transaction_id;
        self.stats.responses_received += 1;

        let Some(request) = self.pending.remove(&transaction_id) else {
            warn!("Unexpected response trans_id={:04X}", transaction_id);
            self.stats.errors += 1;
            return ClientEvent::UnexpectedResponse { transaction_id };
        };

        let event = if frame.unit_id != self.unit_id {
            warn!(
                "Response trans_id={:04X} from unit {} (expected {})",
                transaction_id, frame.unit_id, self.unit_id
            );
            ClientEvent::UnexpectedUnit {
                transaction_id,
                expected: self.unit_id,
                received: frame.unit_id,
            }
        } else {
            self.interpret(&request, &frame)
        };
        if !event.is_success() {
            self.stats.errors += 1;
        }
        event
    }

    fn interpret(&mut self, request: &PendingRequest, response: &Frame) -> ClientEvent {
        let transaction_id = response.transaction_id;
        let function = request.function;
        let request_fc = function.to_u8();

        if response.function_code == request_fc | EXCEPTION_FLAG {
            return match response.payload.as_slice() {
                [code] => {
                    let code = ExceptionCode::from_u8(*code);
                    warn!(
                        "Exception for {} trans_id={:04X}: {}",
                        function, transaction_id, code
                    );
                    ClientEvent::Exception {
                        transaction_id,
                        function,
                        code,
                    }
                }
                other => malformed(
                    transaction_id,
                    format!("exception payload of {} bytes", other.len()),
                ),
            };
        }

        if response.function_code != request_fc {
            return malformed(
                transaction_id,
                format!(
                    "function code 0x{:02X} answers request 0x{:02X}",
                    response.function_code, request_fc
                ),
            );
        }

        match self.apply(request, &response.payload) {
            Ok(event) => event,
            Err(e) => malformed(transaction_id, e.to_string()),
        }
    }

    /// Validate a normal response fully, then apply it.
    fn apply(&mut self, request: &PendingRequest, payload: &[u8]) -> ModbusResult<ClientEvent> {
        let transaction_id = request.frame.transaction_id;
        let function = request.function;
        let start = request.start as usize;
        let count = request.count as usize;
        let mut reader = PduReader::new(payload);

        match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                let packed = reader.counted_bytes()?;
                reader.finish()?;
                if packed.len() < packed_len(count) {
                    return Err(ModbusError::invalid_data(format!(
                        "{} bytes cannot carry {} bits",
                        packed.len(),
                        count
                    )));
                }
                let values = unpack_bits(packed, count);
                let space = if function == FunctionCode::ReadCoils {
                    BitSpace::Coils
                } else {
                    BitSpace::DiscreteInputs
                };
                self.table.set_bits(space, start, &values)?;
            }

            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                let byte_count = reader.u8()? as usize;
                if byte_count != count * 2 {
                    return Err(ModbusError::invalid_data(format!(
                        "byte count {} does not match {} registers",
                        byte_count, count
                    )));
                }
                let values = reader.registers(count)?;
                reader.finish()?;
                let space = if function == FunctionCode::ReadHoldingRegisters {
                    WordSpace::HoldingRegisters
                } else {
                    WordSpace::InputRegisters
                };
                self.table.set_registers(space, start, &values)?;
            }

            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                reader.u16()?;
                reader.u16()?;
                reader.finish()?;
                if payload != request.frame.payload.as_slice() {
                    return Ok(mismatch(request, payload));
                }
                return Ok(confirmed(request));
            }

            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                let address = reader.u16()?;
                let quantity = reader.u16()?;
                reader.finish()?;
                if address != request.start || quantity != request.count {
                    return Ok(mismatch(request, payload));
                }
                return Ok(confirmed(request));
            }
        }

        debug!(
            "Applied {} trans_id={:04X} start={} count={}",
            function, transaction_id, start, count
        );
        Ok(ClientEvent::ReadApplied {
            transaction_id,
            function,
            start: request.start,
            count: request.count,
        })
    }

    // ===== Expiry =====

    /// Expire every request older than the request timeout at `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<ClientEvent> {
        let mut stale: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, request)| now.saturating_duration_since(request.sent_at) >= self.request_timeout)
            .map(|(&id, _)| id)
            .collect();
        stale.sort_unstable();

        stale
            .into_iter()
            .filter_map(|id| self.expire_request(id))
            .collect()
    }

    /// Give up on one request regardless of its age.
    pub fn expire_request(&mut self, transaction_id: u16) -> Option<ClientEvent> {
        let request = self.pending.remove(&transaction_id)?;
        warn!(
            "Request {} trans_id={:04X} timed out after {:?}",
            request.function,
            transaction_id,
            request.sent_at.elapsed()
        );
        self.stats.timeouts += 1;
        Some(ClientEvent::RequestTimedOut { transaction_id })
    }
}

impl<T: Transport> ConnectionHandler for ClientEngine<T> {
    type Output = Vec<ClientEvent>;

    fn on_connect(&mut self) {
        self.decoder.reset();
        self.state = LinkState::Connected;
        debug!("Client for unit {} connected", self.unit_id);
    }

    fn on_bytes(&mut self, chunk: &[u8]) -> ModbusResult<Vec<ClientEvent>> {
        self.stats.bytes_received += chunk.len() as u64;
        let frames = self.decoder.feed(chunk);
        Ok(frames
            .into_iter()
            .map(|frame| self.handle_response(frame))
            .collect())
    }

    /// Every pending request fails with `ConnectionClosed`.
    fn on_disconnect(&mut self) -> Vec<ClientEvent> {
        self.state = LinkState::Disconnected;
        self.decoder.reset();

        let mut ids: Vec<u16> = self.pending.drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        if !ids.is_empty() {
            warn!(
                "Connection closed with {} pending requests",
                ids.len()
            );
        }
        ids.into_iter()
            .map(|transaction_id| ClientEvent::ConnectionClosed { transaction_id })
            .collect()
    }
}

fn check_request_range(start: u16, count: u16, max: usize) -> ModbusResult<()> {
    if count == 0 || count as usize > max {
        return Err(ModbusError::invalid_argument(format!(
            "quantity {} outside 1..={}",
            count, max
        )));
    }
    if start as usize + count as usize > 0x1_0000 {
        return Err(ModbusError::invalid_argument(format!(
            "range {}+{} exceeds the 16-bit address space",
            start, count
        )));
    }
    Ok(())
}

fn local_space(function: FunctionCode) -> Space {
    match function {
        FunctionCode::ReadCoils | FunctionCode::WriteSingleCoil | FunctionCode::WriteMultipleCoils => {
            Space::Coils
        }
        FunctionCode::ReadDiscreteInputs => Space::DiscreteInputs,
        FunctionCode::ReadInputRegisters => Space::InputRegisters,
        _ => Space::HoldingRegisters,
    }
}

fn malformed(transaction_id: u16, reason: String) -> ClientEvent {
    warn!("Malformed response trans_id={:04X}: {}", transaction_id, reason);
    ClientEvent::MalformedResponse {
        transaction_id,
        reason,
    }
}

fn confirmed(request: &PendingRequest) -> ClientEvent {
    ClientEvent::WriteConfirmed {
        transaction_id: request.frame.transaction_id,
        function: request.function,
        start: request.start,
        count: request.count,
    }
}

fn mismatch(request: &PendingRequest, received: &[u8]) -> ClientEvent {
    warn!(
        "Write echo mismatch trans_id={:04X}",
        request.frame.transaction_id
    );
    ClientEvent::WriteMismatch {
        transaction_id: request.frame.transaction_id,
        function: request.function,
        expected: request.frame.payload.clone(),
        received: received.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerDispatcher;
    use crate::table::shared;

    fn engine() -> ClientEngine<Vec<u8>> {
        let table = RegisterTable::new(16, 16, 16, 16).unwrap();
        let mut engine = ClientEngine::new(1, table, Vec::<u8>::new());
        engine.on_connect();
        engine
    }

    /// Decode everything the engine has written so far.
    fn sent_frames(engine: &mut ClientEngine<Vec<u8>>) -> Vec<Frame> {
        let bytes = std::mem::take(engine.transport_mut());
        FrameDecoder::new().feed(&bytes)
    }

    fn response(transaction_id: u16, function_code: u8, payload: Vec<u8>) -> Vec<u8> {
        Frame {
            transaction_id,
            protocol_id: 0,
            unit_id: 1,
            function_code,
            payload,
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_requires_connection() {
        let table = RegisterTable::new(4, 4, 4, 4).unwrap();
        let mut engine = ClientEngine::new(1, table, Vec::<u8>::new());
        assert_eq!(engine.state(), LinkState::Disconnected);
        assert!(matches!(
            engine.read_coils(0, 1),
            Err(ModbusError::Connection { .. })
        ));
        engine.mark_connecting();
        assert_eq!(engine.state(), LinkState::Connecting);
        engine.on_connect();
        assert!(engine.read_coils(0, 1).is_ok());
    }

    #[test]
    fn test_read_request_wire_format() {
        let mut engine = engine();
        let tid = engine.read_holding_registers(2, 3).unwrap();
        assert_eq!(
            engine.transport(),
            &vec![0x00, tid as u8, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x02, 0x00, 0x03]
        );
        let pending = engine.pending(tid).unwrap();
        assert_eq!(pending.function, FunctionCode::ReadHoldingRegisters);
        assert_eq!(pending.frame.payload, vec![0, 2, 0, 3]);
    }

    #[test]
    fn test_request_validation() {
        let mut engine = engine();
        assert!(matches!(
            engine.read_holding_registers(0, 0),
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert!(matches!(
            engine.read_holding_registers(0, 126),
            Err(ModbusError::InvalidArgument { .. })
        ));
        assert!(matches!(
            engine.read_coils(10, 7),
            Err(ModbusError::OutOfRange { .. })
        ));
        assert!(matches!(
            engine.write_single_register(16),
            Err(ModbusError::OutOfRange { .. })
        ));
        assert_eq!(engine.pending_count(), 0);
        assert!(engine.transport().is_empty());
    }

    #[test]
    fn test_transaction_ids_increment() {
        let mut engine = engine();
        let a = engine.read_coils(0, 1).unwrap();
        let b = engine.read_coils(0, 1).unwrap();
        let c = engine.read_coils(0, 1).unwrap();
        assert_eq!(b, a.wrapping_add(1));
        assert_eq!(c, b.wrapping_add(1));
        assert_eq!(engine.pending_count(), 3);
    }

    #[test]
    fn test_transaction_id_skips_pending() {
        let mut engine = engine();
        let first = engine.read_coils(0, 1).unwrap();
        engine.next_transaction_id = first;
        let second = engine.read_coils(0, 1).unwrap();
        assert_ne!(first, second);
        assert_eq!(second, first.wrapping_add(1));
    }

    #[test]
    fn test_transaction_id_wraps() {
        let mut engine = engine();
        engine.next_transaction_id = u16::MAX;
        assert_eq!(engine.read_coils(0, 1).unwrap(), u16::MAX);
        assert_eq!(engine.read_coils(0, 1).unwrap(), 0);
    }

    #[test]
    fn test_no_free_transaction_id() {
        let mut engine = engine();
        let template = {
            let tid = engine.read_coils(0, 1).unwrap();
            engine.pending(tid).unwrap().clone()
        };
        for id in 0..=u16::MAX {
            engine.pending.insert(id, template.clone());
        }
        assert!(matches!(
            engine.read_coils(0, 1),
            Err(ModbusError::NoFreeTransactionId)
        ));
    }

    #[test]
    fn test_read_coils_applied() {
        let mut engine = engine();
        let tid = engine.read_coils(0, 8).unwrap();
        let events = engine
            .on_bytes(&response(tid, 0x01, vec![0x01, 0b0101_0101]))
            .unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::ReadApplied {
                transaction_id: tid,
                function: FunctionCode::ReadCoils,
                start: 0,
                count: 8,
            }]
        );
        assert_eq!(
            engine.table().get_bits(BitSpace::Coils, 0, 8).unwrap(),
            vec![true, false, true, false, true, false, true, false]
        );
        assert!(!engine.is_pending(tid));
    }

    #[test]
    fn test_out_of_order_responses() {
        let mut engine = engine();
        let a = engine.read_holding_registers(0, 1).unwrap();
        let b = engine.read_input_registers(5, 2).unwrap();

        let mut bytes = response(b, 0x04, vec![0x04, 0x00, 0x0B, 0x00, 0x0C]);
        bytes.extend(response(a, 0x03, vec![0x02, 0x00, 0x0A]));
        let events = engine.on_bytes(&bytes).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].transaction_id(), b);
        assert_eq!(events[1].transaction_id(), a);
        assert!(events.iter().all(ClientEvent::is_success));
        assert_eq!(
            engine.table().get_registers(WordSpace::InputRegisters, 5, 2).unwrap(),
            vec![0x0B, 0x0C]
        );
        assert_eq!(
            engine.table().get_register(WordSpace::HoldingRegisters, 0).unwrap(),
            0x0A
        );
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_unexpected_transaction_id_ignored() {
        let mut engine = engine();
        let tid = engine.read_holding_registers(0, 1).unwrap();
        let other = tid.wrapping_add(100);
        let revision = engine.table().revision(Space::HoldingRegisters);

        let events = engine
            .on_bytes(&response(other, 0x03, vec![0x02, 0x12, 0x34]))
            .unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::UnexpectedResponse { transaction_id: other }]
        );
        assert_eq!(engine.table().revision(Space::HoldingRegisters), revision);
        assert!(engine.is_pending(tid));
    }

    #[test]
    fn test_unexpected_unit_discarded() {
        let mut engine = engine();
        let tid = engine.read_holding_registers(0, 1).unwrap();
        let bytes = Frame {
            transaction_id: tid,
            protocol_id: 0,
            unit_id: 9,
            function_code: 0x03,
            payload: vec![0x02, 0x12, 0x34],
        }
        .encode()
        .unwrap();

        let events = engine.on_bytes(&bytes).unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::UnexpectedUnit {
                transaction_id: tid,
                expected: 1,
                received: 9,
            }]
        );
        assert!(events[0].completes_request());
        assert!(!engine.is_pending(tid));
        assert_eq!(
            engine.table().get_register(WordSpace::HoldingRegisters, 0).unwrap(),
            0
        );

        // the same transaction ID is not matched a second time
        let events = engine
            .on_bytes(&response(tid, 0x03, vec![0x02, 0x12, 0x34]))
            .unwrap();
        assert_eq!(events, vec![ClientEvent::UnexpectedResponse { transaction_id: tid }]);
    }

    #[test]
    fn test_malformed_response_applies_nothing() {
        let mut engine = engine();
        let revision = engine.table().revision(Space::HoldingRegisters);

        // byte count claims 2 registers for a 3 register request
        let tid = engine.read_holding_registers(0, 3).unwrap();
        let events = engine
            .on_bytes(&response(tid, 0x03, vec![0x04, 0, 1, 0, 2]))
            .unwrap();
        assert!(matches!(events[0], ClientEvent::MalformedResponse { .. }));
        assert!(!engine.is_pending(tid));

        // wrong function code
        let tid = engine.read_holding_registers(0, 1).unwrap();
        let events = engine.on_bytes(&response(tid, 0x04, vec![0x02, 0, 1])).unwrap();
        assert!(matches!(events[0], ClientEvent::MalformedResponse { .. }));

        // too few bit bytes
        let tid = engine.read_coils(0, 9).unwrap();
        let events = engine.on_bytes(&response(tid, 0x01, vec![0x01, 0xFF])).unwrap();
        assert!(matches!(events[0], ClientEvent::MalformedResponse { .. }));

        assert_eq!(engine.table().revision(Space::HoldingRegisters), revision);
        assert_eq!(engine.table().revision(Space::Coils), 0);
        assert_eq!(engine.stats().errors, 3);
    }

    #[test]
    fn test_exception_response() {
        let mut engine = engine();
        let tid = engine.read_holding_registers(10, 2).unwrap();
        let events = engine.on_bytes(&response(tid, 0x83, vec![0x02])).unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::Exception {
                transaction_id: tid,
                function: FunctionCode::ReadHoldingRegisters,
                code: ExceptionCode::IllegalDataAddress,
            }]
        );
        assert!(!engine.is_pending(tid));
    }

    #[test]
    fn test_write_confirmed_and_mismatch() {
        let mut engine = engine();
        engine
            .table_mut()
            .set_register(WordSpace::HoldingRegisters, 4, 0x1234)
            .unwrap();

        let tid = engine.write_single_register(4).unwrap();
        let events = engine
            .on_bytes(&response(tid, 0x06, vec![0, 4, 0x12, 0x34]))
            .unwrap();
        assert!(matches!(events[0], ClientEvent::WriteConfirmed { .. }));

        let tid = engine.write_single_register(4).unwrap();
        let events = engine
            .on_bytes(&response(tid, 0x06, vec![0, 4, 0x00, 0x00]))
            .unwrap();
        assert_eq!(
            events,
            vec![ClientEvent::WriteMismatch {
                transaction_id: tid,
                function: FunctionCode::WriteSingleRegister,
                expected: vec![0, 4, 0x12, 0x34],
                received: vec![0, 4, 0, 0],
            }]
        );

        let tid = engine.write_multiple_coils(0, 10).unwrap();
        let events = engine.on_bytes(&response(tid, 0x0F, vec![0, 0, 0, 9])).unwrap();
        assert!(matches!(events[0], ClientEvent::WriteMismatch { .. }));
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_write_multiple_coils_uses_local_table() {
        let mut engine = engine();
        engine
            .table_mut()
            .set_bits(BitSpace::Coils, 2, &[true, true, false, true])
            .unwrap();
        engine.write_multiple_coils(2, 4).unwrap();
        let sent = sent_frames(&mut engine);
        assert_eq!(sent[0].function_code, 0x0F);
        assert_eq!(sent[0].payload, vec![0, 2, 0, 4, 1, 0b0000_1011]);
    }

    #[test]
    fn test_expire_stale_requests() {
        let mut engine = engine().with_timeout(Duration::from_millis(100));
        let a = engine.read_coils(0, 1).unwrap();
        let b = engine.read_coils(1, 1).unwrap();

        assert!(engine.expire(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_millis(150);
        let events = engine.expire(later);
        assert_eq!(
            events,
            vec![
                ClientEvent::RequestTimedOut { transaction_id: a },
                ClientEvent::RequestTimedOut { transaction_id: b },
            ]
        );
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.stats().timeouts, 2);

        // a late response is no longer matched
        let events = engine.on_bytes(&response(a, 0x01, vec![0x01, 0x01])).unwrap();
        assert_eq!(events, vec![ClientEvent::UnexpectedResponse { transaction_id: a }]);
    }

    #[test]
    fn test_disconnect_fails_pending() {
        let mut engine = engine();
        let a = engine.read_coils(0, 1).unwrap();
        let b = engine.read_holding_registers(0, 1).unwrap();
        engine.on_bytes(&response(a, 0x01, vec![0x01])[..5]).unwrap();

        let events = engine.on_disconnect();
        assert_eq!(
            events,
            vec![
                ClientEvent::ConnectionClosed { transaction_id: a },
                ClientEvent::ConnectionClosed { transaction_id: b },
            ]
        );
        assert_eq!(engine.state(), LinkState::Disconnected);
        assert_eq!(engine.pending_count(), 0);
        assert!(engine.read_coils(0, 1).is_err());
    }

    #[test]
    fn test_against_server_dispatcher() {
        let server_table = RegisterTable::new(16, 16, 16, 16).unwrap();
        let server = ServerDispatcher::new(1, shared(server_table));
        let mut engine = engine();

        let values: Vec<u16> = (0x30..0x3A).collect();
        engine
            .table_mut()
            .set_registers(WordSpace::HoldingRegisters, 0, &values)
            .unwrap();
        engine.write_multiple_registers(0, 10).unwrap();

        for request in sent_frames(&mut engine) {
            let reply = server.handle_request(&request).unwrap();
            let events = engine.on_bytes(&reply.encode().unwrap()).unwrap();
            assert!(events[0].is_success());
        }

        assert_eq!(
            server
                .table()
                .read()
                .unwrap()
                .get_registers(WordSpace::HoldingRegisters, 0, 10)
                .unwrap(),
            values
        );
    }
}
