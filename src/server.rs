//! Modbus server (slave) side
//!
//! [`ServerDispatcher`] applies one decoded request to the shared
//! [`RegisterTable`](crate::table::RegisterTable) and builds the response.
//! [`ServerSession`] is the per-connection wrapper that owns reassembly
//! state and writes responses to its transport.
//!
//! | Code | Request payload | Response payload |
//! |------|-----------------|------------------|
//! | 0x01/0x02 | start, count | byteCount + packed bits |
//! | 0x03/0x04 | start, count | byteCount + registers |
//! | 0x05/0x06 | address, value | echo |
//! | 0x0F | address, count, byteCount, packed bits | address + count |
//! | 0x10 | address, count, byteCount, registers | address + count |
//!
//! Failures become exception responses (`functionCode | 0x80`) and never
//! close the connection.

use tracing::{debug, info, warn};

use crate::bits::{packed_len, unpack_bits};
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{Frame, FrameDecoder};
use crate::pdu::{function_code_description, ModbusPdu, PduBuilder, PduReader};
use crate::protocol::FunctionCode;
use crate::table::{BitSpace, RegisterTable, SharedTable, WordSpace};
use crate::transport::{ConnectionHandler, Transport};

/// Applies requests addressed to one unit ID against a shared table.
#[derive(Debug, Clone)]
pub struct ServerDispatcher {
    unit_id: u8,
    table: SharedTable,
}

impl ServerDispatcher {
    pub fn new(unit_id: u8, table: SharedTable) -> Self {
        Self { unit_id, table }
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn table(&self) -> &SharedTable {
        &self.table
    }

    /// Handle one request frame.
    ///
    /// Returns `None` when the frame is addressed to another unit, otherwise
    /// the response (normal or exception) carrying the request's
    /// transaction and protocol IDs.
    pub fn handle_request(&self, frame: &Frame) -> Option<Frame> {
        if frame.unit_id != self.unit_id {
            debug!(
                "Ignoring request trans_id={:04X} for unit {} (serving unit {})",
                frame.transaction_id, frame.unit_id, self.unit_id
            );
            return None;
        }

        let pdu = match self.execute(frame.function_code, &frame.payload) {
            Ok(pdu) => pdu,
            Err(e) => {
                let code = e.to_exception_code();
                warn!(
                    "Request trans_id={:04X} FC={:02X} ({}) rejected: {} -> {}",
                    frame.transaction_id,
                    frame.function_code,
                    function_code_description(frame.function_code),
                    e,
                    code
                );
                PduBuilder::build_exception(frame.function_code, code)
            }
        };

        Some(frame.reply(pdu))
    }

    fn execute(&self, fc: u8, payload: &[u8]) -> ModbusResult<ModbusPdu> {
        let function = FunctionCode::from_u8(fc)?;
        let mut reader = PduReader::new(payload);

        match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                let space = if function == FunctionCode::ReadCoils {
                    BitSpace::Coils
                } else {
                    BitSpace::DiscreteInputs
                };
                let (start, count) = read_range(&mut reader, MAX_READ_COILS)?;
                let values = self.with_table(|table| table.get_bits(space, start, count))?;
                PduBuilder::build_read_bits_response(fc, &values)
            }

            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                let space = if function == FunctionCode::ReadHoldingRegisters {
                    WordSpace::HoldingRegisters
                } else {
                    WordSpace::InputRegisters
                };
                let (start, count) = read_range(&mut reader, MAX_READ_REGISTERS)?;
                let values = self.with_table(|table| table.get_registers(space, start, count))?;
                PduBuilder::build_read_registers_response(fc, &values)
            }

            FunctionCode::WriteSingleCoil => {
                let address = reader.u16()? as usize;
                let value = match reader.u16()? {
                    COIL_ON => true,
                    COIL_OFF => false,
                    other => {
                        return Err(ModbusError::invalid_data(format!(
                            "coil value 0x{:04X} is neither 0xFF00 nor 0x0000",
                            other
                        )))
                    }
                };
                reader.finish()?;
                self.with_table_mut(|table| table.set_bit(BitSpace::Coils, address, value))?;
                Ok(ModbusPdu::new(fc, payload.to_vec()))
            }

            FunctionCode::WriteSingleRegister => {
                let address = reader.u16()? as usize;
                let value = reader.u16()?;
                reader.finish()?;
                self.with_table_mut(|table| {
                    table.set_register(WordSpace::HoldingRegisters, address, value)
                })?;
                Ok(ModbusPdu::new(fc, payload.to_vec()))
            }

            FunctionCode::WriteMultipleCoils => {
                let address = reader.u16()?;
                let quantity = reader.u16()?;
                check_quantity(quantity as usize, MAX_WRITE_COILS)?;
                let packed = reader.counted_bytes()?;
                reader.finish()?;
                if packed.len() != packed_len(quantity as usize) {
                    return Err(ModbusError::invalid_data(format!(
                        "byte count {} does not match {} coils",
                        packed.len(),
                        quantity
                    )));
                }
                let values = unpack_bits(packed, quantity as usize);
                self.with_table_mut(|table| table.set_bits(BitSpace::Coils, address as usize, &values))?;
                PduBuilder::build_write_multiple_response(fc, address, quantity)
            }

            FunctionCode::WriteMultipleRegisters => {
                let address = reader.u16()?;
                let quantity = reader.u16()?;
                check_quantity(quantity as usize, MAX_WRITE_REGISTERS)?;
                let byte_count = reader.u8()? as usize;
                if byte_count != quantity as usize * 2 {
                    return Err(ModbusError::invalid_data(format!(
                        "byte count {} does not match {} registers",
                        byte_count, quantity
                    )));
                }
                let values = reader.registers(quantity as usize)?;
                reader.finish()?;
                self.with_table_mut(|table| {
                    table.set_registers(WordSpace::HoldingRegisters, address as usize, &values)
                })?;
                PduBuilder::build_write_multiple_response(fc, address, quantity)
            }
        }
    }

    fn with_table<R>(&self, f: impl FnOnce(&RegisterTable) -> ModbusResult<R>) -> ModbusResult<R> {
        let table = self
            .table
            .read()
            .map_err(|_| ModbusError::internal("register table lock poisoned"))?;
        f(&table)
    }

    fn with_table_mut<R>(
        &self,
        f: impl FnOnce(&mut RegisterTable) -> ModbusResult<R>,
    ) -> ModbusResult<R> {
        let mut table = self
            .table
            .write()
            .map_err(|_| ModbusError::internal("register table lock poisoned"))?;
        f(&mut table)
    }
}

/// Parse `start, count` of a read request and check the protocol limit.
fn read_range(reader: &mut PduReader<'_>, max: usize) -> ModbusResult<(usize, usize)> {
    let start = reader.u16()? as usize;
    let count = reader.u16()? as usize;
    reader.finish()?;
    check_quantity(count, max)?;
    Ok((start, count))
}

fn check_quantity(count: usize, max: usize) -> ModbusResult<()> {
    if count == 0 || count > max {
        return Err(ModbusError::invalid_data(format!(
            "quantity {} outside 1..={}",
            count, max
        )));
    }
    Ok(())
}

/// State of one accepted connection: its reassembly buffer and its
/// outgoing transport. All sessions of a server share one dispatcher table.
#[derive(Debug)]
pub struct ServerSession<T> {
    dispatcher: ServerDispatcher,
    decoder: FrameDecoder,
    transport: T,
    peer: String,
    requests_handled: u64,
}

impl<T: Transport> ServerSession<T> {
    pub fn new(dispatcher: ServerDispatcher, transport: T, peer: impl Into<String>) -> Self {
        Self {
            dispatcher,
            decoder: FrameDecoder::new(),
            transport,
            peer: peer.into(),
            requests_handled: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests_handled
    }
}

impl<T: Transport> ConnectionHandler for ServerSession<T> {
    /// Responses written for the delivered bytes
    type Output = Vec<Frame>;

    fn on_connect(&mut self) {
        info!("Modbus client connected: {}", self.peer);
    }

    fn on_bytes(&mut self, chunk: &[u8]) -> ModbusResult<Vec<Frame>> {
        let mut responses = Vec::new();
        for request in self.decoder.feed(chunk) {
            self.requests_handled += 1;
            if let Some(response) = self.dispatcher.handle_request(&request) {
                self.transport.write(&response.encode()?)?;
                responses.push(response);
            }
        }
        Ok(responses)
    }

    fn on_disconnect(&mut self) -> Vec<Frame> {
        if !self.decoder.is_idle() {
            debug!(
                "Discarding {} buffered bytes from {}",
                self.decoder.buffered(),
                self.peer
            );
        }
        self.decoder.reset();
        info!(
            "Modbus client disconnected: {} ({} requests)",
            self.peer, self.requests_handled
        );
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::pack_bits;
    use crate::table::{shared, Space};

    fn dispatcher() -> ServerDispatcher {
        let table = RegisterTable::new(10, 10, 10, 10).unwrap();
        ServerDispatcher::new(1, shared(table))
    }

    fn request(fc: u8, payload: Vec<u8>) -> Frame {
        Frame {
            transaction_id: 0x0A0B,
            protocol_id: 0,
            unit_id: 1,
            function_code: fc,
            payload,
        }
    }

    #[test]
    fn test_wrong_unit_ignored() {
        let d = dispatcher();
        let mut frame = request(0x01, vec![0, 0, 0, 1]);
        frame.unit_id = 2;
        assert!(d.handle_request(&frame).is_none());
    }

    #[test]
    fn test_read_coils_pattern() {
        let d = dispatcher();
        d.table()
            .write()
            .unwrap()
            .set_bits(BitSpace::Coils, 0, &[true, false, true, false, true, false, true, false])
            .unwrap();

        let response = d.handle_request(&request(0x01, vec![0, 0, 0, 8])).unwrap();
        assert_eq!(response.transaction_id, 0x0A0B);
        assert_eq!(response.function_code, 0x01);
        assert_eq!(response.payload, vec![0x01, 0b0101_0101]);
        assert_eq!(response.length(), 4);
    }

    #[test]
    fn test_read_coils_byte_count() {
        let d = dispatcher();
        d.table().write().unwrap().set_bits(BitSpace::Coils, 0, &[true; 10]).unwrap();
        let response = d.handle_request(&request(0x01, vec![0, 0, 0, 10])).unwrap();
        assert_eq!(response.payload, vec![0x02, 0xFF, 0x03]);
    }

    #[test]
    fn test_read_discrete_inputs() {
        let d = dispatcher();
        d.table()
            .write()
            .unwrap()
            .set_bit(BitSpace::DiscreteInputs, 3, true)
            .unwrap();
        let response = d.handle_request(&request(0x02, vec![0, 2, 0, 3])).unwrap();
        assert_eq!(response.payload, vec![0x01, 0b0000_0010]);
    }

    #[test]
    fn test_read_registers() {
        let d = dispatcher();
        d.table()
            .write()
            .unwrap()
            .set_registers(WordSpace::InputRegisters, 4, &[0x1234, 0xABCD])
            .unwrap();
        let response = d.handle_request(&request(0x04, vec![0, 4, 0, 2])).unwrap();
        assert_eq!(response.payload, vec![0x04, 0x12, 0x34, 0xAB, 0xCD]);
    }

    #[test]
    fn test_write_single_register_then_read() {
        let d = dispatcher();
        let response = d.handle_request(&request(0x06, vec![0, 5, 0x12, 0x34])).unwrap();
        assert_eq!(response.payload, vec![0, 5, 0x12, 0x34]);

        let response = d.handle_request(&request(0x03, vec![0, 5, 0, 1])).unwrap();
        assert_eq!(response.payload, vec![0x02, 0x12, 0x34]);
    }

    #[test]
    fn test_write_single_coil() {
        let d = dispatcher();
        let response = d.handle_request(&request(0x05, vec![0, 7, 0xFF, 0x00])).unwrap();
        assert_eq!(response.payload, vec![0, 7, 0xFF, 0x00]);
        assert!(d.table().read().unwrap().get_bit(BitSpace::Coils, 7).unwrap());

        d.handle_request(&request(0x05, vec![0, 7, 0x00, 0x00])).unwrap();
        assert!(!d.table().read().unwrap().get_bit(BitSpace::Coils, 7).unwrap());

        let response = d.handle_request(&request(0x05, vec![0, 7, 0x12, 0x34])).unwrap();
        assert_eq!(response.function_code, 0x85);
        assert_eq!(response.payload, vec![EXCEPTION_ILLEGAL_DATA_VALUE]);
    }

    #[test]
    fn test_write_multiple_coils() {
        let d = dispatcher();
        let values = [true, true, false, true, false, false, false, false, true];
        let mut payload = vec![0, 1, 0, 9, 2];
        payload.extend(pack_bits(&values));

        let response = d.handle_request(&request(0x0F, payload)).unwrap();
        assert_eq!(response.payload, vec![0, 1, 0, 9]);
        assert_eq!(
            d.table().read().unwrap().get_bits(BitSpace::Coils, 1, 9).unwrap(),
            values.to_vec()
        );
    }

    #[test]
    fn test_write_multiple_registers() {
        let d = dispatcher();
        let mut payload = vec![0, 0, 0, 10, 20];
        for v in 0x30u16..=0x39 {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        let response = d.handle_request(&request(0x10, payload)).unwrap();
        assert_eq!(response.payload, vec![0, 0, 0, 10]);
        assert_eq!(
            d.table()
                .read()
                .unwrap()
                .get_registers(WordSpace::HoldingRegisters, 0, 10)
                .unwrap(),
            (0x30u16..=0x39).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_out_of_range_is_illegal_data_address() {
        let d = dispatcher();
        let response = d.handle_request(&request(0x03, vec![0, 8, 0, 3])).unwrap();
        assert_eq!(response.function_code, 0x83);
        assert_eq!(response.payload, vec![EXCEPTION_ILLEGAL_DATA_ADDRESS]);
        assert_eq!(response.transaction_id, 0x0A0B);
    }

    #[test]
    fn test_rejected_write_leaves_table_unchanged() {
        let d = dispatcher();
        let revision = d.table().read().unwrap().revision(Space::HoldingRegisters);
        let mut payload = vec![0, 9, 0, 2, 4];
        payload.extend_from_slice(&[0, 1, 0, 2]);
        let response = d.handle_request(&request(0x10, payload)).unwrap();
        assert_eq!(response.function_code, 0x90);
        assert_eq!(response.payload, vec![EXCEPTION_ILLEGAL_DATA_ADDRESS]);

        let table = d.table().read().unwrap();
        assert_eq!(table.revision(Space::HoldingRegisters), revision);
        assert_eq!(
            table.get_registers(WordSpace::HoldingRegisters, 0, 10).unwrap(),
            vec![0; 10]
        );
    }

    #[test]
    fn test_unknown_function_is_illegal_function() {
        let d = dispatcher();
        let response = d.handle_request(&request(0x2B, vec![0x0E, 0x01])).unwrap();
        assert_eq!(response.function_code, 0xAB);
        assert_eq!(response.payload, vec![EXCEPTION_ILLEGAL_FUNCTION]);
    }

    #[test]
    fn test_malformed_payload_is_illegal_data_value() {
        let d = dispatcher();
        for (fc, payload) in [
            (0x01u8, vec![0, 0, 0]),
            (0x03, vec![0, 0, 0, 1, 0xFF]),
            (0x03, vec![0, 0, 0, 0]),
            (0x01, vec![0x07, 0xD0, 0x07, 0xD1]),
            (0x06, vec![0, 1]),
            (0x0F, vec![0, 0, 0, 9, 1, 0xFF]),
            (0x10, vec![0, 0, 0, 2, 3, 0, 1, 0]),
        ] {
            let response = d.handle_request(&request(fc, payload)).unwrap();
            assert_eq!(response.function_code, fc | 0x80);
            assert_eq!(response.payload, vec![EXCEPTION_ILLEGAL_DATA_VALUE], "fc {:02X}", fc);
        }
    }

    #[test]
    fn test_session_handles_split_requests() {
        let mut session = ServerSession::new(dispatcher(), Vec::<u8>::new(), "test");
        session.on_connect();

        let mut stream = request(0x06, vec![0, 1, 0, 7]).encode().unwrap();
        stream.extend(request(0x03, vec![0, 1, 0, 1]).encode().unwrap());

        let first = session.on_bytes(&stream[..9]).unwrap();
        assert!(first.is_empty());
        let responses = session.on_bytes(&stream[9..]).unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].payload, vec![0x02, 0x00, 0x07]);

        let mut expected = responses[0].encode().unwrap();
        expected.extend(responses[1].encode().unwrap());
        assert_eq!(session.transport(), &expected);
        assert_eq!(session.requests_handled(), 2);

        session.on_bytes(&stream[..3]).unwrap();
        assert!(session.on_disconnect().is_empty());
    }
}
