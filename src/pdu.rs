//! Modbus PDU construction and parsing
//!
//! A PDU is a function code plus its payload. [`PduBuilder`] assembles
//! payloads field by field with all 16-bit values written big-endian;
//! [`PduReader`] walks a received payload the same way.

use tracing::debug;

use crate::bits::pack_bits;
use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ExceptionCode, FunctionCode};

/// Function code and payload of one request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusPdu {
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl ModbusPdu {
    pub fn new(function_code: u8, payload: Vec<u8>) -> Self {
        Self {
            function_code,
            payload,
        }
    }

    /// Total PDU length on the wire (function code + payload)
    #[inline]
    pub fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        if self.is_exception() {
            self.payload.first().map(|&code| ExceptionCode::from_u8(code))
        } else {
            None
        }
    }
}

/// Get human-readable function code description, exception flag ignored
pub fn function_code_description(fc: u8) -> &'static str {
    FunctionCode::from_u8(fc & !EXCEPTION_FLAG)
        .map(FunctionCode::description)
        .unwrap_or("Unknown Function")
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl PduBuilder {
    /// Start a PDU with the given function code
    #[inline]
    pub fn new(fc: u8) -> Self {
        Self {
            pdu: ModbusPdu::new(fc, Vec::new()),
        }
    }

    fn ensure_room(&self, extra: usize) -> ModbusResult<()> {
        if self.pdu.wire_len() + extra > MAX_PDU_SIZE {
            return Err(ModbusError::invalid_argument(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.pdu.wire_len(),
                extra,
                MAX_PDU_SIZE
            )));
        }
        Ok(())
    }

    /// Add a byte
    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.ensure_room(1)?;
        self.pdu.payload.push(b);
        Ok(self)
    }

    /// Add a 16-bit value, big-endian
    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.ensure_room(2)?;
        self.pdu.payload.extend_from_slice(&value.to_be_bytes());
        Ok(self)
    }

    /// Add address
    #[inline]
    pub fn address(self, addr: u16) -> ModbusResult<Self> {
        self.word(addr)
    }

    /// Add quantity
    #[inline]
    pub fn quantity(self, qty: u16) -> ModbusResult<Self> {
        self.word(qty)
    }

    /// Add data
    #[inline]
    pub fn data(mut self, data: &[u8]) -> ModbusResult<Self> {
        self.ensure_room(data.len())?;
        self.pdu.payload.extend_from_slice(data);
        Ok(self)
    }

    /// Build the PDU
    #[inline]
    pub fn build(self) -> ModbusPdu {
        debug!(
            "PDU built: FC={:02X} ({}), total_len={}",
            self.pdu.function_code,
            function_code_description(self.pdu.function_code),
            self.pdu.wire_len()
        );
        self.pdu
    }

    // ===== Requests =====

    /// Build a read request PDU for FC01-04
    pub fn build_read_request(
        function: FunctionCode,
        start_address: u16,
        quantity: u16,
    ) -> ModbusResult<ModbusPdu> {
        if !function.is_read() {
            return Err(ModbusError::invalid_function(function.to_u8()));
        }
        Ok(PduBuilder::new(function.to_u8())
            .address(start_address)?
            .quantity(quantity)?
            .build())
    }

    /// Build a write single coil PDU (FC05)
    pub fn build_write_single_coil(address: u16, value: bool) -> ModbusResult<ModbusPdu> {
        let coil_value = if value { COIL_ON } else { COIL_OFF };
        Ok(PduBuilder::new(FC_WRITE_SINGLE_COIL)
            .address(address)?
            .word(coil_value)?
            .build())
    }

    /// Build a write single register PDU (FC06)
    pub fn build_write_single_register(address: u16, value: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new(FC_WRITE_SINGLE_REGISTER)
            .address(address)?
            .word(value)?
            .build())
    }

    /// Build a write multiple coils PDU (FC15)
    pub fn build_write_multiple_coils(address: u16, values: &[bool]) -> ModbusResult<ModbusPdu> {
        let coil_bytes = pack_bits(values);
        Ok(PduBuilder::new(FC_WRITE_MULTIPLE_COILS)
            .address(address)?
            .quantity(values.len() as u16)?
            .byte(coil_bytes.len() as u8)?
            .data(&coil_bytes)?
            .build())
    }

    /// Build a write multiple registers PDU (FC16)
    pub fn build_write_multiple_registers(address: u16, values: &[u16]) -> ModbusResult<ModbusPdu> {
        let mut builder = PduBuilder::new(FC_WRITE_MULTIPLE_REGISTERS)
            .address(address)?
            .quantity(values.len() as u16)?
            .byte((values.len() * 2) as u8)?;
        for &value in values {
            builder = builder.word(value)?;
        }
        Ok(builder.build())
    }

    // ===== Responses =====

    /// Build a FC01/FC02 response: byte count + packed bits
    pub fn build_read_bits_response(fc: u8, values: &[bool]) -> ModbusResult<ModbusPdu> {
        let packed = pack_bits(values);
        Ok(PduBuilder::new(fc)
            .byte(packed.len() as u8)?
            .data(&packed)?
            .build())
    }

    /// Build a FC03/FC04 response: byte count + big-endian registers
    pub fn build_read_registers_response(fc: u8, values: &[u16]) -> ModbusResult<ModbusPdu> {
        let mut builder = PduBuilder::new(fc).byte((values.len() * 2) as u8)?;
        for &value in values {
            builder = builder.word(value)?;
        }
        Ok(builder.build())
    }

    /// Build a FC15/FC16 response: address + quantity
    pub fn build_write_multiple_response(fc: u8, address: u16, quantity: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new(fc).address(address)?.quantity(quantity)?.build())
    }

    /// Build an exception response for the given request function code
    pub fn build_exception(fc: u8, code: ExceptionCode) -> ModbusPdu {
        ModbusPdu::new(fc | EXCEPTION_FLAG, vec![code.to_u8()])
    }
}

/// Cursor over a received payload reading big-endian fields.
///
/// Every read checks the remaining length first and fails with
/// `InvalidData` instead of panicking.
#[derive(Debug)]
pub struct PduReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PduReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn u8(&mut self) -> ModbusResult<u8> {
        let bytes = self.bytes(1)?;
        Ok(bytes[0])
    }

    pub fn u16(&mut self) -> ModbusResult<u16> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn bytes(&mut self, count: usize) -> ModbusResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(ModbusError::invalid_data(format!(
                "payload too short: need {} more bytes at offset {}, have {}",
                count,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    /// Read a byte count followed by that many bytes.
    pub fn counted_bytes(&mut self) -> ModbusResult<&'a [u8]> {
        let count = self.u8()? as usize;
        self.bytes(count)
    }

    /// Read `count` big-endian registers
    pub fn registers(&mut self, count: usize) -> ModbusResult<Vec<u16>> {
        let bytes = self.bytes(count * 2)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Fail if unread bytes remain
    pub fn finish(&self) -> ModbusResult<()> {
        if self.remaining() != 0 {
            return Err(ModbusError::invalid_data(format!(
                "{} trailing bytes in payload",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_builder() {
        let pdu = PduBuilder::new(0x03)
            .address(0x0100)
            .unwrap()
            .quantity(0x000A)
            .unwrap()
            .build();

        assert_eq!(pdu.wire_len(), 5);
        assert_eq!(pdu.function_code, 0x03);
        assert_eq!(pdu.payload, vec![0x01, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn test_builder_size_limit() {
        let big = vec![0u8; MAX_PDU_SIZE - 1];
        let builder = PduBuilder::new(0x10).data(&big).unwrap();
        assert!(builder.byte(0).is_err());
    }

    #[test]
    fn test_exception_response() {
        let pdu = PduBuilder::build_exception(0x03, ExceptionCode::IllegalDataAddress);
        assert_eq!(pdu.function_code, 0x83);
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_build_read_request() {
        let pdu = PduBuilder::build_read_request(FunctionCode::ReadHoldingRegisters, 0x006B, 3).unwrap();
        assert_eq!(pdu.function_code, 0x03);
        assert_eq!(pdu.payload, vec![0x00, 0x6B, 0x00, 0x03]);
        assert!(PduBuilder::build_read_request(FunctionCode::WriteSingleCoil, 0, 1).is_err());
    }

    #[test]
    fn test_build_write_single_coil() {
        let pdu = PduBuilder::build_write_single_coil(0x00AC, true).unwrap();
        assert_eq!(pdu.function_code, 0x05);
        assert_eq!(pdu.payload, vec![0x00, 0xAC, 0xFF, 0x00]);
    }

    #[test]
    fn test_build_write_multiple_coils() {
        let values = [true, false, true, true, false, false, true, true, true, false];
        let pdu = PduBuilder::build_write_multiple_coils(0x0013, &values).unwrap();
        assert_eq!(pdu.function_code, 0x0F);
        assert_eq!(pdu.payload, vec![0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]);
    }

    #[test]
    fn test_build_write_multiple_registers() {
        let pdu = PduBuilder::build_write_multiple_registers(0x0001, &[0x000A, 0x0102]).unwrap();
        assert_eq!(pdu.function_code, 0x10);
        assert_eq!(
            pdu.payload,
            vec![0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_read_responses() {
        let pdu = PduBuilder::build_read_bits_response(0x01, &[true; 9]).unwrap();
        assert_eq!(pdu.payload, vec![0x02, 0xFF, 0x01]);

        let pdu = PduBuilder::build_read_registers_response(0x04, &[0x1234, 0x0001]).unwrap();
        assert_eq!(pdu.payload, vec![0x04, 0x12, 0x34, 0x00, 0x01]);
    }

    #[test]
    fn test_reader() {
        let payload = [0x00, 0x05, 0x04, 0x12, 0x34, 0xAB, 0xCD];
        let mut reader = PduReader::new(&payload);
        assert_eq!(reader.u16().unwrap(), 5);
        let bytes = reader.counted_bytes().unwrap();
        assert_eq!(bytes, &[0x12, 0x34, 0xAB, 0xCD]);
        reader.finish().unwrap();
        assert!(reader.u8().is_err());
    }

    #[test]
    fn test_reader_registers_and_trailing() {
        let payload = [0x12, 0x34, 0x56, 0x78, 0x00];
        let mut reader = PduReader::new(&payload);
        assert_eq!(reader.registers(2).unwrap(), vec![0x1234, 0x5678]);
        assert!(reader.finish().is_err());
        assert!(reader.registers(1).is_err());
    }

    #[test]
    fn test_function_code_description() {
        assert_eq!(function_code_description(0x10), "Write Multiple Registers");
        assert_eq!(function_code_description(0x83), "Read Holding Registers");
        assert_eq!(function_code_description(0x2B), "Unknown Function");
    }
}
