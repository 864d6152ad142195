//! In-Memory Loopback Example
//!
//! Connects a client engine to a server session without any sockets.
//! Both sides write into `Vec<u8>` outboxes; the bytes are delivered to the
//! other side in deliberately awkward chunks to show stream reassembly.
//!
//! # Running this example
//!
//! ```bash
//! cargo run --example loopback
//! ```

use modbus_node::table::shared;
use modbus_node::{
    ClientEngine, ClientEvent, ConnectionHandler, ModbusError, ModbusResult, RegisterTable,
    ServerDispatcher, ServerSession, WordSpace,
};

fn main() -> ModbusResult<()> {
    let server_table = shared(RegisterTable::new(16, 16, 16, 16)?);
    let dispatcher = ServerDispatcher::new(1, server_table.clone());
    let mut session = ServerSession::new(dispatcher, Vec::<u8>::new(), "loopback");
    session.on_connect();

    let mut client = ClientEngine::new(1, RegisterTable::new(16, 16, 16, 16)?, Vec::<u8>::new());
    client.on_connect();

    // =========================================================================
    // Write 0x30..0x39 into the local table, then push it to the server
    // =========================================================================
    let values: Vec<u16> = (0x30..=0x39).collect();
    client
        .table_mut()
        .set_registers(WordSpace::HoldingRegisters, 0, &values)?;
    let write_tid = client.write_multiple_registers(0, 10)?;
    let read_tid = client.read_input_registers(0, 4)?;
    println!("Queued transactions {:04X} and {:04X}", write_tid, read_tid);

    // Deliver the requests three bytes at a time
    let requests = std::mem::take(client.transport_mut());
    for chunk in requests.chunks(3) {
        session.on_bytes(chunk)?;
    }

    // Deliver the responses in one piece
    let responses = std::mem::take(session.transport_mut());
    for event in client.on_bytes(&responses)? {
        match event {
            ClientEvent::WriteConfirmed { transaction_id, count, .. } => {
                println!("{:04X}: server confirmed {} registers", transaction_id, count)
            }
            ClientEvent::ReadApplied { transaction_id, .. } => {
                println!("{:04X}: input registers mirrored locally", transaction_id)
            }
            other => println!("{:?}", other),
        }
    }

    let stored = server_table
        .read()
        .map_err(|_| ModbusError::internal("register table lock poisoned"))?
        .get_registers(WordSpace::HoldingRegisters, 0, 10)?;
    println!("Server holding registers 0-9: {:02X?}", stored);

    session.on_disconnect();
    let abandoned = client.on_disconnect();
    println!("{} requests still pending at disconnect", abandoned.len());
    Ok(())
}
