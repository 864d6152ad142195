#![no_main]

use libfuzzer_sys::fuzz_target;
use modbus_node::{ClientEngine, ConnectionHandler, RegisterTable};

fuzz_target!(|data: &[u8]| {
    let Ok(table) = RegisterTable::new(32, 32, 32, 32) else {
        return;
    };
    let mut engine = ClientEngine::new(1, table, Vec::<u8>::new());
    engine.on_connect();

    for start in 0..4u16 {
        let _ = engine.read_coils(start, 8);
        let _ = engine.read_holding_registers(start, 4);
    }

    let before = engine.pending_count();
    let events = engine.on_bytes(data).unwrap_or_default();
    assert!(engine.pending_count() <= before);
    assert!(events.len() >= before - engine.pending_count());
});
