#![no_main]

use libfuzzer_sys::fuzz_target;
use modbus_node::table::shared;
use modbus_node::{FrameDecoder, RegisterTable, ServerDispatcher};

fuzz_target!(|data: &[u8]| {
    let Ok(table) = RegisterTable::new(64, 64, 64, 64) else {
        return;
    };
    let dispatcher = ServerDispatcher::new(1, shared(table));

    for request in FrameDecoder::new().feed(data) {
        if let Some(response) = dispatcher.handle_request(&request) {
            assert_eq!(response.transaction_id, request.transaction_id);
            assert!(response.encode().is_ok());
        }
    }
});
