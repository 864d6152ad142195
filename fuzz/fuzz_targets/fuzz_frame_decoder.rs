#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use modbus_node::FrameDecoder;

#[derive(Debug, Arbitrary)]
struct Input {
    data: Vec<u8>,
    cuts: Vec<u8>,
}

// Chunking must never change which frames come out.
fuzz_target!(|input: Input| {
    let whole = FrameDecoder::new().feed(&input.data);

    let mut decoder = FrameDecoder::new();
    let mut pieces = Vec::new();
    let mut rest = input.data.as_slice();
    for cut in input.cuts {
        let at = (cut as usize).min(rest.len());
        let (head, tail) = rest.split_at(at);
        pieces.extend(decoder.feed(head));
        rest = tail;
    }
    pieces.extend(decoder.feed(rest));

    assert_eq!(whole, pieces);
});
