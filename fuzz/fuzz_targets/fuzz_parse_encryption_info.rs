#![no_main]

use formula_agile_crypto::parse_encryption_info;
use libfuzzer_sys::fuzz_target;

/// Real descriptors are a few KiB; keep the harness bounded.
const MAX_INPUT_BYTES: usize = 256 * 1024;

fuzz_target!(|data: &[u8]| {
    let data = &data[..data.len().min(MAX_INPUT_BYTES)];

    // Raw bytes, then the same bytes behind a valid Agile version header so the XML parser sees
    // most inputs.
    let _ = parse_encryption_info(data);

    let mut with_header = Vec::with_capacity(8 + data.len());
    with_header.extend_from_slice(&[4, 0, 4, 0, 0x40, 0, 0, 0]);
    with_header.extend_from_slice(data);
    let _ = parse_encryption_info(&with_header);
});
