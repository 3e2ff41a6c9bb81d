#![no_main]

//! Fuzz harness for single-line record decoding.
//!
//! Any line that decodes must re-encode and decode to the same record.

use libfuzzer_sys::fuzz_target;
use vehicle_store::codec;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let _ = codec::decode_key(line);
    let Ok((key, record)) = codec::decode(line) else {
        return;
    };
    let encoded = codec::encode(&key, &record).expect("decoded record must encode");
    let (again_key, again) = codec::decode(&encoded).expect("encoded record must decode");
    assert_eq!(again_key, key);
    assert_eq!(again, record);
});
