#![no_main]

use libfuzzer_sys::fuzz_target;
use tabsync::protocol::{decode_frame, HostMessage};

fuzz_target!(|data: &[u8]| {
    // Raw-byte path, including serde_json's own UTF-8 handling.
    let _ = serde_json::from_slice::<HostMessage>(data);

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = decode_frame::<HostMessage>(text);
    }
});
