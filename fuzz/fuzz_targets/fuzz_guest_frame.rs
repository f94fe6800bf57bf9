#![no_main]

use libfuzzer_sys::fuzz_target;
use tabsync::protocol::{decode_frame, encode, Frame, GuestMessage};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    // Whatever a guest sends, the host must classify it without panicking.
    if let Ok(Frame::Message(message)) = decode_frame::<GuestMessage>(text) {
        // Anything accepted must survive re-encoding and still be accepted.
        let again = encode(&message).expect("accepted intent must encode");
        assert!(decode_frame::<GuestMessage>(&again).is_ok());
    }
});
