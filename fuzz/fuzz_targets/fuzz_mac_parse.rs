#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(mac) = text.parse::<nanlink::MacAddr>() {
            let again: nanlink::MacAddr = mac.to_string().parse().expect("display round-trips");
            assert_eq!(mac, again);
        }
    }
});
