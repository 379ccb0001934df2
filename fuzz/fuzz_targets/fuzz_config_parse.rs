#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(cfg) = nanlink::Config::from_toml_str(text) {
            assert!(cfg.timeouts.command_ms > 0);
            assert!(cfg.limits.max_pending_commands > 0);
        }
    }
});
