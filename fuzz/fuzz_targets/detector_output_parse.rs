//! Fuzz target for parsing the JSON printed by a command detector.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tilefuse::detect::parse_command_output;

fuzz_target!(|data: &[u8]| {
    if data.len() > 10 * 1024 * 1024 {
        return;
    }

    let _ = parse_command_output(data);
});
