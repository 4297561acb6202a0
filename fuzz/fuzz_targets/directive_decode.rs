//! Fuzz target for ControlDirective::from_bytes
//!
//! Arbitrary bytes must parse to Ok or Err without panicking, and a parsed
//! directive must serialize back to its leading 21 bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tidegate_proto::ControlDirective;

fuzz_target!(|data: &[u8]| {
    if let Ok(directive) = ControlDirective::from_bytes(data) {
        let _ = directive.reason();
        let _ = directive.action();
        let _ = directive.flags();

        let bytes = directive.to_bytes();
        assert_eq!(&bytes[..], &data[..ControlDirective::SIZE]);
    }
});
