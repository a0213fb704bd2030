//! Fuzz target for origin admission
//!
//! Admission parses attacker-controlled `Origin` and `Referer` headers. Any
//! input must produce a decision, never a panic, and the wildcard must admit
//! everything.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use switchboard_core::Handshake;
use switchboard_server::OriginPolicy;

#[derive(Arbitrary, Debug)]
struct Input {
    patterns: String,
    origin: Option<String>,
    referer: Option<String>,
}

fuzz_target!(|input: Input| {
    let mut handshake = Handshake::new("/socket.io/");
    if let Some(origin) = input.origin {
        handshake = handshake.with_header("origin", origin);
    }
    if let Some(referer) = input.referer {
        handshake = handshake.with_header("referer", referer);
    }

    let _ = OriginPolicy::parse(&input.patterns).check_request(&handshake);
    assert!(OriginPolicy::Wildcard.check_request(&handshake));
});
