//! Exclusive pair over UDP: mutual connect, one peering per side.

use std::time::Duration;

use vtx::{DriverConfig, Pattern, Vtx, VtxError, udp};

fn quick_config() -> DriverConfig {
    DriverConfig {
        ohai_ivl_ms: 200,
        ..DriverConfig::default()
    }
}

#[test]
fn pair_pair_mutual_connect() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut vtx = Vtx::new();
    vtx.register("udp", udp::driver(quick_config())).unwrap();

    let mut alice = vtx.socket(Pattern::Pair).unwrap();
    vtx.bind(&mut alice, "udp://*:32110").unwrap();
    vtx.connect(&mut alice, "udp://127.0.0.1:32111").unwrap();

    let mut bob = vtx.socket(Pattern::Pair).unwrap();
    vtx.bind(&mut bob, "udp://*:32111").unwrap();
    vtx.connect(&mut bob, "udp://127.0.0.1:32110").unwrap();

    // Both courtships settle onto one peering per side
    std::thread::sleep(Duration::from_millis(600));

    alice.send_bytes(b"ping".to_vec()).unwrap();
    let at_bob = bob.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(at_bob[0].data, b"ping");

    bob.send_bytes(b"pong".to_vec()).unwrap();
    let at_alice = alice.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(at_alice[0].data, b"pong");

    // A pair is exclusive: a connect to anywhere else is refused
    assert!(matches!(
        vtx.connect(&mut alice, "udp://127.0.0.1:32112"),
        Err(VtxError::TooManyPeerings(1))
    ));
    assert!(matches!(
        vtx.connect(&mut bob, "udp://127.0.0.1:32113"),
        Err(VtxError::TooManyPeerings(1))
    ));

    // The refusals did not disturb the existing pairing
    alice.send_bytes(b"still here".to_vec()).unwrap();
    let at_bob = bob.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(at_bob[0].data, b"still here");
}
