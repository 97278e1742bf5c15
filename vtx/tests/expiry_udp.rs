//! Peering expiry and resurrection across a server outage.

use std::collections::HashSet;
use std::time::Duration;

use vtx::{DriverConfig, Pattern, Vtx, udp};

fn quick_config() -> DriverConfig {
    DriverConfig {
        timeout_ms: 600,
        ohai_ivl_ms: 150,
        resend_ivl_ms: 150,
        ..DriverConfig::default()
    }
}

#[test]
fn peering_expires_and_comes_back() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut client_vtx = Vtx::new();
    client_vtx
        .register("udp", udp::driver(quick_config()))
        .unwrap();
    let mut client = client_vtx.socket(Pattern::Dealer).unwrap();
    client_vtx
        .connect(&mut client, "udp://127.0.0.1:32130")
        .unwrap();

    // First server lifetime
    let mut server_vtx = Vtx::new();
    server_vtx
        .register("udp", udp::driver(quick_config()))
        .unwrap();
    let mut sink = server_vtx.socket(Pattern::Pull).unwrap();
    server_vtx.bind(&mut sink, "udp://*:32130").unwrap();

    client.send_bytes(b"before outage".to_vec()).unwrap();
    let got = sink.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got[0].data, b"before outage");

    // Server goes away; nothing answers or heartbeats any more
    drop(sink);
    drop(server_vtx);

    // These fly into the void while the peering still looks alive; that
    // small loss window is inherent to a dead peer not yet detected
    client.send_bytes(b"lost 1".to_vec()).unwrap();
    client.send_bytes(b"lost 2".to_vec()).unwrap();

    // Wait past the peering timeout: ALIVE -> DEAD, courtship restarts
    std::thread::sleep(Duration::from_millis(900));

    // Queued while dead; must survive the outage
    client.send_bytes(b"kept 1".to_vec()).unwrap();
    client.send_bytes(b"kept 2".to_vec()).unwrap();

    // Server returns on the same endpoint
    let mut server_vtx = Vtx::new();
    server_vtx
        .register("udp", udp::driver(quick_config()))
        .unwrap();
    let mut sink = server_vtx.socket(Pattern::Pull).unwrap();
    server_vtx.bind(&mut sink, "udp://*:32130").unwrap();

    let mut received = HashSet::new();
    while let Ok(msg) = sink.recv_timeout(Duration::from_secs(3)) {
        received.insert(String::from_utf8_lossy(&msg[0].data).to_string());
        if received.contains("kept 1") && received.contains("kept 2") {
            break;
        }
    }
    assert!(received.contains("kept 1"), "got {received:?}");
    assert!(received.contains("kept 2"), "got {received:?}");
}
