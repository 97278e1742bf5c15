//! Publish-subscribe over UDP with two subscribers.

use std::collections::HashSet;
use std::time::Duration;

use vtx::{DriverConfig, Pattern, Vtx, VtxSocket, udp};

fn drain(socket: &VtxSocket) -> Vec<String> {
    let mut got = Vec::new();
    while let Ok(msg) = socket.recv_timeout(Duration::from_millis(500)) {
        got.push(String::from_utf8_lossy(&msg[0].data).to_string());
    }
    got
}

#[test]
fn pub_sub_two_subscribers() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut vtx = Vtx::new();
    vtx.register("udp", udp::driver(DriverConfig::default()))
        .unwrap();

    let mut publisher = vtx.socket(Pattern::Pub).unwrap();
    vtx.bind(&mut publisher, "udp://*:32105").unwrap();

    let mut sub1 = vtx.socket(Pattern::Sub).unwrap();
    vtx.connect(&mut sub1, "udp://127.0.0.1:32105").unwrap();
    let mut sub2 = vtx.socket(Pattern::Sub).unwrap();
    vtx.connect(&mut sub2, "udp://127.0.0.1:32105").unwrap();

    // Let both subscriptions come alive before publishing
    std::thread::sleep(Duration::from_millis(500));

    const COUNT: usize = 100;
    // Messages published before a subscription was live may be missed
    const SLACK: usize = 20;

    let mut sent = HashSet::new();
    for i in 0..COUNT {
        let body = format!("NOM {i:04x}");
        publisher.send_bytes(body.clone().into_bytes()).unwrap();
        sent.insert(body);
    }

    for (name, sub) in [("sub1", &sub1), ("sub2", &sub2)] {
        let got = drain(sub);
        assert!(
            got.len() >= COUNT - SLACK,
            "{name} received only {} of {COUNT}",
            got.len()
        );
        let unique: HashSet<_> = got.iter().cloned().collect();
        assert_eq!(unique.len(), got.len(), "{name} received duplicates");
        for body in &got {
            assert!(sent.contains(body), "{name} received unknown {body}");
        }
    }
}

#[test]
fn subscriber_cannot_send() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut vtx = Vtx::new();
    vtx.register("udp", udp::driver(DriverConfig::default()))
        .unwrap();

    let mut publisher = vtx.socket(Pattern::Pub).unwrap();
    vtx.bind(&mut publisher, "udp://*:32106").unwrap();
    let mut sub = vtx.socket(Pattern::Sub).unwrap();
    vtx.connect(&mut sub, "udp://127.0.0.1:32106").unwrap();

    std::thread::sleep(Duration::from_millis(300));

    // Dropped with a warning by the driver, never delivered anywhere
    sub.send_bytes(b"upstream?".to_vec()).unwrap();
    assert!(publisher.recv_timeout(Duration::from_millis(300)).is_err());
}
