//! Request-reply over the TCP driver: frames on a stream, no preamble.

use std::time::Duration;

use vtx::{DriverConfig, Frame, Pattern, Vtx, tcp};

#[test]
fn req_rep_over_tcp_loopback() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut vtx = Vtx::new();
    vtx.register("tcp", tcp::driver(DriverConfig::default()))
        .unwrap();

    let mut server = vtx.socket(Pattern::Rep).unwrap();
    vtx.bind(&mut server, "tcp://*:32160").unwrap();

    let mut client = vtx.socket(Pattern::Req).unwrap();
    vtx.connect(&mut client, "tcp://127.0.0.1:32160").unwrap();

    for round in 0..100 {
        client.send_bytes(b"ICANHAZ?".to_vec()).unwrap();
        let request = server
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|e| panic!("round {round}: no request: {e}"));
        assert_eq!(request[0].data, b"ICANHAZ?");

        server.send_bytes(b"CHEEZBURGER".to_vec()).unwrap();
        let reply = client
            .recv_timeout(Duration::from_secs(5))
            .unwrap_or_else(|e| panic!("round {round}: no reply: {e}"));
        assert_eq!(reply[0].data, b"CHEEZBURGER");
    }
}

#[test]
fn multipart_and_large_frames_survive_the_stream() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut vtx = Vtx::new();
    vtx.register("tcp", tcp::driver(DriverConfig::default()))
        .unwrap();

    let mut sink = vtx.socket(Pattern::Pull).unwrap();
    vtx.bind(&mut sink, "tcp://*:32161").unwrap();

    let mut source = vtx.socket(Pattern::Push).unwrap();
    vtx.connect(&mut source, "tcp://127.0.0.1:32161").unwrap();

    // A multipart message with a body well past the short-header bound
    let msg = vec![
        Frame::new(b"header".to_vec(), true),
        Frame::new(vec![0x5A; 4000], true),
        Frame::new(b"trailer".to_vec(), false),
    ];
    source.send(msg.clone()).unwrap();

    let got = sink.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, msg);

    // Whole-message framing held up under a burst as well
    for i in 0..200u32 {
        source
            .send(vec![
                Frame::new(i.to_be_bytes().to_vec(), true),
                Frame::new(vec![(i % 256) as u8; 300], false),
            ])
            .unwrap();
    }
    for i in 0..200u32 {
        let got = sink.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got[0].data, i.to_be_bytes().to_vec());
        assert_eq!(got[1].data, vec![(i % 256) as u8; 300]);
    }
}
