//! Codec dual-path soak: put-frame in, byte-stream across, get-frame out.

use vtx::codec::{Codec, CodecFull};
use vtx::frame::Frame;

/// xorshift, so the mix is deterministic
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

#[test]
fn dual_path_relay_is_bit_for_bit() {
    const COUNT: usize = 10_000;
    const SMALL_CUTOFF: u64 = 64;

    let mut rng = Rng(0x9E3779B97F4A7C15);
    let frames: Vec<Frame> = (0..COUNT)
        .map(|_| {
            // 80% below the batching cutoff, 20% up to 5000 bytes
            let len = if rng.below(10) < 8 {
                rng.below(SMALL_CUTOFF)
            } else {
                SMALL_CUTOFF + rng.below(5000 - SMALL_CUTOFF)
            } as usize;
            let tag = rng.below(256) as u8;
            let more = rng.below(10) < 7;
            Frame::new(vec![tag; len], more)
        })
        .collect();

    let mut sender = Codec::new(100_000);
    let mut receiver = Codec::new(100_000);
    let mut out: Vec<Frame> = Vec::with_capacity(COUNT);
    let mut fed = 0;

    while out.len() < COUNT {
        // Stuff the sending codec until it pushes back
        while fed < frames.len() {
            match sender.put_frame(frames[fed].clone()) {
                Ok(()) => fed += 1,
                Err(CodecFull(_)) => break,
            }
        }
        sender.check();

        // Relay bytes: contiguous runs out of the sender, raw bytes into
        // the receiver, sized by what the receiver can take
        loop {
            let space = receiver.space();
            let chunk: Vec<u8> = match sender.get_bytes() {
                Ok(run) => run.iter().take(space).copied().collect(),
                Err(_) => break,
            };
            if chunk.is_empty() {
                break;
            }
            receiver.put_bytes(&chunk).unwrap();
            sender.tick(chunk.len());
        }

        // Drain whole frames off the receiving side
        while let Ok(frame) = receiver.get_frame() {
            out.push(frame);
        }
        receiver.check();
    }

    assert_eq!(out.len(), frames.len());
    for (i, (got, want)) in out.iter().zip(frames.iter()).enumerate() {
        assert_eq!(got, want, "frame {i} differs");
    }
}
