//! Shared inputs for the `micro-mux` benchmarks.

/// A named wire input.
#[derive(Debug, Copy, Clone)]
pub struct Fixture {
    name: &'static str,
    content: &'static [u8],
}

impl Fixture {
    pub const fn new(name: &'static str, content: &'static [u8]) -> Self {
        Self { name, content }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn content(&self) -> &'static [u8] {
        self.content
    }
}

pub static SMALL_HEADER: Fixture = Fixture::new("small_header", include_bytes!("../resources/request/get_small.txt"));
pub static LARGE_HEADER: Fixture = Fixture::new("large_header", include_bytes!("../resources/request/get_large.txt"));

/// A client to server (masked) WebSocket binary frame carrying `len` bytes.
pub fn masked_frame(len: usize) -> Vec<u8> {
    let mask = [0x3a, 0x91, 0x0c, 0x5e];
    let mut frame = vec![0x82];
    match len {
        0..=125 => frame.push(0x80 | len as u8),
        126..=0xffff => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&mask);
    frame.extend((0..len).map(|i| (i as u8) ^ mask[i % 4]));
    frame
}
