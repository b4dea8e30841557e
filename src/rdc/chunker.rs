//! Content-defined chunking with a gear rolling hash.

use std::io::{self, Read};
use xxhash_rust::xxh3::Xxh3;

use super::signature::ChunkSignature;
use crate::config::ChunkSizes;

const READ_BUFFER_SIZE: usize = 64 * 1024;

const fn gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    // Fixed seed so both ends of a synchronization cut at the same places
    let mut state = 0x45aa_bbcc_ddee_ff00u64;
    let mut i = 0;
    while i < 256 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        table[i] = state.wrapping_add((i as u64).wrapping_mul(0x517c_c1b7_2722_0a95));
        i += 1;
    }
    table
}

static GEAR: [u64; 256] = gear_table();

/// Splits a byte stream at content-defined boundaries and signs each chunk
/// with its length and 128-bit xxh3 digest.
///
/// A boundary is cut once a chunk has at least `min_size` bytes and the gear
/// hash has its low `log2(avg_size)` bits clear, or when it reaches
/// `max_size`. The gear hash only depends on the last 64 bytes, so an insert
/// or delete shifts boundaries only locally.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    sizes: ChunkSizes,
    mask: u64,
}

struct ChunkState {
    hasher: Xxh3,
    length: usize,
    gear: u64,
}

impl Chunker {
    pub fn new(sizes: ChunkSizes) -> Self {
        let mask = (sizes.avg_size.max(1).next_power_of_two() as u64) - 1;
        Self { sizes, mask }
    }

    /// Sign everything `reader` yields, reading in fixed-size buffers.
    pub fn signatures<R: Read>(&self, mut reader: R) -> io::Result<Vec<ChunkSignature>> {
        let mut out = Vec::new();
        let mut state = self.state();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            self.feed(&mut state, &buffer[..n], &mut out);
        }
        Self::finish(state, &mut out);
        Ok(out)
    }

    pub fn signatures_of(&self, data: &[u8]) -> Vec<ChunkSignature> {
        let mut out = Vec::new();
        let mut state = self.state();
        self.feed(&mut state, data, &mut out);
        Self::finish(state, &mut out);
        out
    }

    fn state(&self) -> ChunkState {
        ChunkState {
            hasher: Xxh3::new(),
            length: 0,
            gear: 0,
        }
    }

    fn feed(&self, state: &mut ChunkState, data: &[u8], out: &mut Vec<ChunkSignature>) {
        let mut start = 0;
        for (i, &byte) in data.iter().enumerate() {
            state.length += 1;
            state.gear = (state.gear << 1).wrapping_add(GEAR[byte as usize]);

            let cut = (state.length >= self.sizes.min_size && state.gear & self.mask == 0)
                || state.length >= self.sizes.max_size;
            if cut {
                state.hasher.update(&data[start..=i]);
                out.push(ChunkSignature {
                    length: state.length as u32,
                    hash: state.hasher.digest128(),
                });
                state.hasher.reset();
                state.length = 0;
                state.gear = 0;
                start = i + 1;
            }
        }
        state.hasher.update(&data[start..]);
    }

    fn finish(state: ChunkState, out: &mut Vec<ChunkSignature>) {
        if state.length > 0 {
            out.push(ChunkSignature {
                length: state.length as u32,
                hash: state.hasher.digest128(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn sizes() -> ChunkSizes {
        ChunkSizes {
            min_size: 256,
            avg_size: 1024,
            max_size: 4096,
        }
    }

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_lengths_cover_input_and_respect_bounds() {
        let data = random_bytes(200_000, 1);
        let chunks = Chunker::new(sizes()).signatures_of(&data);

        let total: u64 = chunks.iter().map(|c| c.length as u64).sum();
        assert_eq!(total, data.len() as u64);
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(chunk.length >= 256 && chunk.length <= 4096);
        }
    }

    #[test]
    fn test_streaming_matches_in_memory() {
        let data = random_bytes(300_000, 2);
        let chunker = Chunker::new(sizes());
        let streamed = chunker.signatures(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(streamed, chunker.signatures_of(&data));
    }

    #[test]
    fn test_local_edit_keeps_most_chunks() {
        let data = random_bytes(100_000, 3);
        let mut edited = data.clone();
        edited.splice(50_000..50_000, b"inserted bytes".iter().copied());

        let chunker = Chunker::new(sizes());
        let before = chunker.signatures_of(&data);
        let after = chunker.signatures_of(&edited);
        let shared = after.iter().filter(|c| before.contains(c)).count();
        assert!(shared + 5 >= before.len(), "{} of {}", shared, before.len());
    }

    #[test]
    fn test_empty_input() {
        assert!(Chunker::new(sizes()).signatures_of(&[]).is_empty());
    }
}
