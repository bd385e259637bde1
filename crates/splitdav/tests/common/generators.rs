//! Test data generators.

use rand::Rng;

/// Uploads of at least this many bytes are chunked by the test proxy.
pub const FILE_MAX_SIZE: u64 = 1000;

/// Chunk-size target of the test proxy.
pub const CHUNK_SIZE: u64 = 400;

/// Generate random bytes of specified size.
pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..size).map(|_| rng.random()).collect()
}

/// Content just large enough to be chunked, ending in a short last chunk.
///
/// 1100 bytes: chunks of 400, 400 and 300.
pub fn chunked_content() -> Vec<u8> {
    random_bytes(1100)
}

/// Content one byte below the chunking threshold.
pub fn below_threshold() -> Vec<u8> {
    random_bytes(FILE_MAX_SIZE as usize - 1)
}

/// Content of exactly `n` full chunks.
pub fn whole_chunks(n: usize) -> Vec<u8> {
    random_bytes(n * CHUNK_SIZE as usize)
}

/// Bytes that make the position of every byte recognizable.
pub fn counting_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}
