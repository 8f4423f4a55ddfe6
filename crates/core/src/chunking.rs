//! Chunk partition math.

use crate::types::ChunkRange;

/// Partition `[frame_start, frame_end]` into consecutive ranges of
/// `chunk_size` frames, the last possibly shorter.
///
/// Callers must validate the manifest first; an inverted range yields an
/// empty partition and a `chunk_size < 1` is clamped to 1 rather than
/// looping forever.
pub fn compute_chunks(frame_start: i32, frame_end: i32, chunk_size: i32) -> Vec<ChunkRange> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();

    let mut start = frame_start;
    while start <= frame_end {
        let end = (start + chunk_size - 1).min(frame_end);
        chunks.push(ChunkRange::new(start, end));
        start = end + 1;
    }

    chunks
}
