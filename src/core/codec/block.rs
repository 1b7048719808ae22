//! Block packet framing for transfer channels.
//!
//! One compressed chunk travels as an ordered run of blocks. Every block is a
//! self-describing binary message:
//!
//!   [4 bytes: chunk_index BE] [4 bytes: block_index BE] [1 byte: flags] [payload]
//!
//! Flag bit 0 marks the chunk's last block. Receivers reassemble by
//! `(chunk_index, block_index)`, never by arrival order, so blocks of
//! different chunks may interleave freely across channels.

use super::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};

/// Size of the fixed block header.
pub const BLOCK_HEADER_LEN: usize = 9;

const FLAG_LAST: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPacket {
    pub chunk_index: u32,
    pub block_index: u32,
    pub is_last: bool,
    pub payload: Bytes,
}

impl BlockPacket {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_LEN + self.payload.len());
        buf.put_u32(self.chunk_index);
        buf.put_u32(self.block_index);
        buf.put_u8(if self.is_last { FLAG_LAST } else { 0 });
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, CodecError> {
        if frame.len() < BLOCK_HEADER_LEN {
            return Err(CodecError::ShortFrame(frame.len()));
        }
        let chunk_index = frame.get_u32();
        let block_index = frame.get_u32();
        let flags = frame.get_u8();
        Ok(Self {
            chunk_index,
            block_index,
            is_last: flags & FLAG_LAST != 0,
            payload: frame,
        })
    }
}

/// Split one compressed chunk into blocks of at most `block_size` bytes.
///
/// An empty chunk still yields one (empty) last block so the receiver can
/// complete it.
pub fn split_chunk(chunk_index: u32, data: Bytes, block_size: usize) -> Vec<BlockPacket> {
    let block_size = block_size.max(1);
    if data.is_empty() {
        return vec![BlockPacket {
            chunk_index,
            block_index: 0,
            is_last: true,
            payload: data,
        }];
    }

    let count = data.len().div_ceil(block_size);
    (0..count)
        .map(|i| {
            let start = i * block_size;
            let end = (start + block_size).min(data.len());
            BlockPacket {
                chunk_index,
                block_index: i as u32,
                is_last: i + 1 == count,
                payload: data.slice(start..end),
            }
        })
        .collect()
}

/// Reassembly state for one chunk.
#[derive(Debug, Default)]
struct PendingChunk {
    blocks: BTreeMap<u32, Bytes>,
    received_block_count: u32,
    /// Known once the last block has arrived.
    total_block_count: Option<u32>,
}

/// Transient per-chunk reassembly buffer.
#[derive(Debug, Default)]
pub struct BlockCache {
    chunks: HashMap<u32, PendingChunk>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block. Returns the reassembled chunk once its final block count
    /// is reached; the chunk's buffer is dropped at that point.
    ///
    /// Blocks at or past a known last block, and last blocks that contradict
    /// an earlier one, are rejected without touching the buffer.
    pub fn insert(&mut self, packet: BlockPacket) -> Result<Option<(u32, Bytes)>, CodecError> {
        let chunk_index = packet.chunk_index;
        let bad_block = || CodecError::BadBlock {
            chunk: chunk_index,
            block: packet.block_index,
        };
        let last_total = if packet.is_last {
            Some(packet.block_index.checked_add(1).ok_or_else(bad_block)?)
        } else {
            None
        };
        let entry = self.chunks.entry(chunk_index).or_default();

        match (entry.total_block_count, last_total) {
            (Some(known), Some(total)) if known != total => return Err(bad_block()),
            (Some(known), None) if packet.block_index >= known - 1 => return Err(bad_block()),
            (None, Some(total)) => {
                entry.blocks.retain(|&block, _| block < total);
                entry.received_block_count = entry.blocks.len() as u32;
                entry.total_block_count = Some(total);
            }
            _ => {}
        }

        if entry.blocks.insert(packet.block_index, packet.payload).is_none() {
            entry.received_block_count += 1;
        }

        let Some(total) = entry.total_block_count else {
            return Ok(None);
        };
        if entry.received_block_count < total {
            return Ok(None);
        }

        let Some(entry) = self.chunks.remove(&chunk_index) else {
            return Ok(None);
        };
        let len = entry.blocks.values().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(len);
        for block in entry.blocks.into_values() {
            out.extend_from_slice(&block);
        }
        Ok(Some((chunk_index, out.freeze())))
    }

    /// Forget any partial state for `chunk_index`.
    pub fn discard(&mut self, chunk_index: u32) {
        self.chunks.remove(&chunk_index);
    }

    /// Chunk indices with at least one buffered block.
    pub fn pending(&self) -> impl Iterator<Item = u32> + '_ {
        self.chunks.keys().copied()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    #[test]
    fn header_layout() {
        let packet = BlockPacket {
            chunk_index: 0x0102_0304,
            block_index: 7,
            is_last: true,
            payload: Bytes::from_static(b"abc"),
        };
        let frame = packet.encode();
        assert_eq!(&frame[..9], &[1, 2, 3, 4, 0, 0, 0, 7, 1]);
        assert_eq!(BlockPacket::decode(frame).unwrap(), packet);
    }

    #[test]
    fn short_frame_is_rejected() {
        let err = BlockPacket::decode(Bytes::from_static(&[0, 0, 0])).unwrap_err();
        assert!(matches!(err, CodecError::ShortFrame(3)));
    }

    #[test]
    fn split_marks_only_final_block() {
        let blocks = split_chunk(4, payload(2500), 1000);
        assert_eq!(blocks.len(), 3);
        assert!(blocks.iter().all(|b| b.chunk_index == 4));
        assert_eq!(
            blocks.iter().map(|b| b.is_last).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert_eq!(blocks[2].payload.len(), 500);

        let empty = split_chunk(0, Bytes::new(), 1000);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].is_last);
    }

    #[test]
    fn reassembles_regardless_of_arrival_order() {
        let a = payload(3300);
        let b = payload(900);
        let mut blocks: Vec<BlockPacket> = split_chunk(1, a.clone(), 1000)
            .into_iter()
            .chain(split_chunk(2, b.clone(), 1000))
            .map(|p| BlockPacket::decode(p.encode()).unwrap())
            .collect();
        // last blocks first, chunks interleaved
        blocks.reverse();
        blocks.swap(0, 3);

        let mut cache = BlockCache::new();
        let mut done = Vec::new();
        for block in blocks {
            if let Some(chunk) = cache.insert(block).unwrap() {
                done.push(chunk);
            }
        }
        done.sort_by_key(|(i, _)| *i);
        assert_eq!(done, vec![(1, a), (2, b)]);
        assert_eq!(cache.pending().count(), 0);
    }

    #[test]
    fn duplicate_blocks_do_not_complete_early() {
        let data = payload(3000);
        let blocks = split_chunk(0, data.clone(), 1000);
        let mut cache = BlockCache::new();

        assert!(cache.insert(blocks[0].clone()).unwrap().is_none());
        assert!(cache.insert(blocks[0].clone()).unwrap().is_none());
        assert!(cache.insert(blocks[2].clone()).unwrap().is_none());
        let (_, chunk) = cache.insert(blocks[1].clone()).unwrap().unwrap();
        assert_eq!(chunk, data);
    }

    #[test]
    fn discard_drops_partial_chunk() {
        let blocks = split_chunk(5, payload(2000), 1000);
        let mut cache = BlockCache::new();
        cache.insert(blocks[0].clone()).unwrap();
        cache.discard(5);
        assert!(cache.insert(blocks[1].clone()).unwrap().is_none());
    }

    fn block(block_index: u32, is_last: bool, len: usize) -> BlockPacket {
        BlockPacket {
            chunk_index: 3,
            block_index,
            is_last,
            payload: payload(len),
        }
    }

    #[test]
    fn last_block_at_max_index_is_rejected() {
        let mut cache = BlockCache::new();
        let err = cache.insert(block(u32::MAX, true, 10)).unwrap_err();
        assert!(matches!(err, CodecError::BadBlock { chunk: 3, block: u32::MAX }));
        assert_eq!(cache.pending().count(), 0);
    }

    #[test]
    fn blocks_past_the_last_never_count() {
        // junk block 7 buffered before the last block is known
        let mut cache = BlockCache::new();
        assert!(cache.insert(block(0, false, 1000)).unwrap().is_none());
        assert!(cache.insert(block(7, false, 1000)).unwrap().is_none());
        assert!(cache.insert(block(2, true, 1000)).unwrap().is_none());

        // junk block after the last is known
        assert!(cache.insert(block(5, false, 1000)).is_err());
        assert!(cache.insert(block(4, true, 1000)).is_err());

        let (index, chunk) = cache.insert(block(1, false, 1000)).unwrap().unwrap();
        assert_eq!(index, 3);
        assert_eq!(chunk.len(), 3000);
    }
}
