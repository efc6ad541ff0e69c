//! The binary stream: the ordered list of chunks that will be
//! concatenated into the image payload.  Chunks are linked by id so a new
//! chunk can be spliced before or after any existing one in O(1); the
//! range map relies on that to keep snapshots of adjacent source memory
//! adjacent in the payload.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::io;
use std::io::Write;

use crate::arena::Arena;
use crate::arena::Span;
use crate::error::Error;
use crate::error::Result;

/// Chunk alignments above this are rejected at layout time.
pub const MAX_CHUNK_ALIGNMENT: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkId(u32);

pub struct Chunk {
    data: Span,
    /// Power of two; 1 means no constraint.
    alignment: usize,
    /// Payload offset, assigned by `assign_offsets`.
    image_offset: usize,
    prev: Option<ChunkId>,
    next: Option<ChunkId>,
}

impl Chunk {
    pub fn size(&self) -> usize {
        self.data.len
    }

    pub fn image_offset(&self) -> usize {
        self.image_offset
    }
}

pub struct Stream {
    chunks: Vec<Chunk>,
    head: Option<ChunkId>,
    tail: Option<ChunkId>,
}

impl Stream {
    pub fn new() -> Stream {
        Stream {
            chunks: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id.0 as usize]
    }

    fn new_chunk(&mut self, arena: &mut Arena, data: &[u8]) -> Result<ChunkId> {
        let span = arena.alloc_bytes(data, 8)?;
        let id = ChunkId(self.chunks.len() as u32);
        self.chunks.push(Chunk {
            data: span,
            alignment: 1,
            image_offset: 0,
            prev: None,
            next: None,
        });
        Ok(id)
    }

    pub fn append(&mut self, arena: &mut Arena, data: &[u8]) -> Result<ChunkId> {
        let id = self.new_chunk(arena, data)?;
        match self.tail {
            Some(tail) => {
                self.chunks[tail.0 as usize].next = Some(id);
                self.chunks[id.0 as usize].prev = Some(tail);
                self.tail = Some(id);
            }
            None => {
                self.head = Some(id);
                self.tail = Some(id);
            }
        }
        Ok(id)
    }

    pub fn insert_before(&mut self, arena: &mut Arena, at: ChunkId, data: &[u8]) -> Result<ChunkId> {
        let id = self.new_chunk(arena, data)?;
        let prev = self.chunks[at.0 as usize].prev;
        self.chunks[id.0 as usize].prev = prev;
        self.chunks[id.0 as usize].next = Some(at);
        self.chunks[at.0 as usize].prev = Some(id);
        match prev {
            Some(p) => self.chunks[p.0 as usize].next = Some(id),
            None => self.head = Some(id),
        }
        Ok(id)
    }

    pub fn insert_after(&mut self, arena: &mut Arena, at: ChunkId, data: &[u8]) -> Result<ChunkId> {
        let id = self.new_chunk(arena, data)?;
        let next = self.chunks[at.0 as usize].next;
        self.chunks[id.0 as usize].next = next;
        self.chunks[id.0 as usize].prev = Some(at);
        self.chunks[at.0 as usize].next = Some(id);
        match next {
            Some(n) => self.chunks[n.0 as usize].prev = Some(id),
            None => self.tail = Some(id),
        }
        Ok(id)
    }

    pub fn set_alignment(&mut self, id: ChunkId, alignment: usize) {
        self.chunks[id.0 as usize].alignment = alignment;
    }

    /// Walks the chunks in stream order.
    pub fn iter(&self) -> StreamIter<'_> {
        StreamIter {
            stream: self,
            cursor: self.head,
        }
    }

    /// Assigns a payload offset to every chunk, splicing in zero-filled
    /// padding chunks wherever an alignment constraint requires one.
    #[ensures(ret.is_ok() -> self.iter().all(|id| {
        let c = self.chunk(id);
        c.alignment <= 1 || c.image_offset % c.alignment == 0
    }), "every aligned chunk lands on its alignment")]
    pub fn assign_offsets(&mut self, arena: &mut Arena) -> Result<()> {
        let mut offset = 0usize;
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let alignment = self.chunks[id.0 as usize].alignment;
            if alignment > 1 && offset != 0 {
                if alignment > MAX_CHUNK_ALIGNMENT || !alignment.is_power_of_two() {
                    return Err(Error::InvalidAlignment(alignment));
                }

                let pad = offset.wrapping_neg() & (alignment - 1);
                if pad != 0 {
                    let padding = vec![0u8; pad];
                    let pad_id = self.insert_before(arena, id, &padding)?;
                    self.chunks[pad_id.0 as usize].image_offset = offset;
                    offset += pad;
                }
            } else if alignment > MAX_CHUNK_ALIGNMENT || !alignment.is_power_of_two() {
                return Err(Error::InvalidAlignment(alignment));
            }

            let chunk = &mut self.chunks[id.0 as usize];
            chunk.image_offset = offset;
            offset += chunk.data.len;
            cursor = chunk.next;
        }

        Ok(())
    }

    /// Sum of all chunk sizes (padding included once assigned).
    pub fn total_size(&self) -> usize {
        self.iter().map(|id| self.chunk(id).size()).sum()
    }

    /// Overwrites `bytes` starting at `offset` within `id`, continuing
    /// into the following chunks when the write straddles a boundary.
    pub fn patch(&mut self, arena: &mut Arena, id: ChunkId, offset: usize, bytes: &[u8]) {
        let mut cursor = Some(id);
        let mut chunk_off = offset;
        let mut written = 0;

        while written < bytes.len() {
            let cur = cursor.expect("patch must stay inside the stream");
            let chunk = &self.chunks[cur.0 as usize];
            let avail = chunk.size() - chunk_off;
            let take = avail.min(bytes.len() - written);
            let span = chunk.data;
            let next = chunk.next;

            arena.bytes_mut(span)[chunk_off..chunk_off + take]
                .copy_from_slice(&bytes[written..written + take]);

            written += take;
            chunk_off = 0;
            cursor = next;
        }
    }

    /// Reads `out.len()` bytes starting at `offset` within `id`,
    /// following the chunk links like `patch`.
    pub fn read(&self, arena: &Arena, id: ChunkId, offset: usize, out: &mut [u8]) {
        let mut cursor = Some(id);
        let mut chunk_off = offset;
        let mut read = 0;

        while read < out.len() {
            let cur = cursor.expect("read must stay inside the stream");
            let chunk = &self.chunks[cur.0 as usize];
            let avail = chunk.size() - chunk_off;
            let take = avail.min(out.len() - read);

            out[read..read + take]
                .copy_from_slice(&arena.bytes(chunk.data)[chunk_off..chunk_off + take]);

            read += take;
            chunk_off = 0;
            cursor = chunk.next;
        }
    }

    pub fn write_all<W: Write>(&self, arena: &Arena, sink: &mut W) -> io::Result<usize> {
        let mut written = 0;
        for id in self.iter() {
            let bytes = arena.bytes(self.chunk(id).data);
            sink.write_all(bytes)?;
            written += bytes.len();
        }
        Ok(written)
    }
}

pub struct StreamIter<'a> {
    stream: &'a Stream,
    cursor: Option<ChunkId>,
}

impl<'a> Iterator for StreamIter<'a> {
    type Item = ChunkId;

    fn next(&mut self) -> Option<ChunkId> {
        let id = self.cursor?;
        self.cursor = self.stream.chunk(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arena::ArenaMode;

    fn contents(stream: &Stream, arena: &Arena) -> Vec<u8> {
        let mut out = Vec::new();
        stream.write_all(arena, &mut out).expect("write");
        out
    }

    #[test]
    fn splice_order() {
        let mut arena = Arena::new(ArenaMode::Passthrough);
        let mut stream = Stream::new();

        let b = stream.append(&mut arena, b"BB").expect("append");
        let d = stream.insert_after(&mut arena, b, b"DD").expect("insert");
        stream.insert_before(&mut arena, b, b"AA").expect("insert");
        stream.insert_before(&mut arena, d, b"CC").expect("insert");
        stream.insert_after(&mut arena, d, b"EE").expect("insert");

        assert_eq!(contents(&stream, &arena), b"AABBCCDDEE");
        assert_eq!(stream.total_size(), 10);
    }

    #[test]
    fn offsets_with_padding() {
        let mut arena = Arena::new(ArenaMode::Passthrough);
        let mut stream = Stream::new();

        let a = stream.append(&mut arena, &[1u8; 3]).expect("append");
        let b = stream.append(&mut arena, &[2u8; 5]).expect("append");
        stream.set_alignment(b, 8);

        stream.assign_offsets(&mut arena).expect("layout");

        assert_eq!(stream.chunk(a).image_offset(), 0);
        assert_eq!(stream.chunk(b).image_offset(), 8);
        // 3 data + 5 pad + 5 data.
        assert_eq!(stream.total_size(), 13);

        let bytes = contents(&stream, &arena);
        assert_eq!(&bytes[..3], &[1, 1, 1]);
        assert_eq!(&bytes[3..8], &[0; 5]);
        assert_eq!(&bytes[8..], &[2; 5]);
    }

    #[test]
    fn first_chunk_needs_no_padding() {
        let mut arena = Arena::new(ArenaMode::Passthrough);
        let mut stream = Stream::new();

        let a = stream.append(&mut arena, &[1u8; 4]).expect("append");
        stream.set_alignment(a, 64);
        stream.assign_offsets(&mut arena).expect("layout");
        assert_eq!(stream.chunk(a).image_offset(), 0);
        assert_eq!(stream.total_size(), 4);
    }

    #[test]
    fn oversized_alignment_rejected() {
        let mut arena = Arena::new(ArenaMode::Passthrough);
        let mut stream = Stream::new();

        stream.append(&mut arena, &[0u8; 4]).expect("append");
        let b = stream.append(&mut arena, &[0u8; 4]).expect("append");
        stream.set_alignment(b, 256);

        assert!(matches!(
            stream.assign_offsets(&mut arena),
            Err(Error::InvalidAlignment(256))
        ));
    }

    #[test]
    fn non_power_of_two_alignment_rejected() {
        let mut arena = Arena::new(ArenaMode::Passthrough);
        let mut stream = Stream::new();

        stream.append(&mut arena, &[0u8; 4]).expect("append");
        let b = stream.append(&mut arena, &[0u8; 4]).expect("append");
        stream.set_alignment(b, 24);

        assert!(matches!(
            stream.assign_offsets(&mut arena),
            Err(Error::InvalidAlignment(24))
        ));
    }

    #[test]
    fn patch_straddles_chunks() {
        let mut arena = Arena::new(ArenaMode::Passthrough);
        let mut stream = Stream::new();

        let a = stream.append(&mut arena, &[0u8; 4]).expect("append");
        stream.append(&mut arena, &[0u8; 4]).expect("append");

        stream.patch(&mut arena, a, 2, &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(
            contents(&stream, &arena),
            vec![0, 0, 0xAA, 0xBB, 0xCC, 0xDD, 0, 0]
        );

        let mut back = [0u8; 4];
        stream.read(&arena, a, 2, &mut back);
        assert_eq!(back, [0xAA, 0xBB, 0xCC, 0xDD]);
    }
}
