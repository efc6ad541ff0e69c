//! The write pipeline: lay out chunks, rewrite pointer sites from
//! source addresses to payload offsets, and emit the image sections in
//! their fixed order.
use log::info;

use std::io::Write;

use crate::engine::Flattener;
use crate::error::Result;
use crate::image::ImageHeader;
use crate::image::HEADER_SIZE;
use crate::image::IMAGE_MAGIC;
use crate::image::IMAGE_VERSION;
use crate::ranges::FlatPtr;

impl Flattener {
    /// Payload offset of a flattened location.
    fn payload_offset(&self, fp: FlatPtr) -> usize {
        let range = self.ranges.get(fp.range);
        self.stream.chunk(range.chunk).image_offset() + fp.offset
    }

    /// Address-contiguous range groups as `(payload offset, size)`
    /// fragments.  Sizes telescope between group starts so the
    /// fragments tile the payload exactly.
    fn fragments(&self) -> Vec<(usize, usize)> {
        let mut starts = Vec::new();
        let mut prev_last: Option<usize> = None;

        for id in self.ranges.iter() {
            let range = self.ranges.get(id);
            if prev_last != Some(range.start) {
                starts.push(self.stream.chunk(range.chunk).image_offset());
            }
            prev_last = Some(range.last + 1);
        }

        starts.sort_unstable();
        let memory_size = self.stream.total_size();
        let mut fragments = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(memory_size);
            fragments.push((start, end - start));
        }
        fragments
    }

    /// Emits the image into `sink` and returns its byte size.
    ///
    /// Short-circuits with the latched error if the dump failed; on
    /// success the image is complete and self-consistent.
    pub fn write<W: Write>(&mut self, sink: &mut W) -> Result<usize> {
        self.latched()?;

        if let Err(e) = self.stream.assign_offsets(&mut self.arena) {
            self.latch(e.clone());
            return Err(e);
        }

        // Rewrite every data-pointer site with the payload offset of its
        // target.  The 8-byte write may straddle two adjacent chunks.
        let patches: Vec<(FlatPtr, usize)> = self
            .fixups
            .data_sites()
            .map(|(site, target)| (site, self.payload_offset(target)))
            .collect();
        for &(site, value) in &patches {
            let chunk = self.ranges.get(site.range).chunk;
            self.stream
                .patch(&mut self.arena, chunk, site.offset, &value.to_ne_bytes());
        }

        let data_offsets: Vec<usize> = self
            .fixups
            .data_sites()
            .map(|(site, _)| self.payload_offset(site))
            .collect();
        let fptr_entries: Vec<(usize, String)> = self
            .fixups
            .func_sites()
            .map(|(site, addr)| {
                let name = self.mem.func_name(addr).unwrap_or_default();
                (self.payload_offset(site), name)
            })
            .collect();

        let fragments = if self.skip_fragments {
            Vec::new()
        } else {
            self.fragments()
        };

        let root_offsets: Vec<usize> = self
            .roots
            .iter()
            .map(|root| match self.ranges.resolve(root.addr) {
                Some(fp) => self.payload_offset(fp),
                None => usize::MAX,
            })
            .collect();

        let memory_size = self.stream.total_size();
        let fptrmapsz = 8 + fptr_entries
            .iter()
            .map(|(_, name)| 16 + name.len())
            .sum::<usize>();
        let named_size = self.roots.named_table_size();

        let image_size = HEADER_SIZE
            + root_offsets.len() * 8
            + named_size
            + data_offsets.len() * 8
            + fptr_entries.len() * 8
            + fragments.len() * 16
            + memory_size
            + fptrmapsz;

        let header = ImageHeader {
            magic: IMAGE_MAGIC,
            version: IMAGE_VERSION,
            last_load_addr: 0,
            last_mem_addr: 0,
            image_size,
            memory_size,
            ptr_count: data_offsets.len(),
            fptr_count: fptr_entries.len(),
            root_addr_count: root_offsets.len(),
            root_addr_extended_count: self.roots.named_count(),
            root_addr_extended_size: named_size,
            fptrmapsz,
            mcount: fragments.len(),
        };

        fn put<W: Write>(sink: &mut W, written: &mut usize, bytes: &[u8]) -> Result<()> {
            sink.write_all(bytes)?;
            *written += bytes.len();
            Ok(())
        }

        const ZEROS: [u8; 8] = [0; 8];
        let mut written = 0usize;

        put(sink, &mut written, &header.to_bytes())?;

        for &offset in &root_offsets {
            put(sink, &mut written, &offset.to_ne_bytes())?;
        }

        for (index, root) in self.roots.iter().enumerate() {
            if let Some(name) = &root.name {
                let padded = (name.len() + 7) & !7;
                put(sink, &mut written, &padded.to_ne_bytes())?;
                put(sink, &mut written, name.as_bytes())?;
                put(sink, &mut written, &ZEROS[..padded - name.len()])?;
                put(sink, &mut written, &index.to_ne_bytes())?;
                put(sink, &mut written, &root.size.to_ne_bytes())?;
            }
        }

        for &offset in &data_offsets {
            put(sink, &mut written, &offset.to_ne_bytes())?;
        }
        for &(offset, _) in &fptr_entries {
            put(sink, &mut written, &offset.to_ne_bytes())?;
        }
        for &(start, size) in &fragments {
            put(sink, &mut written, &start.to_ne_bytes())?;
            put(sink, &mut written, &size.to_ne_bytes())?;
        }

        written += self.stream.write_all(&self.arena, sink)?;

        put(sink, &mut written, &fptr_entries.len().to_ne_bytes())?;
        for &(offset, ref name) in &fptr_entries {
            put(sink, &mut written, &offset.to_ne_bytes())?;
            put(sink, &mut written, &name.len().to_ne_bytes())?;
            put(sink, &mut written, name.as_bytes())?;
        }

        debug_assert_eq!(written, image_size);
        info!(
            "image written: {} payload bytes, {} pointers, {} function pointers, {} roots, \
             {} fragments, {} bytes total",
            memory_size,
            header.ptr_count,
            header.fptr_count,
            header.root_addr_count,
            header.mcount,
            written
        );
        Ok(written)
    }
}
