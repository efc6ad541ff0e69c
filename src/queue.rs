//! FIFO of pending traversal jobs, stored in fixed-capacity blocks so a
//! deep graph does not keep reallocating one huge ring.  Push spills into
//! a fresh tail block; pop drains from the head; `clear` drops every block
//! but the head.
use std::collections::VecDeque;
use std::mem;

struct Block<T> {
    items: Vec<T>,
    /// Index of the next element to pop within `items`.
    head: usize,
}

impl<T> Block<T> {
    fn new(capacity: usize) -> Block<T> {
        Block {
            items: Vec::with_capacity(capacity),
            head: 0,
        }
    }

    fn live(&self) -> usize {
        self.items.len() - self.head
    }
}

pub struct BlockQueue<T> {
    blocks: VecDeque<Block<T>>,
    /// Elements per block, fixed at creation.
    block_capacity: usize,
    count: usize,
}

impl<T> BlockQueue<T> {
    /// `block_bytes` is the rough byte footprint of one block; at least
    /// one element per block.
    pub fn new(block_bytes: usize) -> BlockQueue<T> {
        let block_capacity = (block_bytes / mem::size_of::<T>().max(1)).max(1);
        let mut blocks = VecDeque::new();
        blocks.push_back(Block::new(block_capacity));

        BlockQueue {
            blocks,
            block_capacity,
            count: 0,
        }
    }

    pub fn push_back(&mut self, item: T) {
        let tail = self.blocks.back_mut().expect("queue always has a block");
        if tail.items.len() >= self.block_capacity {
            let mut block = Block::new(self.block_capacity);
            block.items.push(item);
            self.blocks.push_back(block);
        } else {
            tail.items.push(item);
        }
        self.count += 1;
    }

    pub fn pop_front(&mut self) -> Option<T>
    where
        T: Copy,
    {
        loop {
            let head_live = {
                let head = self.blocks.front()?;
                head.live()
            };

            if head_live == 0 {
                if self.blocks.len() == 1 {
                    return None;
                }
                self.blocks.pop_front();
                continue;
            }

            let head = self.blocks.front_mut().expect("checked above");
            let item = head.items[head.head];
            head.head += 1;
            self.count -= 1;

            // A fully drained interior block is released immediately.
            if head.live() == 0 && self.blocks.len() > 1 {
                self.blocks.pop_front();
            }
            return Some(item);
        }
    }

    /// Releases every block but the head and resets it.
    pub fn clear(&mut self) {
        self.blocks.truncate(1);
        let head = self.blocks.front_mut().expect("queue always has a block");
        head.items.clear();
        head.head = 0;
        self.count = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn element_count(&self) -> usize {
        self.count
    }

    /// Byte footprint of the queued elements.
    pub fn size(&self) -> usize {
        self.count * mem::size_of::<T>()
    }
}
