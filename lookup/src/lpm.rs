use slipstream_mem::{MemError, MemResult, MemoryContext, RelPtr};

/// Sentinel returned by [`Lpm::lookup`] when no range covers the key.
pub const LPM_VALUE_INVALID: u32 = u32::MAX;

/// Entries with this bit carry a child-node index instead of a value.
/// Stored values are therefore restricted to `0..0x8000_0000`.
const CHILD_FLAG: u32 = 0x8000_0000;

const NODE_ENTRIES: usize = 256;
const INITIAL_NODE_CAP: u32 = 4;

/// Longest-prefix-match trie over byte keys of 4, 8 or 16 bytes.
///
/// The trie is a 256-ary radix tree stored as one flat `u32` table inside
/// a memory context; child links are node indices, not pointers, so the
/// structure stays valid across remaps of the shared region.
///
/// `insert(start, end, value)` paints an inclusive address range: full
/// subtrees covered by the range collapse to a single painted entry,
/// partial edges recurse. Later inserts overwrite earlier paint where
/// they overlap, which is exactly the most-specific-last discipline the
/// config compilers rely on.
#[repr(C)]
pub struct Lpm {
    mctx: RelPtr<MemoryContext>,
    nodes: RelPtr<u32>,
    node_count: u32,
    node_cap: u32,
}

impl Lpm {
    pub fn init(&mut self, mctx: *mut MemoryContext) -> MemResult {
        self.mctx = RelPtr::null();
        self.mctx.store(mctx);
        self.node_count = 0;
        self.node_cap = INITIAL_NODE_CAP;

        let bytes = self.node_cap as usize * NODE_ENTRIES * size_of::<u32>();
        // SAFETY: live single-writer context supplied by the caller.
        let nodes = unsafe { (*mctx).balloc(bytes) } as *mut u32;
        if nodes.is_null() {
            return Err(MemError::OutOfMemory);
        }
        self.nodes = RelPtr::null();
        self.nodes.store(nodes);

        let root = self.alloc_node(LPM_VALUE_INVALID)?;
        debug_assert_eq!(root, 0);
        Ok(())
    }

    pub fn free(&mut self) {
        let mctx = self.mctx.load();
        let nodes = self.nodes.load();
        if mctx.is_null() || nodes.is_null() {
            return;
        }
        let bytes = self.node_cap as usize * NODE_ENTRIES * size_of::<u32>();
        // SAFETY: the table was allocated from this context.
        unsafe { (*mctx).bfree(nodes as *mut u8, bytes) };
        self.nodes = RelPtr::null();
        self.node_count = 0;
    }

    #[inline]
    fn entry(&self, node: u32, byte: u8) -> u32 {
        // SAFETY: `node < node_count` and the table spans
        // `node_cap * 256` entries.
        unsafe {
            *self
                .nodes
                .load()
                .add(node as usize * NODE_ENTRIES + byte as usize)
        }
    }

    #[inline]
    fn set_entry(&mut self, node: u32, byte: u8, value: u32) {
        // SAFETY: as in `entry`.
        unsafe {
            *self
                .nodes
                .load()
                .add(node as usize * NODE_ENTRIES + byte as usize) = value;
        }
    }

    fn alloc_node(&mut self, fill: u32) -> Result<u32, MemError> {
        if self.node_count == self.node_cap {
            let mctx = self.mctx.load();
            let old_bytes = self.node_cap as usize * NODE_ENTRIES * size_of::<u32>();
            let new_cap = self.node_cap * 2;
            let new_bytes = new_cap as usize * NODE_ENTRIES * size_of::<u32>();
            // SAFETY: context is live; old table is copied before free.
            unsafe {
                let new_nodes = (*mctx).balloc(new_bytes) as *mut u32;
                if new_nodes.is_null() {
                    return Err(MemError::OutOfMemory);
                }
                core::ptr::copy_nonoverlapping(
                    self.nodes.load(),
                    new_nodes,
                    self.node_count as usize * NODE_ENTRIES,
                );
                (*mctx).bfree(self.nodes.load() as *mut u8, old_bytes);
                self.nodes.store(new_nodes);
            }
            self.node_cap = new_cap;
        }
        let idx = self.node_count;
        self.node_count += 1;
        for byte in 0..NODE_ENTRIES {
            self.set_entry(idx, byte as u8, fill);
        }
        Ok(idx)
    }

    /// Resolve the child under `(node, byte)`, creating one if the entry
    /// currently holds a painted value (the new child inherits it).
    fn descend(&mut self, node: u32, byte: u8) -> Result<u32, MemError> {
        let entry = self.entry(node, byte);
        if entry != LPM_VALUE_INVALID && entry & CHILD_FLAG != 0 {
            return Ok(entry & !CHILD_FLAG);
        }
        let child = self.alloc_node(entry)?;
        self.set_entry(node, byte, CHILD_FLAG | child);
        Ok(child)
    }

    /// Cover the inclusive range `start..=end` with `value`.
    ///
    /// `start` and `end` must be equal-length keys with `start <= end`;
    /// `value` must be below `0x8000_0000`.
    pub fn insert(&mut self, start: &[u8], end: &[u8], value: u32) -> MemResult {
        debug_assert_eq!(start.len(), end.len());
        debug_assert!(start <= end);
        debug_assert!(value & CHILD_FLAG == 0);
        let mut lo = [0u8; 16];
        let mut hi = [0u8; 16];
        lo[..start.len()].copy_from_slice(start);
        hi[..end.len()].copy_from_slice(end);
        self.insert_rec(0, 0, start.len(), &mut lo, &mut hi, value)
    }

    fn insert_rec(
        &mut self,
        node: u32,
        depth: usize,
        key_len: usize,
        start: &mut [u8; 16],
        end: &mut [u8; 16],
        value: u32,
    ) -> MemResult {
        let lo = start[depth];
        let hi = end[depth];

        if depth == key_len - 1 {
            for byte in lo..=hi {
                self.set_entry(node, byte, value);
            }
            return Ok(());
        }

        if lo == hi {
            let child = self.descend(node, lo)?;
            return self.insert_rec(child, depth + 1, key_len, start, end, value);
        }

        let mut full_lo = lo as u16;
        let mut full_hi = hi as u16;

        // Left edge: the range enters the `lo` subtree mid-way.
        if start[depth + 1..key_len].iter().any(|&b| b != 0x00) {
            let child = self.descend(node, lo)?;
            let mut edge_end = *start;
            edge_end[depth + 1..key_len].fill(0xff);
            self.insert_rec(child, depth + 1, key_len, start, &mut edge_end, value)?;
            full_lo += 1;
        }
        // Right edge: the range leaves the `hi` subtree mid-way.
        if end[depth + 1..key_len].iter().any(|&b| b != 0xff) {
            let child = self.descend(node, hi)?;
            let mut edge_start = *end;
            edge_start[depth + 1..key_len].fill(0x00);
            self.insert_rec(child, depth + 1, key_len, &mut edge_start, end, value)?;
            full_hi -= 1;
        }
        // Whole subtrees in between collapse to one painted entry each.
        for byte in full_lo..=full_hi {
            self.set_entry(node, byte as u8, value);
        }
        Ok(())
    }

    /// Look up `key`; returns the painted value or [`LPM_VALUE_INVALID`].
    pub fn lookup(&self, key: &[u8]) -> u32 {
        let mut node = 0u32;
        for &byte in key {
            let entry = self.entry(node, byte);
            if entry == LPM_VALUE_INVALID {
                return LPM_VALUE_INVALID;
            }
            if entry & CHILD_FLAG != 0 {
                node = entry & !CHILD_FLAG;
            } else {
                return entry;
            }
        }
        LPM_VALUE_INVALID
    }
}
