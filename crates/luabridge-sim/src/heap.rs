use std::collections::BTreeMap;

use luabridge_guest_core::Ptr;

const HEAP_BASE: u32 = 16;
const ALIGN: u32 = 8;

/// Linear memory with a first-fit allocator. Offset 0 is never handed out.
#[derive(Debug)]
pub(crate) struct Heap {
    bytes: Vec<u8>,
    limit: usize,
    live: BTreeMap<u32, u32>,
    free: Vec<(u32, u32)>,
}

impl Heap {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            bytes: vec![0; HEAP_BASE as usize],
            limit,
            live: BTreeMap::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub(crate) fn alloc(&mut self, len: u32) -> Option<Ptr> {
        let size = len.max(1).checked_add(ALIGN - 1)? / ALIGN * ALIGN;

        if let Some(pos) = self.free.iter().position(|&(_, sz)| sz >= size) {
            let (ptr, sz) = self.free.swap_remove(pos);
            if sz - size >= ALIGN {
                self.free.push((ptr + size, sz - size));
            }
            let taken = if sz - size >= ALIGN { size } else { sz };
            self.live.insert(ptr, taken);
            self.bytes[ptr as usize..(ptr + taken) as usize].fill(0);
            return Some(Ptr(ptr));
        }

        let ptr = u32::try_from(self.bytes.len()).ok()?;
        let end = (ptr as usize).checked_add(size as usize)?;
        if end > self.limit || end > u32::MAX as usize {
            return None;
        }
        self.bytes.resize(end, 0);
        self.live.insert(ptr, size);
        Some(Ptr(ptr))
    }

    /// Returns false if `ptr` is not a live block.
    pub(crate) fn free(&mut self, ptr: Ptr) -> bool {
        match self.live.remove(&ptr.0) {
            Some(size) => {
                self.free.push((ptr.0, size));
                true
            }
            None => false,
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub(crate) fn write(&mut self, ptr: Ptr, data: &[u8]) {
        let start = ptr.offset();
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_hands_out_null() {
        let mut heap = Heap::new(1024);
        let p = heap.alloc(0).expect("alloc");
        assert!(!p.is_null());
        assert!(p.0 >= HEAP_BASE);
    }

    #[test]
    fn freed_blocks_are_reused() {
        let mut heap = Heap::new(1024);
        let a = heap.alloc(10).expect("alloc a");
        let _b = heap.alloc(10).expect("alloc b");
        assert!(heap.free(a));
        let c = heap.alloc(4).expect("alloc c");
        assert_eq!(a, c);
    }

    #[test]
    fn double_free_is_reported() {
        let mut heap = Heap::new(1024);
        let a = heap.alloc(3).expect("alloc");
        assert!(heap.free(a));
        assert!(!heap.free(a));
    }

    #[test]
    fn limit_is_enforced() {
        let mut heap = Heap::new(64);
        assert!(heap.alloc(32).is_some());
        assert!(heap.alloc(32).is_none());
    }
}
