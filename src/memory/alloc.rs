use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default)]
struct FreeEntries {
    sizes: BTreeMap<usize, IndexSet<usize>>, //<size,<addrs>>
    addrs: BTreeMap<usize, usize>,           //<addr,size>
}

impl FreeEntries {
    fn insert(&mut self, addr: usize, size: usize) {
        self.addrs.insert(addr, size);
        self.sizes.entry(size).or_default().insert(addr);
    }

    fn remove(&mut self, addr: usize, size: usize) {
        self.addrs.remove(&addr);
        let mut remove_size = false;
        if let Some(addrs) = self.sizes.get_mut(&size) {
            addrs.shift_remove(&addr);
            remove_size = addrs.is_empty();
        }
        if remove_size {
            self.sizes.remove(&size);
        }
    }
}

#[derive(Debug, Default)]
struct AllocState {
    free: FreeEntries,
    allocated: BTreeMap<usize, usize>, //<addr,size>
}

/// Best fit allocator over an address range, with neighbouring free blocks merged on release.
///
/// Never blocks: a request that does not fit returns `None` and the caller decides what to do.
#[derive(Debug)]
pub(crate) struct BestFitAlloc {
    state: Mutex<AllocState>,
    start_addr: usize,
    max_size: usize,
    id: String,
}

impl BestFitAlloc {
    pub(crate) fn new(id: String, start_addr: usize, size: usize) -> BestFitAlloc {
        let mut state = AllocState::default();
        if size > 0 {
            state.free.insert(start_addr, size);
        }
        BestFitAlloc {
            state: Mutex::new(state),
            start_addr,
            max_size: size,
            id,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.max_size
    }

    pub(crate) fn try_malloc(&self, size: usize) -> Option<usize> {
        let size = size.max(1);
        let mut state = self.state.lock();
        //find smallest free segment greater than or equal to size
        let (free_size, addr) = match state.free.sizes.range(size..).next() {
            Some((free_size, addrs)) => (*free_size, *addrs.first()?),
            None => return None,
        };
        state.free.remove(addr, free_size);
        if free_size > size {
            state.free.insert(addr + size, free_size - size);
        }
        state.allocated.insert(addr, size);
        Some(addr)
    }

    /// Returns false if `addr` is not currently allocated
    pub(crate) fn free(&self, addr: usize) -> bool {
        let mut state = self.state.lock();
        let size = match state.allocated.remove(&addr) {
            Some(size) => size,
            None => {
                tracing::error!(allocator = %self.id, addr, "illegal free, addr not currently allocated");
                return false;
            }
        };
        let mut merged_addr = addr;
        let mut merged_size = size;
        let before = state
            .free
            .addrs
            .range(..addr)
            .next_back()
            .map(|(a, s)| (*a, *s));
        if let Some((faddr, fsize)) = before {
            if faddr + fsize == addr {
                state.free.remove(faddr, fsize);
                merged_addr = faddr;
                merged_size += fsize;
            }
        }
        let after = state.free.addrs.range(addr..).next().map(|(a, s)| (*a, *s));
        if let Some((faddr, fsize)) = after {
            if merged_addr + merged_size == faddr {
                state.free.remove(faddr, fsize);
                merged_size += fsize;
            }
        }
        state.free.insert(merged_addr, merged_size);
        true
    }

    pub(crate) fn allocated_bytes(&self) -> usize {
        self.state.lock().allocated.values().sum()
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.start_addr && addr < self.start_addr + self.max_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit_malloc_free() {
        let alloc = BestFitAlloc::new("test_malloc_free".to_string(), 0, 1000);
        assert_eq!(alloc.try_malloc(50), Some(0));
        assert_eq!(alloc.try_malloc(10), Some(50));
        assert_eq!(alloc.try_malloc(600), Some(60));
        assert_eq!(alloc.try_malloc(10), Some(660));
        assert!(alloc.free(0));
        assert_eq!(alloc.try_malloc(30), Some(0));
        assert!(alloc.free(50));
        // the freed block at 50 merged with the 20 byte tail at 30
        assert_eq!(alloc.try_malloc(10), Some(30));
        assert_eq!(alloc.try_malloc(10), Some(40));
        assert_eq!(alloc.try_malloc(10), Some(50));
        assert_eq!(alloc.try_malloc(400), None);
        assert_eq!(alloc.allocated_bytes(), 30 + 10 + 10 + 10 + 600 + 10);
    }

    #[test]
    fn neighbours_coalesce() {
        let alloc = BestFitAlloc::new("test_coalesce".to_string(), 100, 300);
        let a = alloc.try_malloc(100).expect("a");
        let b = alloc.try_malloc(100).expect("b");
        let c = alloc.try_malloc(100).expect("c");
        assert_eq!(alloc.try_malloc(1), None);
        assert!(alloc.free(a));
        assert!(alloc.free(c));
        assert_eq!(alloc.try_malloc(200), None);
        assert!(alloc.free(b));
        assert_eq!(alloc.try_malloc(300), Some(100));
        assert!(!alloc.free(150));
        assert!(alloc.contains(399));
        assert!(!alloc.contains(400));
    }
}
