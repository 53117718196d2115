use crate::error::{HsaError, HsaResult};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::error;

/// A tracked range and whatever the binding needs to tear it down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping<T> {
    pub addr: usize,
    pub size: usize,
    pub info: T,
}

impl<T> Mapping<T> {
    #[must_use]
    pub const fn end(&self) -> usize {
        self.addr.saturating_add(self.size)
    }

    #[must_use]
    pub const fn contains(&self, addr: usize, size: usize) -> bool {
        match addr.checked_add(size) {
            Some(end) => addr >= self.addr && end <= self.end(),
            None => false,
        }
    }

    /// A range running past the end of the address space overlaps everything above `addr`.
    #[must_use]
    pub const fn overlaps(&self, addr: usize, size: usize) -> bool {
        addr < self.end() && self.addr < addr.saturating_add(size)
    }
}

/// Driver handle ↔ virtual address bookkeeping.
///
/// Both directions are updated together; a handle or an address can only be
/// present in one live entry at a time.
#[derive(Debug)]
pub struct HandleTable<H, T = ()> {
    by_handle: HashMap<H, Mapping<T>>,
    by_addr: HashMap<usize, H>,
}

impl<H, T> Default for HandleTable<H, T> {
    fn default() -> Self {
        Self {
            by_handle: HashMap::new(),
            by_addr: HashMap::new(),
        }
    }
}

impl<H, T> HandleTable<H, T>
where
    H: Copy + Eq + Hash + Debug,
    T: Copy,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new `handle` ↔ `addr` pair.
    ///
    /// # Errors
    /// `Internal` if either side is already tracked; nothing is inserted in that case.
    pub fn insert(&mut self, handle: H, addr: usize, size: usize, info: T) -> HsaResult<()> {
        if self.by_handle.contains_key(&handle) || self.by_addr.contains_key(&addr) {
            error!(?handle, addr, "handle table entry reused");
            return Err(HsaError::Internal(format!(
                "handle {handle:?} or address {addr:#x} is already tracked"
            )));
        }
        self.by_handle.insert(handle, Mapping { addr, size, info });
        self.by_addr.insert(addr, handle);
        Ok(())
    }

    pub fn remove_by_addr(&mut self, addr: usize) -> Option<(H, Mapping<T>)> {
        let handle = self.by_addr.remove(&addr)?;
        let mapping = self.by_handle.remove(&handle)?;
        Some((handle, mapping))
    }

    pub fn remove_by_handle(&mut self, handle: H) -> Option<Mapping<T>> {
        let mapping = self.by_handle.remove(&handle)?;
        self.by_addr.remove(&mapping.addr);
        Some(mapping)
    }

    #[must_use]
    pub fn handle_of(&self, addr: usize) -> Option<H> {
        self.by_addr.get(&addr).copied()
    }

    #[must_use]
    pub fn get(&self, handle: H) -> Option<&Mapping<T>> {
        self.by_handle.get(&handle)
    }

    #[must_use]
    pub fn contains_handle(&self, handle: H) -> bool {
        self.by_handle.contains_key(&handle)
    }

    /// Finds the entry whose range holds `[addr, addr + size)`.
    ///
    /// Exact base addresses resolve in O(1); interior pointers fall back to a scan.
    #[must_use]
    pub fn find_containing(&self, addr: usize, size: usize) -> Option<(H, &Mapping<T>)> {
        if let Some(&handle) = self.by_addr.get(&addr) {
            let mapping = &self.by_handle[&handle];
            return mapping.contains(addr, size).then_some((handle, mapping));
        }
        self.by_handle
            .iter()
            .find(|(_, m)| m.contains(addr, size))
            .map(|(h, m)| (*h, m))
    }

    #[must_use]
    pub fn overlaps(&self, addr: usize, size: usize) -> bool {
        self.by_handle.values().any(|m| m.overlaps(addr, size))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }

    #[must_use]
    pub fn handle_mappings(&self) -> HashMap<H, usize> {
        self.by_handle.iter().map(|(h, m)| (*h, m.addr)).collect()
    }

    #[must_use]
    pub fn addr_mappings(&self) -> HashMap<usize, H> {
        self.by_addr.clone()
    }

    /// Empties the table, handing back every entry.
    pub fn drain(&mut self) -> Vec<(H, Mapping<T>)> {
        self.by_addr.clear();
        self.by_handle.drain().collect()
    }

    /// Whether the two directions describe the same set of pairs.
    #[must_use]
    pub fn is_bijective(&self) -> bool {
        self.by_handle.len() == self.by_addr.len()
            && self
                .by_handle
                .iter()
                .all(|(h, m)| self.by_addr.get(&m.addr) == Some(h))
    }
}
