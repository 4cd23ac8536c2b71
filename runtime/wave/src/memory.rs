//! # Linear Memory
//!
//! One reservation sized to the memory's growth limit. Pages are committed
//! read-write as the memory grows, so the base address generated code holds
//! in `rsi` never moves.

use crate::platform::{PageBlock, Protection};
use crate::{WaveError, WASM_PAGE_SIZE};

const PAGE: usize = WASM_PAGE_SIZE as usize;

/// A module's linear memory.
#[derive(Debug)]
pub struct LinearMemory {
    block: Option<PageBlock>,
    pages: u32,
    limit: u32,
}

impl LinearMemory {
    /// Commit `initial` pages (or enough for `image`, if larger) and copy
    /// `image` to offset zero. Growth stops at `limit` pages.
    pub fn new(image: &[u8], initial: u32, limit: u32) -> Result<Self, WaveError> {
        let image_pages = u32::try_from(image.len().div_ceil(PAGE))
            .map_err(|_| WaveError::Resource("memory image too large".into()))?;
        let pages = initial.max(image_pages);
        let limit = limit.max(pages);

        let block = if limit == 0 {
            None
        } else {
            let size = limit as usize * PAGE;
            let block = PageBlock::reserve(None, size)
                .map_err(|err| WaveError::Resource(format!("reserve linear memory: {}", err)))?;
            Some(block)
        };

        let mut memory = Self {
            block,
            pages: 0,
            limit,
        };
        memory.commit(pages)?;
        memory.as_mut_slice()[..image.len()].copy_from_slice(image);
        log::debug!(
            "linear memory: {} pages committed, limit {}, image {} bytes",
            pages,
            limit,
            image.len()
        );
        Ok(memory)
    }

    fn commit(&mut self, pages: u32) -> Result<(), WaveError> {
        if pages > self.pages {
            if let Some(block) = &self.block {
                let start = self.pages as usize * PAGE;
                let len = (pages - self.pages) as usize * PAGE;
                block
                    .protect(start, len, Protection::READ_WRITE)
                    .map_err(|err| WaveError::Resource(format!("commit linear memory: {}", err)))?;
            }
            self.pages = pages;
        }
        Ok(())
    }

    /// Base address, or null when the memory can never hold a page.
    pub fn base(&self) -> *mut u8 {
        self.block
            .as_ref()
            .map_or(core::ptr::null_mut(), |block| block.base())
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Committed bytes.
    pub fn byte_len(&self) -> u64 {
        u64::from(self.pages) * WASM_PAGE_SIZE
    }

    /// Grow by `delta` pages. Returns the previous size, or `None` if the
    /// result would pass the limit or the pages cannot be committed.
    pub fn grow(&mut self, delta: u32) -> Option<u32> {
        let old = self.pages;
        let new = old.checked_add(delta).filter(|new| *new <= self.limit)?;
        match self.commit(new) {
            Ok(()) => {
                if delta != 0 {
                    log::debug!("memory.grow: {} -> {} pages", old, new);
                }
                Some(old)
            }
            Err(err) => {
                log::warn!("memory.grow by {} pages failed: {}", delta, err);
                None
            }
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.block {
            // SAFETY: the first `byte_len` bytes are committed read-write.
            Some(block) => unsafe {
                core::slice::from_raw_parts(block.base(), self.byte_len() as usize)
            },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &self.block {
            // SAFETY: as in `as_slice`, and `&mut self` makes the borrow unique.
            Some(block) => unsafe {
                core::slice::from_raw_parts_mut(block.base(), self.byte_len() as usize)
            },
            None => &mut [],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_is_copied_and_rest_zeroed() {
        let memory = LinearMemory::new(b"hello", 1, 4).unwrap();
        assert_eq!(memory.pages(), 1);
        assert_eq!(&memory.as_slice()[..5], b"hello");
        assert!(memory.as_slice()[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_image_larger_than_initial_commits_more() {
        let image = vec![7u8; PAGE + 1];
        let memory = LinearMemory::new(&image, 0, 0).unwrap();
        assert_eq!(memory.pages(), 2);
        assert_eq!(memory.limit(), 2);
        assert_eq!(memory.as_slice()[PAGE], 7);
    }

    #[test]
    fn test_grow_respects_limit() {
        let mut memory = LinearMemory::new(&[], 1, 3).unwrap();
        let base = memory.base();
        assert_eq!(memory.grow(0), Some(1));
        assert_eq!(memory.grow(2), Some(1));
        assert_eq!(memory.pages(), 3);
        assert_eq!(memory.grow(1), None);
        assert_eq!(memory.pages(), 3);
        assert_eq!(memory.base(), base);

        memory.as_mut_slice()[3 * PAGE - 1] = 1;
        assert_eq!(memory.as_slice()[3 * PAGE - 1], 1);
    }

    #[test]
    fn test_memoryless_module() {
        let mut memory = LinearMemory::new(&[], 0, 0).unwrap();
        assert!(memory.base().is_null());
        assert!(memory.as_slice().is_empty());
        assert_eq!(memory.grow(0), Some(0));
        assert_eq!(memory.grow(1), None);
    }
}
