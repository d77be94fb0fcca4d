// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::header::{WriterId, MAX_WRITER_ID};

const WORDS: usize = (MAX_WRITER_ID as usize + 1).div_ceil(u64::BITS as usize);

/// Bitmap of the writer ids in use. Bit 0 is never set.
///
/// Not synchronized: the arbiter keeps it behind its mutex.
#[derive(Debug, Clone, Default)]
pub(crate) struct WriterIdAllocator {
    bits: [u64; WORDS],
    in_use: usize,
}

impl WriterIdAllocator {
    /// Takes the lowest free id, or `None` if all `MAX_WRITER_ID` ids are held.
    pub(crate) fn allocate(&mut self) -> Option<WriterId> {
        for (word_idx, word) in self.bits.iter_mut().enumerate() {
            // Id 0 is reserved, treat it as permanently taken.
            let taken = if word_idx == 0 { *word | 1 } else { *word };
            if taken == u64::MAX {
                continue;
            }
            let bit = taken.trailing_ones() as usize;
            let id = word_idx * u64::BITS as usize + bit;
            let writer_id = WriterId::new(u16::try_from(id).ok()?)?;
            *word |= 1 << bit;
            self.in_use += 1;
            return Some(writer_id);
        }
        None
    }

    /// Returns `false` if `id` was not allocated.
    pub(crate) fn free(&mut self, id: WriterId) -> bool {
        let id = id.get() as usize;
        let (word_idx, bit) = (id / u64::BITS as usize, id % u64::BITS as usize);
        let word = &mut self.bits[word_idx];
        if *word & (1 << bit) == 0 {
            return false;
        }
        *word &= !(1 << bit);
        self.in_use -= 1;
        true
    }

    #[cfg(test)]
    fn is_allocated(&self, id: WriterId) -> bool {
        let id = id.get() as usize;
        self.bits[id / u64::BITS as usize] & (1 << (id % u64::BITS as usize)) != 0
    }

    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }
}
