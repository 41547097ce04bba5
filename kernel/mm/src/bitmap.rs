//! Heap-backed bitmap shared by zones and VM objects.
//!
//! Bits live in `u64` words; searches skip full words and use
//! `trailing_zeros()` (TZCNT/BSF on x86_64) inside a word.

use alloc::vec;
use alloc::vec::Vec;

const BITS_PER_WORD: usize = 64;

/// Fixed-length bitmap. Bit = 1 means set/used.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` clear bits.
    pub(crate) fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(BITS_PER_WORD)],
            len,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len, "bitmap index {index} out of range");
        self.words[index / BITS_PER_WORD] & (1u64 << (index % BITS_PER_WORD)) != 0
    }

    #[inline]
    pub(crate) fn set(&mut self, index: usize) {
        debug_assert!(index < self.len, "bitmap index {index} out of range");
        self.words[index / BITS_PER_WORD] |= 1u64 << (index % BITS_PER_WORD);
    }

    #[inline]
    pub(crate) fn clear(&mut self, index: usize) {
        debug_assert!(index < self.len, "bitmap index {index} out of range");
        self.words[index / BITS_PER_WORD] &= !(1u64 << (index % BITS_PER_WORD));
    }

    /// Sets or clears `index` according to `value`.
    #[inline]
    pub(crate) fn assign(&mut self, index: usize, value: bool) {
        if value {
            self.set(index);
        } else {
            self.clear(index);
        }
    }

    /// Sets `count` bits starting at `start`.
    pub(crate) fn set_range(&mut self, start: usize, count: usize) {
        for index in start..start + count {
            self.set(index);
        }
    }

    /// Returns the first clear bit at or after `start`.
    pub(crate) fn first_clear_from(&self, start: usize) -> Option<usize> {
        if start >= self.len {
            return None;
        }
        let mut word_idx = start / BITS_PER_WORD;
        // Pretend the bits below `start` in the first word are used.
        let mut word = self.words[word_idx] | ((1u64 << (start % BITS_PER_WORD)) - 1);
        loop {
            if word != u64::MAX {
                let index = word_idx * BITS_PER_WORD + (!word).trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
            word_idx += 1;
            if word_idx == self.words.len() {
                return None;
            }
            word = self.words[word_idx];
        }
    }

    /// Returns the start of the first run of `count` clear bits.
    pub(crate) fn find_clear_run(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.len {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        let mut index = 0;
        while index < self.len {
            let word_idx = index / BITS_PER_WORD;
            let word = self.words[word_idx];
            if index % BITS_PER_WORD == 0 && word == u64::MAX {
                run_len = 0;
                index += BITS_PER_WORD;
                continue;
            }
            if word & (1u64 << (index % BITS_PER_WORD)) != 0 {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = index;
                }
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
            index += 1;
        }
        None
    }

    /// Returns the number of set bits.
    pub(crate) fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates over the indices of set bits in ascending order.
    pub(crate) fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_idx, &word)| {
                let mut rest = word;
                core::iter::from_fn(move || {
                    if rest == 0 {
                        return None;
                    }
                    let bit = rest.trailing_zeros() as usize;
                    rest &= rest - 1;
                    Some(word_idx * BITS_PER_WORD + bit)
                })
            })
            .take_while(move |&index| index < self.len)
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("set", &self.count_ones())
            .finish()
    }
}
