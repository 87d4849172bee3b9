use std::sync::atomic::{AtomicU64, Ordering};

/// A fixed-size bitmap of atomic words.
///
/// Bits are set and cleared with relaxed ordering; the stop-the-world
/// discipline orders them against the phases that read them.
pub struct Bitmap {
    words: Box<[AtomicU64]>,
    bits: usize,
}

impl Bitmap {
    pub fn new(bits: usize) -> Self {
        let words = bits.div_ceil(64);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.bits
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.bits);
        let word = self.words[index / 64].load(Ordering::Relaxed);
        word & (1 << (index % 64)) != 0
    }

    /// Set the bit and return whether it was previously clear.
    #[inline(always)]
    pub fn set(&self, index: usize) -> bool {
        debug_assert!(index < self.bits);
        let mask = 1 << (index % 64);
        self.words[index / 64].fetch_or(mask, Ordering::Relaxed) & mask == 0
    }

    /// Clear the bit and return whether it was previously set.
    #[inline(always)]
    pub fn clear(&self, index: usize) -> bool {
        debug_assert!(index < self.bits);
        let mask = 1 << (index % 64);
        self.words[index / 64].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Clear the bits in `[from, to)`.
    pub fn clear_range(&self, from: usize, to: usize) {
        let to = to.min(self.bits);
        let mut index = from;
        while index < to {
            if index % 64 == 0 && index + 64 <= to {
                self.words[index / 64].store(0, Ordering::Relaxed);
                index += 64;
            } else {
                self.clear(index);
                index += 1;
            }
        }
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| w.load(Ordering::Relaxed) != 0)
    }

    /// Whether any bit in `[from, to)` is set.
    pub fn any_in(&self, from: usize, to: usize) -> bool {
        (from..to.min(self.bits)).any(|i| self.get(i))
    }

    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Indices of all set bits, in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            let mut bits = word.load(Ordering::Relaxed);
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                Some(i * 64 + tz)
            })
        })
    }
}

impl core::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Bitmap")
            .field("bits", &self.bits)
            .field("set", &self.count_ones())
            .finish()
    }
}
