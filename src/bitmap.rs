use bytes::Bytes;

/// A growable set of `u32` indices backed by 64-bit words.
///
/// Used for dirty chunks, the pieces a peer claims, completed pieces and the
/// pieces covered by readers. Conversion to and from the wire bitfield format
/// numbers bits from the high bit of the first byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    count: usize,
}

impl Bitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a wire bitfield, ignoring bits at or beyond `limit`.
    pub fn from_wire(bytes: &[u8], limit: u32) -> Self {
        let mut bm = Self::new();
        for (byte_index, byte) in bytes.iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            for bit in 0..8 {
                let index = (byte_index * 8 + bit) as u32;
                if index >= limit {
                    return bm;
                }
                if (byte >> (7 - bit)) & 1 == 1 {
                    bm.insert(index);
                }
            }
        }
        bm
    }

    /// Encodes the first `num_bits` indices as a wire bitfield.
    pub fn to_wire(&self, num_bits: u32) -> Bytes {
        let mut out = vec![0u8; (num_bits as usize).div_ceil(8)];
        for index in self.iter().take_while(|&i| i < num_bits) {
            out[index as usize / 8] |= 0x80 >> (index % 8);
        }
        Bytes::from(out)
    }

    pub fn contains(&self, index: u32) -> bool {
        let (word, bit) = Self::locate(index);
        self.words
            .get(word)
            .is_some_and(|w| (w >> bit) & 1 == 1)
    }

    /// Adds an index. Returns true if it was not already present.
    pub fn insert(&mut self, index: u32) -> bool {
        let (word, bit) = Self::locate(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        if self.words[word] & mask != 0 {
            return false;
        }
        self.words[word] |= mask;
        self.count += 1;
        true
    }

    /// Removes an index. Returns true if it was present.
    pub fn remove(&mut self, index: u32) -> bool {
        let (word, bit) = Self::locate(index);
        let Some(w) = self.words.get_mut(word) else {
            return false;
        };
        let mask = 1u64 << bit;
        if *w & mask == 0 {
            return false;
        }
        *w &= !mask;
        self.count -= 1;
        true
    }

    pub fn set(&mut self, index: u32, present: bool) {
        if present {
            self.insert(index);
        } else {
            self.remove(index);
        }
    }

    /// Adds every index in `[begin, end)`.
    pub fn insert_range(&mut self, begin: u32, end: u32) {
        for i in begin..end {
            self.insert(i);
        }
    }

    /// Removes every index in `[begin, end)`.
    pub fn remove_range(&mut self, begin: u32, end: u32) {
        for i in begin..end {
            self.remove(i);
        }
    }

    /// Number of indices present.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.count = 0;
    }

    /// Iterates present indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(i, &word)| Bits {
                word,
                base: i as u32 * 64,
            })
    }

    fn locate(index: u32) -> (usize, u32) {
        ((index / 64) as usize, index % 64)
    }
}

struct Bits {
    word: u64,
    base: u32,
}

impl Iterator for Bits {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.word == 0 {
            return None;
        }
        let tz = self.word.trailing_zeros();
        self.word &= self.word - 1;
        Some(self.base + tz)
    }
}

impl FromIterator<u32> for Bitmap {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut bm = Self::new();
        for i in iter {
            bm.insert(i);
        }
        bm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_count() {
        let mut bm = Bitmap::new();
        assert!(bm.insert(0));
        assert!(bm.insert(99));
        assert!(!bm.insert(99));
        assert_eq!(bm.len(), 2);
        assert!(bm.remove(0));
        assert!(!bm.remove(0));
        assert!(!bm.remove(10_000));
        assert_eq!(bm.iter().collect::<Vec<_>>(), vec![99]);
    }

    #[test]
    fn test_ranges() {
        let mut bm = Bitmap::new();
        bm.insert_range(60, 70);
        assert_eq!(bm.len(), 10);
        bm.remove_range(62, 68);
        assert_eq!(bm.iter().collect::<Vec<_>>(), vec![60, 61, 68, 69]);
    }

    #[test]
    fn test_wire_format() {
        let bm = Bitmap::from_wire(&[0x80, 0x01], 16);
        assert!(bm.contains(0));
        assert!(!bm.contains(1));
        assert!(bm.contains(15));
        assert_eq!(bm.to_wire(16).as_ref(), &[0x80, 0x01]);

        let truncated = Bitmap::from_wire(&[0xff], 3);
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated.to_wire(3).as_ref(), &[0xe0]);
    }
}
