//! Bitmap data structure helper.

use std::fmt;

use crate::utils::BiphaseError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for u8 slot -> bool mapping, with dynamic growth and
/// removal of slots. Removing a slot shifts all higher slots down by one.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    /// Bit storage; capacity may exceed `size`, extra bits are kept false.
    bits: FixedBitSet,

    /// Current number of live slots.
    size: u8,
}

impl Bitmap {
    /// Creates a new bitmap of given size. If `ones` is true, all slots are
    /// marked true initially; otherwise, all slots are initially false.
    pub fn new(size: u8, ones: bool) -> Self {
        let mut bits = FixedBitSet::with_capacity(size as usize);
        if ones {
            bits.set_range(.., true);
        }
        Bitmap { bits, size }
    }

    /// Creates a new bitmap of given size from vec literal. Indices in the
    /// vec are bits to be set as true.
    pub fn from(size: u8, ones: Vec<u8>) -> Self {
        let mut bitmap = Self::new(size, false);

        for idx in ones {
            if let Err(e) = bitmap.set(idx, true) {
                panic!("{}", e);
            }
        }

        bitmap
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), BiphaseError> {
        if idx >= self.size {
            return Err(BiphaseError(format!("index {} out of bound", idx)));
        }
        self.bits.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, BiphaseError> {
        if idx >= self.size {
            return Err(BiphaseError(format!("index {} out of bound", idx)));
        }
        Ok(self.bits[idx as usize])
    }

    /// Appends one slot at the back, set to given flag.
    pub fn push(&mut self, flag: bool) {
        if (self.size as usize) >= self.bits.len() {
            self.bits.grow(self.size as usize + 1);
        }
        self.bits.set(self.size as usize, flag);
        self.size += 1;
    }

    /// Removes the slot at index, shifting all higher slots down by one.
    /// Returns the removed flag.
    pub fn remove(&mut self, idx: u8) -> Result<bool, BiphaseError> {
        if idx >= self.size {
            return Err(BiphaseError(format!("index {} out of bound", idx)));
        }
        let removed = self.bits[idx as usize];
        for i in (idx as usize)..(self.size as usize - 1) {
            let next = self.bits[i + 1];
            self.bits.set(i, next);
        }
        self.bits.set(self.size as usize - 1, false);
        self.size -= 1;
        Ok(removed)
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.size
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.bits.count_ones(..self.size as usize) as u8
    }

    /// Allows `for (id, bit) in map.iter()`.
    #[inline]
    pub fn iter(&self) -> BitmapIter {
        BitmapIter { map: self, idx: 0 }
    }
}

/// Iterator over `Bitmap`, yielding `(slot, bit)` pairs.
#[derive(Debug, Clone)]
pub struct BitmapIter<'m> {
    map: &'m Bitmap,
    idx: usize,
}

impl Iterator for BitmapIter<'_> {
    type Item = (u8, bool);

    fn next(&mut self) -> Option<Self::Item> {
        let id: u8 = self.idx as u8;
        if id < self.map.size() {
            self.idx += 1;
            Some((id, self.map.get(id).unwrap()))
        } else {
            None
        }
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        let mut first_idx = true;
        for i in self
            .iter()
            .filter_map(|(i, flag)| if flag { Some(i) } else { None })
        {
            if !first_idx {
                write!(f, ", {}", i)?;
            } else {
                write!(f, "{}", i)?;
                first_idx = false;
            }
        }
        write!(f, "]}}")
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn bitmap_set_get() {
        let mut map = Bitmap::new(7, false);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(1, false).is_ok());
        assert!(map.set(2, true).is_ok());
        assert!(map.set(7, true).is_err());
        assert_eq!(map.get(0), Ok(true));
        assert_eq!(map.get(1), Ok(false));
        assert_eq!(map.get(2), Ok(true));
        assert_eq!(map.get(3), Ok(false));
        assert!(map.get(7).is_err());
    }

    #[test]
    fn bitmap_count() {
        let mut map = Bitmap::new(7, false);
        assert_eq!(map.count(), 0);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(2, true).is_ok());
        assert!(map.set(3, true).is_ok());
        assert_eq!(map.count(), 3);
    }

    #[test]
    fn bitmap_push_remove() -> Result<(), BiphaseError> {
        let mut map = Bitmap::new(0, false);
        map.push(true);
        map.push(false);
        map.push(true);
        assert_eq!(map.size(), 3);
        assert_eq!(map.count(), 2);
        // removing the middle slot shifts the last one down
        assert_eq!(map.remove(1)?, false);
        assert_eq!(map.size(), 2);
        assert_eq!(map.get(0), Ok(true));
        assert_eq!(map.get(1), Ok(true));
        assert!(map.get(2).is_err());
        assert_eq!(map.remove(0)?, true);
        assert_eq!(map.remove(0)?, true);
        assert_eq!(map.size(), 0);
        assert!(map.remove(0).is_err());
        Ok(())
    }

    #[test]
    fn bitmap_iter() {
        let ref_map = [true, true, false, true, true];
        let mut map = Bitmap::new(5, true);
        assert!(map.set(2, false).is_ok());
        for (id, flag) in map.iter() {
            assert_eq!(ref_map[id as usize], flag);
        }
    }
}
