use core::fmt;

/// Sign extend the low `bits` bits of `value` to a full i64
#[inline(always)]
pub fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

#[inline(always)]
pub fn sext8(value: u16) -> u16 {
    value as u8 as i8 as i16 as u16
}

/// Wraps a 64 bit value to 40 bits and sign extends it back
#[inline(always)]
pub fn wrap40(value: i64) -> i64 {
    sign_extend(value as u64, 40)
}

/// Bitmask over the 16 host registers
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct RegMask16 {
    mask: u16,
}

impl RegMask16 {
    #[inline(always)]
    pub fn new(mask: u16) -> Self {
        RegMask16 { mask }
    }

    #[inline(always)]
    pub fn set(&mut self, idx: usize) {
        self.mask |= 1 << idx;
    }

    #[inline(always)]
    pub fn clear(&mut self, idx: usize) {
        self.mask &= !(1 << idx);
    }

    #[inline(always)]
    pub fn contains(&self, idx: usize) -> bool {
        self.mask & (1 << idx) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    pub fn count(&self) -> u32 {
        self.mask.count_ones()
    }

    /// Iterates set bits, lowest first
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = usize> {
        let mask = self.mask;
        (0..16).filter(move |i| mask & (1 << i) != 0)
    }
}

impl fmt::Debug for RegMask16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegMask16({:016b})", self.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0x80_0000_0000, 40), -0x80_0000_0000);
        assert_eq!(sign_extend(0x7f_ffff_ffff, 40), 0x7f_ffff_ffff);
        assert_eq!(sext8(0x0080), 0xff80);
        assert_eq!(sext8(0x127f), 0x007f);
        assert_eq!(wrap40(0x80_0000_0000), -0x80_0000_0000);
    }

    #[test]
    fn reg_mask() {
        let mut mask = RegMask16::default();
        mask.set(3);
        mask.set(9);
        assert!(mask.contains(9));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![3, 9]);
        assert_eq!(mask.iter().rev().next(), Some(9));
        mask.clear(3);
        assert_eq!(mask.count(), 1);
    }
}
