use crate::isa::{Endian, Field};

/// How a value fits into a [`Field`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    Exact,
    /// A negative value stored in an unsigned field as two's complement.
    Wrapped,
    Overflow,
}

impl Field {
    pub fn mask(self) -> u64 {
        if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        }
    }

    /// The inclusive range of values this field encodes without wrapping.
    pub fn range(self) -> (i128, i128) {
        let width = u32::from(self.width);
        if self.signed {
            (-(1i128 << (width - 1)), (1i128 << (width - 1)) - 1)
        } else {
            (0, (1i128 << width) - 1)
        }
    }

    pub fn check(self, value: i64) -> Fit {
        let (low, high) = self.range();
        let value = i128::from(value);
        if (low..=high).contains(&value) {
            Fit::Exact
        } else if !self.signed && value < 0 && value >= -(1i128 << (u32::from(self.width) - 1)) {
            Fit::Wrapped
        } else {
            Fit::Overflow
        }
    }

    /// ORs the low `width` bits of `value` into `word` at this field's position.
    pub fn insert(self, word: u64, value: i64) -> u64 {
        word | ((value as u64) & self.mask()) << self.shift
    }
}

/// Serializes the low `size` bytes of `word`.
pub fn word_bytes(word: u64, size: u8, endian: Endian) -> Vec<u8> {
    let size = usize::from(size).min(8);
    match endian {
        Endian::Little => word.to_le_bytes()[..size].to_vec(),
        Endian::Big => word.to_be_bytes()[8 - size..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(shift: u8, width: u8, signed: bool) -> Field {
        Field {
            shift,
            width,
            signed,
        }
    }

    #[test]
    fn unsigned_fields() {
        let f = field(0, 8, false);
        assert_eq!(f.check(0), Fit::Exact);
        assert_eq!(f.check(255), Fit::Exact);
        assert_eq!(f.check(256), Fit::Overflow);
        assert_eq!(f.check(-1), Fit::Wrapped);
        assert_eq!(f.check(-128), Fit::Wrapped);
        assert_eq!(f.check(-129), Fit::Overflow);
    }

    #[test]
    fn signed_fields() {
        let f = field(0, 5, true);
        assert_eq!(f.range(), (-16, 15));
        assert_eq!(f.check(-16), Fit::Exact);
        assert_eq!(f.check(15), Fit::Exact);
        assert_eq!(f.check(16), Fit::Overflow);
        assert_eq!(f.check(-17), Fit::Overflow);
    }

    #[test]
    fn full_width_fields() {
        let f = field(0, 64, false);
        assert_eq!(f.mask(), u64::MAX);
        assert_eq!(f.check(i64::MAX), Fit::Exact);
        assert_eq!(f.insert(0, -1), u64::MAX);
    }

    #[test]
    fn insert_masks_and_shifts() {
        let f = field(5, 3, false);
        assert_eq!(f.insert(0x6000, 2), 0x6040);
        // Only the low bits of a negative value land in the field.
        assert_eq!(field(0, 5, true).insert(0x6000, -1), 0x601F);
    }

    #[test]
    fn byte_order() {
        assert_eq!(word_bytes(0x02_0010, 3, Endian::Big), vec![0x02, 0x00, 0x10]);
        assert_eq!(
            word_bytes(0x02_0010, 3, Endian::Little),
            vec![0x10, 0x00, 0x02]
        );
        assert_eq!(word_bytes(0xAB, 1, Endian::Big), vec![0xAB]);
    }
}
