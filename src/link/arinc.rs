//! ARINC-429-like avionics word.
//!
//! Bit layout of the 32 bit word (bit 0 is the least significant):
//!
//! ```text
//!   31   30..29  28..........10  9..8   7....0
//!   P    SSM     DATA (19 bit)   SDI    LABEL
//! ```
//!
//! `P` makes the population count of the whole word odd.

pub const LABEL_MASK: u32 = 0xFF;
pub const SDI_MASK: u32 = 0x3;
pub const DATA_MASK: u32 = 0x7_FFFF;
pub const SSM_MASK: u32 = 0x3;
pub const PARITY_BIT: u32 = 1 << 31;

/// Decoded fields of an avionics word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArincWord {
    pub label: u8,
    pub sdi: u8,
    pub data: u32,
    pub ssm: u8,
}

impl ArincWord {
    pub fn new(label: u8, sdi: u8, data: u32, ssm: u8) -> Self {
        Self {
            label,
            sdi,
            data,
            ssm,
        }
    }

    /// Packs the fields and sets bit 31 for odd parity.
    ///
    /// Out of range fields are truncated to their bit width. With
    /// `force_bad_parity` the parity bit is inverted.
    pub fn pack(&self, force_bad_parity: bool) -> u32 {
        let mut word = u32::from(self.label) & LABEL_MASK;
        word |= (u32::from(self.sdi) & SDI_MASK) << 8;
        word |= (self.data & DATA_MASK) << 10;
        word |= (u32::from(self.ssm) & SSM_MASK) << 29;

        let mut parity = odd_parity_bit(word);
        if force_bad_parity {
            parity ^= 1;
        }
        word | (parity << 31)
    }

    /// Splits a raw word into its fields. The parity bit is not checked.
    pub fn unpack(word: u32) -> Self {
        Self {
            label: label(word),
            sdi: ((word >> 8) & SDI_MASK) as u8,
            data: (word >> 10) & DATA_MASK,
            ssm: ((word >> 29) & SSM_MASK) as u8,
        }
    }
}

/// Parity bit value that makes bits 0..=30 plus the parity bit odd.
pub fn odd_parity_bit(word: u32) -> u32 {
    u32::from((word & !PARITY_BIT).count_ones() % 2 == 0)
}

/// True when the population count of all 32 bits is odd.
pub fn has_odd_parity(word: u32) -> bool {
    word.count_ones() % 2 == 1
}

pub fn label(word: u32) -> u8 {
    (word & LABEL_MASK) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_fields_into_place() {
        let word = ArincWord::new(0x12, 1, 0x12345, 2).pack(false);
        assert_eq!(word & LABEL_MASK, 0x12);
        assert_eq!((word >> 8) & SDI_MASK, 1);
        assert_eq!((word >> 10) & DATA_MASK, 0x12345);
        assert_eq!((word >> 29) & SSM_MASK, 2);
        assert!(has_odd_parity(word));
    }

    #[test]
    fn forced_bad_parity_fails_check() {
        let word = ArincWord::new(0x01, 0, 0x55, 0).pack(true);
        assert!(!has_odd_parity(word));
    }

    #[test]
    fn unpack_inverts_pack() {
        let original = ArincWord::new(0xA3, 2, 0x7_0F0F, 3);
        assert_eq!(ArincWord::unpack(original.pack(false)), original);
    }

    #[test]
    fn oversized_fields_are_truncated() {
        let word = ArincWord::new(0xFF, 0xFF, u32::MAX, 0xFF).pack(false);
        let fields = ArincWord::unpack(word);
        assert_eq!(fields, ArincWord::new(0xFF, 3, DATA_MASK, 3));
    }

    #[test]
    fn parity_bit_for_zero_word_is_set() {
        assert_eq!(ArincWord::default().pack(false), PARITY_BIT);
    }
}
