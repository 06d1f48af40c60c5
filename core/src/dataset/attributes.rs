use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Dataset attribute bit set.
///
/// The low eight bits are stored in files with their historical values. `DENOISING` is a
/// runtime bit set while a denoising mask is enabled and is never written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Attributes(u32);

impl Attributes {
    pub const NONE: Attributes = Attributes(0);
    pub const SPARSE: Attributes = Attributes(1);
    pub const BOOLEAN: Attributes = Attributes(2);
    pub const COMPRESSED: Attributes = Attributes(4);
    pub const RECURRENT: Attributes = Attributes(8);
    pub const MUTABLE: Attributes = Attributes(16);
    pub const SPARSE_IGNORE_ZERO: Attributes = Attributes(32);
    pub const INDEXED: Attributes = Attributes(64);
    pub const WEIGHTED: Attributes = Attributes(128);
    pub const DENOISING: Attributes = Attributes(256);

    /// Bits that may appear in a file.
    pub const PERSISTENT: Attributes = Attributes(0xff);

    const NAMES: [(Attributes, &'static str); 9] = [
        (Attributes::SPARSE, "Sparse"),
        (Attributes::BOOLEAN, "Boolean"),
        (Attributes::COMPRESSED, "Compressed"),
        (Attributes::RECURRENT, "Recurrent"),
        (Attributes::MUTABLE, "Mutable"),
        (Attributes::SPARSE_IGNORE_ZERO, "SparseIgnoreZero"),
        (Attributes::INDEXED, "Indexed"),
        (Attributes::WEIGHTED, "Weighted"),
        (Attributes::DENOISING, "Denoising"),
    ];

    pub const fn from_bits(bits: u32) -> Self {
        Attributes(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Attributes) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Attributes) {
        self.0 &= !other.0;
    }

    /// The bits written to disk.
    pub const fn persistent(self) -> Attributes {
        Attributes(self.0 & Self::PERSISTENT.0)
    }
}

impl BitOr for Attributes {
    type Output = Attributes;
    fn bitor(self, rhs: Attributes) -> Attributes {
        Attributes(self.0 | rhs.0)
    }
}

impl BitOrAssign for Attributes {
    fn bitor_assign(&mut self, rhs: Attributes) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Attributes {
    type Output = Attributes;
    fn bitand(self, rhs: Attributes) -> Attributes {
        Attributes(self.0 & rhs.0)
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("None")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert_eq!(Attributes::SPARSE.bits(), 1);
        assert_eq!(Attributes::SPARSE_IGNORE_ZERO.bits(), 32);
        assert_eq!(Attributes::WEIGHTED.bits(), 128);
        assert_eq!(Attributes::DENOISING.bits(), 256);
    }

    #[test]
    fn test_contains_and_remove() {
        let mut a = Attributes::SPARSE | Attributes::BOOLEAN;
        assert!(a.contains(Attributes::SPARSE));
        assert!(!a.contains(Attributes::SPARSE | Attributes::INDEXED));
        a.insert(Attributes::DENOISING);
        assert_eq!(a.persistent(), Attributes::SPARSE | Attributes::BOOLEAN);
        a.remove(Attributes::BOOLEAN);
        assert!(!a.contains(Attributes::BOOLEAN));
    }

    #[test]
    fn test_display() {
        let a = Attributes::SPARSE | Attributes::BOOLEAN | Attributes::SPARSE_IGNORE_ZERO;
        assert_eq!(a.to_string(), "Sparse Boolean SparseIgnoreZero");
        assert_eq!(Attributes::NONE.to_string(), "None");
    }
}
