//! Guest register identities.

use std::fmt;

/// Number of general-purpose registers.
pub const NUM_GPRS: usize = 32;
/// Number of floating-point registers.
pub const NUM_FPRS: usize = 32;

/// A PowerPC guest register as the engine addresses it.
///
/// GPRs and FPRs are stored as 64-bit values; `cr`, `xer` and `fpscr`
/// only use their low 32 bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Register {
    Gpr(u8),
    Fpr(u8),
    Pc,
    Msr,
    Cr,
    Lr,
    Ctr,
    Xer,
    Fpscr,
}

impl Register {
    /// Whether the register index is in range for its bank.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        match self {
            Self::Gpr(n) => (n as usize) < NUM_GPRS,
            Self::Fpr(n) => (n as usize) < NUM_FPRS,
            _ => true,
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpr(n) => write!(f, "r{n}"),
            Self::Fpr(n) => write!(f, "f{n}"),
            Self::Pc => f.write_str("pc"),
            Self::Msr => f.write_str("msr"),
            Self::Cr => f.write_str("cr"),
            Self::Lr => f.write_str("lr"),
            Self::Ctr => f.write_str("ctr"),
            Self::Xer => f.write_str("xer"),
            Self::Fpscr => f.write_str("fpscr"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_names() {
        assert_eq!(Register::Gpr(3).to_string(), "r3");
        assert_eq!(Register::Fpr(31).to_string(), "f31");
        assert_eq!(Register::Fpscr.to_string(), "fpscr");
    }

    #[test]
    fn test_register_validity() {
        assert!(Register::Gpr(31).is_valid());
        assert!(!Register::Gpr(32).is_valid());
        assert!(!Register::Fpr(40).is_valid());
        assert!(Register::Lr.is_valid());
    }
}
