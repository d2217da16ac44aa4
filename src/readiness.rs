use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Readiness classes reported to the polling callback.
///
/// The same three classes are reported on every backend. On epoll a single
/// record may combine several classes; on kqueue each record carries exactly
/// one, and a record flagged end-of-file or error is reported as [`ERROR`]
/// instead of its plain filter class. Inspect masks through the accessors
/// rather than comparing against the constants.
///
/// [`ERROR`]: Readiness::ERROR
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Readiness(u8);

impl Readiness {
    /// The descriptor has data to read (includes urgent data on epoll).
    pub const READABLE: Readiness = Readiness(0b001);
    /// The descriptor accepts a write without blocking.
    pub const WRITABLE: Readiness = Readiness(0b010);
    /// Peer closed or a socket error is pending; reading will surface it.
    pub const ERROR: Readiness = Readiness(0b100);

    pub const fn empty() -> Readiness {
        Readiness(0)
    }

    #[inline(always)]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline(always)]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    #[inline(always)]
    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("(empty)");
        }
        let mut first = true;
        for (class, name) in [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::ERROR, "ERROR"),
        ] {
            if self.0 & class.0 != 0 {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_independent_bits() {
        let mask = Readiness::READABLE | Readiness::ERROR;
        assert!(mask.is_readable());
        assert!(mask.is_error());
        assert!(!mask.is_writable());
    }

    #[test]
    fn empty_mask_reports_nothing() {
        let mask = Readiness::empty();
        assert!(!mask.is_readable());
        assert!(!mask.is_writable());
        assert!(!mask.is_error());
    }

    #[test]
    fn debug_lists_the_set_classes() {
        assert_eq!(format!("{:?}", Readiness::READABLE), "READABLE");
        assert_eq!(
            format!("{:?}", Readiness::WRITABLE | Readiness::ERROR),
            "WRITABLE | ERROR"
        );
        assert_eq!(format!("{:?}", Readiness::empty()), "(empty)");
    }
}
