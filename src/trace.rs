//! Trace category mask.
//!
//! The source lets an operator select which categories of debug output to
//! emit (`freeze`, `grab`, `prep`, ...). Here, each category gates a
//! [`tracing`] event at `debug` level under a target named after the
//! category, so selecting a category is equivalent to enabling that target
//! in a `tracing-subscriber` filter.

use bitflags::bitflags;

bitflags! {
    /// Categories of trace output an operator can select via `attrs`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TraceMask: u32 {
        /// Freeze stage (C4) activity.
        const FREEZE   = 1 << 0;
        /// "map free space" calls.
        const GRAB     = 1 << 1;
        /// Prepare stage of the driver.
        const PREP     = 1 << 2;
        /// Target selection.
        const TARGET   = 1 << 3;
        /// Dedupe-path migration.
        const DEDUPE   = 1 << 4;
        /// Exchange-path migration.
        const EXCHANGE = 1 << 5;
        /// Metadata rebuild.
        const REBUILD  = 1 << 6;
        /// Efficacy reporting.
        const EFFICACY = 1 << 7;
        /// Request setup/teardown.
        const SETUP    = 1 << 8;
        /// Helper file creation.
        const DUMPFILE = 1 << 9;
        /// Visited bitmap mutations.
        const BITMAP   = 1 << 10;
        /// Raw fsmap query records.
        const FSMAP    = 1 << 11;
        /// Raw fsrefs query records.
        const FSREFS   = 1 << 12;
        /// Raw bmapx query records.
        const BMAPX    = 1 << 13;
        /// Allocation/falloc calls.
        const FALLOC   = 1 << 14;
        /// Overall run status.
        const STATUS   = 1 << 15;
    }
}

impl TraceMask {
    /// The "all" category: every bit set.
    pub fn all_categories() -> Self {
        Self::all()
    }

    /// Parses a comma-separated list of category names, as would be typed on
    /// a `--trace` command line flag. Unknown names are ignored.
    pub fn parse_list(s: &str) -> Self {
        let mut mask = Self::empty();
        for word in s.split(',').map(str::trim) {
            mask |= match word {
                "all" => Self::all_categories(),
                "freeze" => Self::FREEZE,
                "grab" => Self::GRAB,
                "prep" => Self::PREP,
                "target" => Self::TARGET,
                "dedupe" => Self::DEDUPE,
                "exchange" => Self::EXCHANGE,
                "rebuild" => Self::REBUILD,
                "efficacy" => Self::EFFICACY,
                "setup" => Self::SETUP,
                "dumpfile" => Self::DUMPFILE,
                "bitmap" => Self::BITMAP,
                "fsmap" => Self::FSMAP,
                "fsrefs" => Self::FSREFS,
                "bmapx" => Self::BMAPX,
                "falloc" => Self::FALLOC,
                "status" => Self::STATUS,
                _ => Self::empty(),
            };
        }
        mask
    }
}

/// Emits a `debug`-level trace event for `category` if it is selected in
/// `mask`.
macro_rules! trace_cat {
    ($mask:expr, $category:ident, $($arg:tt)*) => {
        if $mask.contains($crate::trace::TraceMask::$category) {
            tracing::debug!(target: stringify!($category), $($arg)*);
        }
    };
}
pub(crate) use trace_cat;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_single() {
        assert_eq!(TraceMask::parse_list("freeze"), TraceMask::FREEZE);
    }

    #[test]
    fn parse_multiple() {
        let mask = TraceMask::parse_list("freeze, grab");
        assert!(mask.contains(TraceMask::FREEZE));
        assert!(mask.contains(TraceMask::GRAB));
        assert!(!mask.contains(TraceMask::REBUILD));
    }

    #[test]
    fn parse_all() {
        assert_eq!(TraceMask::parse_list("all"), TraceMask::all_categories());
    }

    #[test]
    fn parse_unknown_ignored() {
        assert_eq!(TraceMask::parse_list("bogus"), TraceMask::empty());
    }
}
