//! Last-writer-wins conflict resolution.
//!
//! Every store decides whether an incoming record replaces what it holds for
//! the key by comparing `(version, origin)` stamps:
//!
//! - strictly higher version wins;
//! - equal version and equal origin is a duplicate delivery (no-op);
//! - equal version from different origins is broken by origin name, the
//!   lexicographically last one wins.
//!
//! The stamp stored for a key is whichever write last won, including writes
//! made locally and not yet pushed, so a pending local edit competes with an
//! incoming remote one on exactly the same terms. This picks a winner
//! deterministically; it does not merge payloads.

use crate::types::{Origin, Version};

/// What a store should do with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Store the record and its stamp.
    Apply,
    /// Already applied; leave everything untouched.
    Duplicate,
    /// The stored write wins; discard the record.
    KeepExisting,
}

/// Resolve an incoming stamp against the stamp stored for the same key.
pub fn resolve(incoming: (Version, Origin), existing: Option<(Version, Origin)>) -> Resolution {
    let Some(existing) = existing else {
        return Resolution::Apply;
    };

    if incoming == existing {
        Resolution::Duplicate
    } else if incoming > existing {
        Resolution::Apply
    } else {
        Resolution::KeepExisting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_write_applies() {
        assert_eq!(resolve((Version(1), Origin::Local), None), Resolution::Apply);
    }

    #[test]
    fn test_higher_version_wins() {
        let stored = Some((Version(2), Origin::Remote));
        assert_eq!(resolve((Version(3), Origin::Local), stored), Resolution::Apply);
        assert_eq!(resolve((Version(1), Origin::Remote), stored), Resolution::KeepExisting);
    }

    #[test]
    fn test_same_stamp_is_duplicate() {
        let stored = Some((Version(5), Origin::Local));
        assert_eq!(resolve((Version(5), Origin::Local), stored), Resolution::Duplicate);
    }

    #[test]
    fn test_tie_broken_by_origin() {
        assert_eq!(
            resolve((Version(4), Origin::Remote), Some((Version(4), Origin::Local))),
            Resolution::Apply
        );
        assert_eq!(
            resolve((Version(4), Origin::Local), Some((Version(4), Origin::Remote))),
            Resolution::KeepExisting
        );
    }

    fn origin() -> impl Strategy<Value = Origin> {
        prop_oneof![Just(Origin::Local), Just(Origin::Remote)]
    }

    /// Fold a sequence of stamps through the rule, returning the survivor.
    fn survivor(stamps: &[(Version, Origin)]) -> Option<(Version, Origin)> {
        stamps.iter().fold(None, |held, &s| match resolve(s, held) {
            Resolution::Apply => Some(s),
            _ => held,
        })
    }

    proptest! {
        #[test]
        fn test_order_does_not_matter(a in 1u64..100, b in 1u64..100, oa in origin(), ob in origin()) {
            let x = (Version(a), oa);
            let y = (Version(b), ob);
            prop_assert_eq!(survivor(&[x, y]), survivor(&[y, x]));
        }

        #[test]
        fn test_survivor_is_maximum(stamps in prop::collection::vec((1u64..50, origin()), 1..20)) {
            let stamps: Vec<_> = stamps.into_iter().map(|(v, o)| (Version(v), o)).collect();
            let max = stamps.iter().copied().max();
            prop_assert_eq!(survivor(&stamps), max);
        }

        #[test]
        fn test_reapply_is_noop(v in 1u64..1000, o in origin()) {
            let s = (Version(v), o);
            prop_assert_eq!(resolve(s, Some(s)), Resolution::Duplicate);
        }
    }
}
