//! Immutable snapshot chain.
//!
//! A revision stores only the quarks that changed relative to its
//! predecessor; lookups walk the `previous` chain until they find an entry
//! or run out of history. Revisions are shared freely between checkouts, so
//! a branch is just another pointer into the same chain.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::ident::Ident;
use crate::quark::{Quark, QuarkData};

/// One immutable snapshot of the graph.
///
/// The scope map is behind a lock for a single reason: filling in the result
/// of a lazy calculation replaces a `Pending` entry in place. That value is
/// derived deterministically from data already visible in the chain, so the
/// fill-in is observationally pure and safe even when the revision is shared
/// by several branches.
pub struct Revision<V> {
    created_at: u64,
    previous: Option<Arc<Revision<V>>>,
    scope: RwLock<AHashMap<Ident, Arc<Quark<V>>>>,
}

impl<V> Revision<V> {
    /// The empty base revision of a fresh checkout.
    pub(crate) fn baseline(created_at: u64) -> Self {
        Self {
            created_at,
            previous: None,
            scope: RwLock::new(AHashMap::new()),
        }
    }

    /// A new revision on top of `previous` holding the quarks of one
    /// committed transaction.
    pub(crate) fn next(
        previous: Arc<Revision<V>>,
        created_at: u64,
        scope: AHashMap<Ident, Arc<Quark<V>>>,
    ) -> Self {
        Self {
            created_at,
            previous: Some(previous),
            scope: RwLock::new(scope),
        }
    }

    /// The revision clock value at which this revision was created.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// The previous revision in the chain, if any.
    pub fn previous(&self) -> Option<&Arc<Revision<V>>> {
        self.previous.as_ref()
    }

    /// This revision's own entry for `ident`, without walking the chain.
    pub(crate) fn own_quark(&self, ident: Ident) -> Option<Arc<Quark<V>>> {
        self.scope.read().get(&ident).cloned()
    }

    /// The latest quark for `ident` visible from this revision, walking the
    /// chain toward the baseline. Tombstones are returned as-is so callers
    /// can distinguish "removed" from "never existed".
    pub fn latest_quark(&self, ident: Ident) -> Option<Arc<Quark<V>>> {
        let mut revision = self;
        loop {
            if let Some(quark) = revision.own_quark(ident) {
                return Some(quark);
            }
            match revision.previous() {
                Some(previous) => revision = previous,
                None => return None,
            }
        }
    }

    /// The latest committed value for `ident` visible from this revision.
    /// `None` for missing, pending, and removed entries.
    pub fn read_if_exists(&self, ident: Ident) -> Option<V>
    where
        V: Clone,
    {
        let quark = self.latest_quark(ident)?;
        quark.value().cloned()
    }

    /// Replace a pending lazy entry with its calculated quark. Entries that
    /// already hold a value are left untouched, so concurrent fill-ins from
    /// sibling branches are idempotent.
    pub(crate) fn fill_in(&self, ident: Ident, quark: Arc<Quark<V>>) {
        let mut scope = self.scope.write();
        match scope.get(&ident) {
            Some(existing) if !existing.is_pending() => {}
            _ => {
                scope.insert(ident, quark);
            }
        }
    }
}

impl<V> std::fmt::Debug for Revision<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Revision")
            .field("created_at", &self.created_at)
            .field("entries", &self.scope.read().len())
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn own(ident: Ident, at: u64, value: i64) -> Arc<Quark<i64>> {
        Arc::new(Quark::new(
            ident,
            at,
            QuarkData::Own {
                value,
                reads: Vec::new(),
                used_proposed: false,
            },
        ))
    }

    #[test]
    fn lookup_walks_the_chain() {
        let base = Arc::new(Revision::baseline(0));
        let mut scope1 = AHashMap::new();
        scope1.insert(Ident(1), own(Ident(1), 1, 10));
        let rev1 = Arc::new(Revision::next(Arc::clone(&base), 1, scope1));
        let mut scope2 = AHashMap::new();
        scope2.insert(Ident(2), own(Ident(2), 2, 20));
        let rev2 = Arc::new(Revision::next(Arc::clone(&rev1), 2, scope2));

        // Ident(1) is only present one hop back.
        assert_eq!(rev2.read_if_exists(Ident(1)), Some(10));
        assert_eq!(rev2.read_if_exists(Ident(2)), Some(20));
        assert_eq!(rev1.read_if_exists(Ident(2)), None);
        assert_eq!(base.read_if_exists(Ident(1)), None);
    }

    #[test]
    fn newer_entry_wins_over_older() {
        let base = Arc::new(Revision::baseline(0));
        let mut scope1 = AHashMap::new();
        scope1.insert(Ident(1), own(Ident(1), 1, 10));
        let rev1 = Arc::new(Revision::next(base, 1, scope1));
        let mut scope2 = AHashMap::new();
        scope2.insert(Ident(1), own(Ident(1), 2, 11));
        let rev2 = Arc::new(Revision::next(Arc::clone(&rev1), 2, scope2));

        assert_eq!(rev2.read_if_exists(Ident(1)), Some(11));
        assert_eq!(rev1.read_if_exists(Ident(1)), Some(10));
    }

    #[test]
    fn tombstone_terminates_lookup() {
        let base = Arc::new(Revision::baseline(0));
        let mut scope1 = AHashMap::new();
        scope1.insert(Ident(1), own(Ident(1), 1, 10));
        let rev1 = Arc::new(Revision::next(base, 1, scope1));
        let mut scope2 = AHashMap::new();
        scope2.insert(
            Ident(1),
            Arc::new(Quark::new(Ident(1), 2, QuarkData::Tombstone)),
        );
        let rev2 = Arc::new(Revision::next(rev1, 2, scope2));

        let quark = rev2.latest_quark(Ident(1)).unwrap();
        assert!(quark.is_tombstone());
        assert_eq!(rev2.read_if_exists(Ident(1)), None);
    }

    #[test]
    fn fill_in_replaces_pending_only() {
        let mut scope = AHashMap::new();
        scope.insert(
            Ident(1),
            Arc::new(Quark::new(
                Ident(1),
                1,
                QuarkData::Pending {
                    proposed: None,
                    args: None,
                },
            )),
        );
        let base = Arc::new(Revision::baseline(0));
        let rev = Revision::next(base, 1, scope);

        rev.fill_in(Ident(1), own(Ident(1), 1, 42));
        assert_eq!(rev.read_if_exists(Ident(1)), Some(42));

        // A second fill-in does not clobber the calculated value.
        rev.fill_in(Ident(1), own(Ident(1), 1, 99));
        assert_eq!(rev.read_if_exists(Ident(1)), Some(42));
    }
}
