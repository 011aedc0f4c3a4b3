//! Shared access grants
//!
//! Sibling streams for the same subject on the same affinity share one
//! grant, so a fresh token presented on any of them can extend the expiry
//! for all of them. Each proxy half holds one reference; the cleaner
//! removes the table entry when the last reference drops. The worker is
//! single-threaded, so `Rc<RefCell<…>>` carries the sharing.

use crate::auth::realms::MAX_REALMS;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

/// A grant shared between proxy halves.
pub type SharedGrant = Rc<RefCell<AccessGrant>>;

type GrantsBySubject = Rc<RefCell<HashMap<Rc<str>, SharedGrant>>>;

type Cleaner = Box<dyn FnMut(&str)>;

/// Reference-counted authorization state for a subject on an affinity.
pub struct AccessGrant {
    subject: Option<Rc<str>>,
    authorization: u64,
    expires_at: i64,
    challenge_delta: i64,
    ref_count: u32,
    cleaner: Option<Cleaner>,
}

impl AccessGrant {
    fn new(cleaner: Cleaner) -> Self {
        Self {
            subject: None,
            authorization: 0,
            expires_at: 0,
            challenge_delta: 0,
            ref_count: 0,
            cleaner: Some(cleaner),
        }
    }

    /// An unshared grant for a stream without a subject.
    fn anonymous() -> Self {
        Self::new(Box::new(|_| {}))
    }

    /// Bind or extend the grant from a freshly verified token.
    ///
    /// The first binding (no references yet) sets every field. A later
    /// binding extends `expires_at`/`challenge_delta` only when it is
    /// monotonic: the existing authorization bits are all present in the
    /// new one and the new expiry is strictly later. Returns whether an
    /// extension happened.
    pub fn reauthorize(
        &mut self,
        subject: Option<&str>,
        authorization: u64,
        expires_at: i64,
        challenge_delta: i64,
    ) -> bool {
        if self.ref_count > 0 {
            let reauthorized = (self.authorization & authorization) == self.authorization
                && expires_at > self.expires_at;
            if reauthorized {
                trace!(
                    subject = self.subject.as_deref(),
                    expires_at,
                    "grant expiry extended"
                );
                self.expires_at = expires_at;
                self.challenge_delta = challenge_delta;
            }
            reauthorized
        } else {
            self.subject = subject.map(Rc::from);
            self.authorization = authorization;
            self.expires_at = expires_at;
            self.challenge_delta = challenge_delta;
            false
        }
    }

    /// Take a reference. A released-out grant must not be revived.
    pub fn acquire(&mut self) {
        debug_assert!(self.cleaner.is_some(), "grant acquired after final release");
        self.ref_count += 1;
    }

    /// Drop a reference; the last one runs the cleaner and poisons the
    /// grant against further use.
    pub fn release(&mut self) {
        debug_assert!(self.ref_count > 0, "grant released more times than acquired");
        self.ref_count -= 1;
        if self.ref_count == 0 {
            if let Some(mut cleaner) = self.cleaner.take() {
                if let Some(subject) = self.subject.as_deref() {
                    cleaner(subject);
                }
            }
        }
    }

    /// Wall-clock instant at which a challenge becomes due.
    pub fn challenge_after(&self) -> i64 {
        self.expires_at - self.challenge_delta
    }

    pub fn authorization(&self) -> u64 {
        self.authorization
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn challenge_delta(&self) -> i64 {
        self.challenge_delta
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }
}

impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("subject", &self.subject)
            .field("authorization", &self.authorization)
            .field("expires_at", &self.expires_at)
            .field("challenge_delta", &self.challenge_delta)
            .field("ref_count", &self.ref_count)
            .finish()
    }
}

/// Per-realm-slot, per-affinity, per-subject grant registry.
pub struct GrantTable {
    grants_by_subject_by_affinity: [HashMap<u64, GrantsBySubject>; MAX_REALMS],
}

impl GrantTable {
    pub fn new() -> Self {
        Self {
            grants_by_subject_by_affinity: std::array::from_fn(|_| HashMap::new()),
        }
    }

    /// Get or create the grant for `(realm slot, affinity, subject)`.
    ///
    /// A subject-less stream gets a fresh anonymous grant every time.
    pub fn supply(
        &mut self,
        realm_index: usize,
        affinity: u64,
        subject: Option<&str>,
    ) -> SharedGrant {
        let Some(subject) = subject else {
            return Rc::new(RefCell::new(AccessGrant::anonymous()));
        };

        let grants_by_subject = self.grants_by_subject_by_affinity[realm_index]
            .entry(affinity)
            .or_insert_with(|| Rc::new(RefCell::new(HashMap::new())))
            .clone();

        let mut map = grants_by_subject.borrow_mut();
        if let Some(grant) = map.get(subject) {
            return Rc::clone(grant);
        }

        debug!(realm_index, affinity, subject, "new access grant");
        let slot = Rc::clone(&grants_by_subject);
        let cleaner: Cleaner = Box::new(move |subject| {
            slot.borrow_mut().remove(subject);
        });

        let grant = Rc::new(RefCell::new(AccessGrant::new(cleaner)));
        map.insert(Rc::from(subject), Rc::clone(&grant));
        grant
    }

    /// Whether a grant is registered under the given key.
    pub fn contains(&self, realm_index: usize, affinity: u64, subject: &str) -> bool {
        self.grants_by_subject_by_affinity[realm_index]
            .get(&affinity)
            .is_some_and(|map| map.borrow().contains_key(subject))
    }
}

impl Default for GrantTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_subject_shares_grant() {
        let mut table = GrantTable::new();
        let a = table.supply(0, 7, Some("alice"));
        let b = table.supply(0, 7, Some("alice"));
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_distinct_keys_do_not_share() {
        let mut table = GrantTable::new();
        let base = table.supply(0, 7, Some("alice"));
        assert!(!Rc::ptr_eq(&base, &table.supply(0, 7, Some("bob"))));
        assert!(!Rc::ptr_eq(&base, &table.supply(0, 8, Some("alice"))));
        assert!(!Rc::ptr_eq(&base, &table.supply(1, 7, Some("alice"))));
    }

    #[test]
    fn test_anonymous_grants_are_never_shared() {
        let mut table = GrantTable::new();
        let a = table.supply(0, 7, None);
        let b = table.supply(0, 7, None);
        assert!(!Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_first_binding_sets_all_fields() {
        let mut table = GrantTable::new();
        let grant = table.supply(0, 7, Some("alice"));

        let extended = grant.borrow_mut().reauthorize(Some("alice"), 0b11, 5_000, 500);
        assert!(!extended);

        let g = grant.borrow();
        assert_eq!(g.subject(), Some("alice"));
        assert_eq!(g.authorization(), 0b11);
        assert_eq!(g.expires_at(), 5_000);
        assert_eq!(g.challenge_delta(), 500);
        assert_eq!(g.challenge_after(), 4_500);
    }

    #[test]
    fn test_monotonic_reauthorization_extends_expiry() {
        let mut table = GrantTable::new();
        let grant = table.supply(0, 7, Some("alice"));
        grant.borrow_mut().reauthorize(Some("alice"), 0b11, 5_000, 500);
        grant.borrow_mut().acquire();

        let extended = grant.borrow_mut().reauthorize(Some("alice"), 0b111, 9_000, 100);
        assert!(extended);

        let g = grant.borrow();
        // Authorization keeps its original bits; only the window moves.
        assert_eq!(g.authorization(), 0b11);
        assert_eq!(g.expires_at(), 9_000);
        assert_eq!(g.challenge_delta(), 100);
    }

    #[test]
    fn test_narrower_authorization_is_ignored() {
        let mut table = GrantTable::new();
        let grant = table.supply(0, 7, Some("alice"));
        grant.borrow_mut().reauthorize(Some("alice"), 0b11, 5_000, 0);
        grant.borrow_mut().acquire();

        assert!(!grant.borrow_mut().reauthorize(Some("alice"), 0b01, 9_000, 0));
        assert_eq!(grant.borrow().expires_at(), 5_000);
    }

    #[test]
    fn test_earlier_expiry_is_ignored() {
        let mut table = GrantTable::new();
        let grant = table.supply(0, 7, Some("alice"));
        grant.borrow_mut().reauthorize(Some("alice"), 0b11, 5_000, 0);
        grant.borrow_mut().acquire();

        assert!(!grant.borrow_mut().reauthorize(Some("alice"), 0b11, 4_000, 0));
        assert_eq!(grant.borrow().expires_at(), 5_000);
    }

    #[test]
    fn test_release_at_zero_removes_table_entry() {
        let mut table = GrantTable::new();
        let grant = table.supply(0, 7, Some("alice"));
        grant.borrow_mut().reauthorize(Some("alice"), 1, 5_000, 0);

        grant.borrow_mut().acquire();
        grant.borrow_mut().acquire();
        assert_eq!(grant.borrow().ref_count(), 2);

        grant.borrow_mut().release();
        assert!(table.contains(0, 7, "alice"));

        grant.borrow_mut().release();
        assert!(!table.contains(0, 7, "alice"));
        assert_eq!(grant.borrow().ref_count(), 0);
    }

    #[test]
    fn test_fresh_grant_after_final_release() {
        let mut table = GrantTable::new();
        let first = table.supply(0, 7, Some("alice"));
        first.borrow_mut().reauthorize(Some("alice"), 1, 5_000, 0);
        first.borrow_mut().acquire();
        first.borrow_mut().release();

        let second = table.supply(0, 7, Some("alice"));
        assert!(!Rc::ptr_eq(&first, &second));
        assert_eq!(second.borrow().ref_count(), 0);
    }

    #[test]
    fn test_anonymous_release_is_noop_cleanup() {
        let mut table = GrantTable::new();
        let grant = table.supply(0, 7, None);
        grant.borrow_mut().reauthorize(None, 0, 5_000, 0);
        grant.borrow_mut().acquire();
        grant.borrow_mut().release();
        assert_eq!(grant.borrow().ref_count(), 0);
    }
}
