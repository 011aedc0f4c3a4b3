//! Realm and scope bit allocation
//!
//! Authorization is a single 64-bit word so routes can be matched with one
//! mask-and-compare. Bits 48..63 identify a realm (at most one set), bits
//! 0..47 its scopes. Realm bits are assigned on first sight of a
//! `(realm, issuer, audience)` tuple, scope bits on first sight of a scope
//! string within that realm. Bits are never reassigned.

use crate::auth::verify::VerifiedToken;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Realm bits of an authorization word
pub const REALM_MASK: u64 = 0xFFFF_0000_0000_0000;

/// Scope bits of an authorization word
pub const SCOPE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Number of distinct realms the word can hold
pub const MAX_REALMS: usize = 16;

/// Number of distinct scopes each realm can hold
pub const MAX_SCOPES_PER_REALM: usize = 48;

/// Unauthenticated streams carry this value
pub const NO_AUTHORIZATION: u64 = 0;

const SCOPE_BITS: u32 = 48;

/// Grant-table slot for an authorization: the realm bit position, with the
/// zero realm mapping to slot 0.
pub fn realm_index(authorization: u64) -> usize {
    let realm = (authorization & REALM_MASK) >> SCOPE_BITS;
    if realm == 0 {
        0
    } else {
        realm.trailing_zeros() as usize
    }
}

/// Registry of realms and their scope bit assignments
#[derive(Debug, Default)]
pub struct Realms {
    realms_by_name: HashMap<String, Realm>,
    next_realm_bit: usize,
}

#[derive(Debug)]
struct Realm {
    infos: Vec<RealmInfo>,
    next_scope_bit: usize,
}

#[derive(Debug)]
struct RealmInfo {
    realm_id: u64,
    issuer: String,
    audience: String,
    scope_bits: HashMap<String, u64>,
}

impl Realms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (or re-derive) the authorization for a realm, issuer,
    /// audience, and scope set.
    ///
    /// Returns [`NO_AUTHORIZATION`] once the realm-bit space is saturated,
    /// or when the scope set would not fit in this realm's scope budget.
    pub fn resolve(
        &mut self,
        realm_name: &str,
        issuer: &str,
        audience: &str,
        scopes: &[&str],
    ) -> u64 {
        if self.next_realm_bit >= MAX_REALMS {
            warn!(realm = realm_name, "realm bit space saturated");
            return NO_AUTHORIZATION;
        }

        let realm = self
            .realms_by_name
            .entry(realm_name.to_string())
            .or_insert_with(|| Realm {
                infos: Vec::new(),
                next_scope_bit: 0,
            });

        let authorization = realm.resolve(issuer, audience, scopes, &mut self.next_realm_bit);
        debug!(
            realm = realm_name,
            authorization = %format_args!("{authorization:#018x}"),
            "resolved realm authorization"
        );
        authorization
    }

    /// Resolve a realm with no issuer, audience, or scope requirements.
    pub fn resolve_realm(&mut self, realm_name: &str) -> u64 {
        self.resolve(realm_name, "", "", &[])
    }

    /// Derive the authorization a verified token carries.
    ///
    /// The realm is selected by the token's `kid` header; within it, the
    /// info matching `(iss, aud)` contributes its realm bit plus the bits
    /// of every already-known scope. Unknown scopes contribute nothing and
    /// are not created.
    pub fn lookup(&self, token: &VerifiedToken) -> u64 {
        let Some(realm) = self.realms_by_name.get(token.kid()) else {
            return NO_AUTHORIZATION;
        };

        let claims = token.claims();
        realm.lookup(
            claims.iss.as_deref().unwrap_or(""),
            claims.aud.as_deref().unwrap_or(""),
            &claims.scope_names(),
        )
    }

    /// Remove the realm info holding the given authorization's realm bit.
    ///
    /// Returns true iff exactly one realm bit was set and an info was
    /// removed. Realms left without infos are dropped; bits are not
    /// returned to the pool.
    pub fn unresolve(&mut self, authorization: u64) -> bool {
        let realm_id = authorization & REALM_MASK;

        let mut removed = false;
        for realm in self.realms_by_name.values_mut() {
            if realm.unresolve(realm_id) {
                removed = true;
                break;
            }
        }
        self.realms_by_name.retain(|_, realm| !realm.infos.is_empty());

        realm_id.count_ones() <= 1 && removed
    }
}

impl Realm {
    fn resolve(
        &mut self,
        issuer: &str,
        audience: &str,
        scopes: &[&str],
        next_realm_bit: &mut usize,
    ) -> u64 {
        if self.next_scope_bit + scopes.len() > MAX_SCOPES_PER_REALM {
            warn!(
                requested = scopes.len(),
                assigned = self.next_scope_bit,
                "scope bit budget exceeded"
            );
            return NO_AUTHORIZATION;
        }

        let index = match self
            .infos
            .iter()
            .position(|info| info.matches(issuer, audience))
        {
            Some(index) => index,
            None => {
                let realm_id = 1u64 << *next_realm_bit << SCOPE_BITS;
                *next_realm_bit += 1;
                self.infos.push(RealmInfo {
                    realm_id,
                    issuer: issuer.to_string(),
                    audience: audience.to_string(),
                    scope_bits: HashMap::new(),
                });
                self.infos.len() - 1
            }
        };

        let Realm {
            infos,
            next_scope_bit,
        } = self;
        let info = &mut infos[index];

        let mut authorization = info.realm_id;
        for scope in scopes {
            authorization |= info.supply_scope_bit(scope, next_scope_bit);
        }
        authorization
    }

    fn lookup(&self, issuer: &str, audience: &str, scopes: &[&str]) -> u64 {
        let Some(info) = self
            .infos
            .iter()
            .find(|info| info.matches(issuer, audience))
        else {
            return NO_AUTHORIZATION;
        };

        let mut authorization = info.realm_id;
        for scope in scopes {
            authorization |= info.scope_bits.get(*scope).copied().unwrap_or(0);
        }
        authorization
    }

    fn unresolve(&mut self, realm_id: u64) -> bool {
        let before = self.infos.len();
        self.infos.retain(|info| info.realm_id != realm_id);
        self.infos.len() != before
    }
}

impl RealmInfo {
    fn matches(&self, issuer: &str, audience: &str) -> bool {
        self.issuer == issuer && self.audience == audience
    }

    fn supply_scope_bit(&mut self, scope: &str, next_scope_bit: &mut usize) -> u64 {
        if let Some(bit) = self.scope_bits.get(scope) {
            return *bit;
        }
        debug_assert!(*next_scope_bit < MAX_SCOPES_PER_REALM);
        let bit = 1u64 << *next_scope_bit;
        *next_scope_bit += 1;
        self.scope_bits.insert(scope.to_string(), bit);
        bit
    }
}
