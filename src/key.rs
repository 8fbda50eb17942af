//! Derivation of cache keys from user keys.

use std::hash::Hash;

/// Derives the comparable cache key for a user key.
///
/// A fingerprint failure fails the load immediately: no batch entry is
/// created and the backend is never consulted for that key.
pub trait KeyFingerprint<K, E> {
    type CacheKey: Eq + Hash;

    fn fingerprint(&self, key: &K) -> Result<Self::CacheKey, E>;
}

/// The identity fingerprint, for keys that are themselves usable as cache
/// keys. Keys that are not hashable and clonable need a custom
/// [`KeyFingerprint`] instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct MirrorKey;

impl<K, E> KeyFingerprint<K, E> for MirrorKey
where
    K: Clone + Eq + Hash,
{
    type CacheKey = K;

    fn fingerprint(&self, key: &K) -> Result<K, E> {
        Ok(key.clone())
    }
}

impl<F, K, C, E> KeyFingerprint<K, E> for F
where
    F: Fn(&K) -> Result<C, E>,
    C: Eq + Hash,
{
    type CacheKey = C;

    fn fingerprint(&self, key: &K) -> Result<C, E> {
        self(key)
    }
}
