use std::collections::hash_map::DefaultHasher;
use std::hash::{BuildHasher, BuildHasherDefault};

/// Fingerprints per bucket the filter is sized for.
const BUCKET_LOAD: usize = 4;

/// Direct-mapped approximate membership filter: one hash per bucket.
///
/// This is a best-effort negative cache, not a cuckoo filter. There is no
/// relocation on collision: adding a fingerprint overwrites whatever its
/// bucket held, so `contains` can return false for something that was added
/// (and, on a full hash collision, true for something that was not). Treat
/// every answer as a hint to be confirmed against the cache or the store.
pub struct MembershipFilter {
    buckets: Vec<u64>,
    hasher: BuildHasherDefault<DefaultHasher>,
}

impl MembershipFilter {
    pub fn new(capacity: usize) -> Self {
        let num_buckets = (capacity / BUCKET_LOAD).max(1);
        Self {
            buckets: vec![0; num_buckets],
            hasher: Default::default(),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// Hash of a fingerprint and the bucket it maps to. Zero marks an empty bucket.
    ///
    /// BLAKE3 fingerprints are already uniform, so their first eight bytes are
    /// used as-is. Anything that is not lowercase hex gets hashed.
    fn locate(&self, fingerprint: &str) -> (u64, usize) {
        let hash = hex_prefix(fingerprint)
            .unwrap_or_else(|| self.hasher.hash_one(fingerprint))
            .max(1);
        (hash, (hash % self.buckets.len() as u64) as usize)
    }

    pub fn add(&mut self, fingerprint: &str) {
        let (hash, bucket) = self.locate(fingerprint);
        self.buckets[bucket] = hash;
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        let (hash, bucket) = self.locate(fingerprint);
        self.buckets[bucket] == hash
    }

    /// Clears the bucket only if it still holds this fingerprint's hash.
    pub fn remove(&mut self, fingerprint: &str) -> bool {
        let (hash, bucket) = self.locate(fingerprint);
        if self.buckets[bucket] == hash {
            self.buckets[bucket] = 0;
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.buckets.fill(0);
    }
}

/// The first eight bytes of a hex fingerprint, big-endian.
fn hex_prefix(fingerprint: &str) -> Option<u64> {
    let prefix = fingerprint.get(..16)?;
    let mut bytes = [0u8; 8];
    base16ct::lower::decode(prefix, &mut bytes).ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_fingerprints_are_reported() {
        let mut filter = MembershipFilter::new(10_000);
        assert_eq!(filter.num_buckets(), 2500);
        assert!(!filter.contains("never-added"));

        filter.add("fp-1");
        assert!(filter.contains("fp-1"));
        assert!(!filter.contains("never-added"));
    }

    #[test]
    fn single_bucket_overwrites() {
        // With one bucket every fingerprint collides, so the last add wins.
        let mut filter = MembershipFilter::new(1);
        assert_eq!(filter.num_buckets(), 1);

        filter.add("fp-1");
        filter.add("fp-2");
        assert!(filter.contains("fp-2"));
        assert!(!filter.contains("fp-1"));

        assert!(!filter.remove("fp-1"));
        assert!(filter.contains("fp-2"));
        assert!(filter.remove("fp-2"));
        assert!(!filter.contains("fp-2"));
    }

    #[test]
    fn clear_empties_all_buckets() {
        let mut filter = MembershipFilter::new(64);
        for i in 0..16 {
            filter.add(&format!("fp-{i}"));
        }
        filter.clear();
        assert!((0..16).all(|i| !filter.contains(&format!("fp-{i}"))));
    }

    #[test]
    fn hex_fingerprints_map_by_prefix() {
        let fp = crate::chunker::fingerprint(b"hello world");
        let expected = u64::from_str_radix(&fp[..16], 16).unwrap();
        assert_eq!(hex_prefix(&fp), Some(expected));

        let filter = MembershipFilter::new(4000);
        assert_eq!(
            filter.locate(&fp),
            (expected, (expected % 1000) as usize)
        );

        assert_eq!(hex_prefix("fp-1"), None);
        assert_eq!(hex_prefix("ABCDEF0123456789abcd"), None);
        assert_eq!(hex_prefix("0123456789abcdef"), Some(0x0123_4567_89ab_cdef));
    }

    #[test]
    fn all_zero_prefix_is_not_an_empty_bucket() {
        let mut filter = MembershipFilter::new(16);
        let fp = "0".repeat(64);
        assert!(!filter.contains(&fp));
        filter.add(&fp);
        assert!(filter.contains(&fp));
    }
}
