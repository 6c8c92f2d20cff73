use crate::types::Fingerprint;

/// Run `f` against a fresh blake3 hasher and return the lowercase hex digest.
pub fn fingerprint_with(f: impl FnOnce(&mut blake3::Hasher)) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    f(&mut hasher);
    hasher.finalize().to_hex().to_string()
}

/// Feed a length-prefixed string so adjacent parts cannot alias each other.
pub fn update_part(hasher: &mut blake3::Hasher, part: &str) {
    hasher.update(&(part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
}

/// Feed an `f32` by its bit pattern.
pub fn update_f32(hasher: &mut blake3::Hasher, value: f32) {
    hasher.update(&value.to_bits().to_le_bytes());
}

/// Feed a `u64` in little-endian order.
pub fn update_u64(hasher: &mut blake3::Hasher, value: u64) {
    hasher.update(&value.to_le_bytes());
}

/// Fingerprint of a set of identifiers, independent of their input order.
pub fn sorted_ids_fingerprint<'a, I>(ids: I) -> Fingerprint
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sorted: Vec<&str> = ids.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();
    fingerprint_with(|hasher| {
        update_u64(hasher, sorted.len() as u64);
        for id in sorted {
            update_part(hasher, id);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_fingerprint_ignores_input_order() {
        let a = sorted_ids_fingerprint(["b", "a", "c"]);
        let b = sorted_ids_fingerprint(["c", "b", "a"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn length_prefix_prevents_aliasing() {
        let joined = fingerprint_with(|h| {
            update_part(h, "ab");
            update_part(h, "c");
        });
        let split = fingerprint_with(|h| {
            update_part(h, "a");
            update_part(h, "bc");
        });
        assert_ne!(joined, split);
    }
}
