mod timer;
pub use timer::Timer;

#[derive(thiserror::Error, Debug)]
#[error("Filesystem path is not valid UTF-8")]
pub struct PathEncodingError;

pub type Hasher = std::hash::BuildHasherDefault<rustc_hash::FxHasher>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, Hasher>;

/// Split a comma-delimited list into trimmed, non-empty items.
pub fn split_list(text: &str) -> impl Iterator<Item = &str> {
    text.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Evenly split `len` items among `size` workers, returning the index range owned by `rank`.
///
/// The first `len % size` ranks get one extra item, so shard sizes differ by at most one.
pub fn shard_range(len: usize, rank: usize, size: usize) -> std::ops::Range<usize> {
    debug_assert!(rank < size);
    let base = len / size;
    let extra = len % size;
    let start = rank * base + rank.min(extra);
    let end = start + base + usize::from(rank < extra);
    start..end
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_list() {
        let items: Vec<&str> = split_list(" INCAR, POSCAR,,KPOINTS ").collect();
        assert_eq!(items, ["INCAR", "POSCAR", "KPOINTS"]);
        assert_eq!(split_list("").count(), 0);
    }

    #[test]
    fn test_shard_range_covers_everything_once() {
        for len in [0, 1, 7, 100, 101] {
            for size in 1..6 {
                let mut seen = vec![0u8; len];
                for rank in 0..size {
                    for i in shard_range(len, rank, size) {
                        seen[i] += 1;
                    }
                }
                assert!(seen.iter().all(|&n| n == 1), "len {len} size {size}");
            }
        }
    }

    #[test]
    fn test_shard_range_balance() {
        assert_eq!(shard_range(100, 0, 2), 0..50);
        assert_eq!(shard_range(100, 1, 2), 50..100);
        assert_eq!(shard_range(5, 0, 3), 0..2);
        assert_eq!(shard_range(5, 2, 3), 4..5);
    }
}
