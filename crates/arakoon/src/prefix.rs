use crate::Error;

/// Computes the smallest key that sorts after every key starting with `prefix`.
///
/// The prefix is incremented as an unsigned big-endian byte string: trailing
/// `0xFF` bytes become `0x00` and carry into the byte on their left. The result
/// has the same length as `prefix`.
///
/// # Errors
///
/// Returns [`Error::NoNextPrefix`] when `prefix` is empty or consists only of
/// `0xFF` bytes.
pub fn next_prefix(prefix: &[u8]) -> Result<Vec<u8>, Error> {
    let mut next = prefix.to_vec();

    for position in (0..next.len()).rev() {
        if next[position] == u8::MAX {
            next[position] = 0;
        } else {
            next[position] += 1;
            return Ok(next);
        }
    }

    Err(Error::NoNextPrefix(prefix.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use proptest::prelude::*;

    #[test]
    fn test_simple_increment() {
        assert_eq!(next_prefix(b"ovs").unwrap(), b"ovt".to_vec());
    }

    #[test]
    fn test_carry() {
        assert_eq!(next_prefix(&[b'a', 0xff]).unwrap(), vec![b'b', 0x00]);
        assert_eq!(next_prefix(&[0x01, 0xff, 0xff]).unwrap(), vec![0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_no_next_prefix() {
        assert_matches!(next_prefix(&[0xff, 0xff]), Err(Error::NoNextPrefix(p)) if p == vec![0xff, 0xff]);
        assert_matches!(next_prefix(b""), Err(Error::NoNextPrefix(_)));
    }

    #[test]
    fn test_ovs_bounds() {
        let upper = next_prefix(b"ovs").unwrap();

        for key in [&b"ovs"[..], b"ovs/", b"ovs/arakoon/config", b"ovs\xff\xff"] {
            assert!(key < upper.as_slice());
        }
        assert!(b"ovt".as_slice() >= upper.as_slice());
        assert!(b"ovt/locks".as_slice() >= upper.as_slice());
    }

    proptest! {
        #[test]
        fn prop_upper_bound_excludes_exactly_the_prefix(
            prefix in proptest::collection::vec(any::<u8>(), 1..8),
            suffix in proptest::collection::vec(any::<u8>(), 0..8),
            other in proptest::collection::vec(any::<u8>(), 0..16),
        ) {
            match next_prefix(&prefix) {
                Ok(upper) => {
                    let mut key = prefix.clone();
                    key.extend_from_slice(&suffix);
                    prop_assert!(key.as_slice() < upper.as_slice());

                    if other.as_slice() >= prefix.as_slice() && other.as_slice() < upper.as_slice() {
                        prop_assert!(other.starts_with(&prefix));
                    }
                }
                Err(_) => prop_assert!(prefix.iter().all(|byte| *byte == u8::MAX)),
            }
        }
    }
}
