/// Deterministic word→reducer routing. The mapping must be identical
/// across every mapper and stable across recoveries for a fixed topology,
/// so it depends only on the word bytes and the reducer count.
///
/// The two-reducer topology keeps the classic first-letter split; wider
/// topologies hash with xxh3, which is seed-free and therefore stable
/// across processes.
pub fn route_word(word: &str, reducers: usize) -> usize {
    let Some(&first) = word.as_bytes().first() else {
        return 0;
    };
    match reducers {
        0 | 1 => 0,
        2 => usize::from(first >= b'm'),
        _ => (xxhash_rust::xxh3::xxh3_64(word.as_bytes()) % reducers as u64) as usize,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_two_reducer_first_letter_rule() {
        assert_eq!(route_word("alpha", 2), 0);
        assert_eq!(route_word("gamma", 2), 0);
        assert_eq!(route_word("lion", 2), 0);
        assert_eq!(route_word("mango", 2), 1);
        assert_eq!(route_word("zebra", 2), 1);
        assert_eq!(route_word("", 2), 0);
    }

    #[test]
    fn test_routing_is_stable_and_in_range() {
        for reducers in [1, 2, 3, 8] {
            for word in ["alpha", "mango", "überfluss", "词频"] {
                let slot = route_word(word, reducers);
                assert!(slot < reducers.max(1));
                assert_eq!(slot, route_word(word, reducers));
            }
        }
    }
}
