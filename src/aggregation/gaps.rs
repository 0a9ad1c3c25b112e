//! Gap detection for the rolling window
//!
//! Given the window currently represented in the destination table and the
//! head we want to reach, list the source units that still have to be
//! applied. Used to backfill after downtime instead of rebuilding blindly.

/// First unit of a `width`-unit window ending at `head` (inclusive)
pub fn window_tail(head: u64, width: u64) -> u64 {
    window_start(head + 1, width)
}

/// First unit of a `width`-unit window ending at `end` (exclusive).
///
/// Same as `window_tail` for unit-wide rows, and still exact when the head
/// row spans several units.
pub fn window_start(end: u64, width: u64) -> u64 {
    end.saturating_sub(width)
}

/// Units of `[window_tail(target_head), target_head]` not covered by
/// `current` (`(tail, head)`, both inclusive), ascending.
///
/// `current = None` means nothing is stored yet, so the whole wanted window
/// is returned.
pub fn missing_tail_units(window_units: u64, target_head: u64, current: Option<(u64, u64)>) -> Vec<u64> {
    if window_units == 0 {
        return Vec::new();
    }
    let wanted_start = window_tail(target_head, window_units);
    (wanted_start..=target_head)
        .filter(|unit| match current {
            Some((tail, head)) => !(tail <= *unit && *unit <= head),
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_tail() {
        assert_eq!(window_tail(500, 225), 276);
        assert_eq!(window_tail(224, 225), 0);
        assert_eq!(window_tail(10, 225), 0);
    }

    #[test]
    fn test_window_start_of_wide_head() {
        assert_eq!(window_start(501, 225), window_tail(500, 225));
        // a day row [1800, 2025) closing a seven day window
        assert_eq!(window_start(2025, 1575), 450);
        assert_eq!(window_start(1000, 1575), 0);
    }

    #[test]
    fn test_empty_when_current() {
        assert!(missing_tail_units(225, 500, Some((276, 500))).is_empty());
    }

    #[test]
    fn test_missing_head_units() {
        assert_eq!(missing_tail_units(225, 503, Some((276, 500))), vec![501, 502, 503]);
    }

    #[test]
    fn test_never_older_than_window() {
        // table is far behind; only the wanted window counts
        let missing = missing_tail_units(225, 1_000, Some((0, 224)));
        assert_eq!(missing.first(), Some(&776));
        assert_eq!(missing.last(), Some(&1_000));
        assert_eq!(missing.len(), 225);
    }

    #[test]
    fn test_fresh_database_starts_at_genesis() {
        assert_eq!(missing_tail_units(225, 3, None), vec![0, 1, 2, 3]);
    }
}
