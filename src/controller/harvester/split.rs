//! Replica split between the green original and its blue shadow

/// Split `total` replicas so that about `segment_size` percent run blue
///
/// Returns `(blue, green)`. `blue` is rounded down. A single replica is never
/// starved: with `total == 1` both sides get one replica (unless the whole
/// segment is blue), so the pair briefly runs two pods.
///
/// `segment_size` is expected in `0..=100` and `total` non-negative; callers
/// validate both before splitting.
pub fn blue_green_replicas(total: i32, segment_size: i32) -> (i32, i32) {
    if segment_size >= 100 {
        return (total, 0);
    }
    if total == 1 {
        return (1, 1);
    }

    // i64 keeps total * segment_size from overflowing on large counts
    let blue = (i64::from(total) * i64::from(segment_size) / 100) as i32;
    (blue, total - blue)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_splits() {
        let cases = [
            (1, 100, (1, 0)),
            (1, 50, (1, 1)),
            (10, 50, (5, 5)),
            (10, 30, (3, 7)),
            (7, 30, (2, 5)),
            (10, 0, (0, 10)),
            (0, 30, (0, 0)),
        ];
        for (total, segment, expected) in cases {
            assert_eq!(
                blue_green_replicas(total, segment),
                expected,
                "split({}, {})",
                total,
                segment
            );
        }
    }

    #[test]
    fn test_split_conserves_total_except_single_replica() {
        for total in 0..=50 {
            for segment in 0..=100 {
                let (blue, green) = blue_green_replicas(total, segment);
                assert!(blue >= 0 && green >= 0);
                if total == 1 && segment < 100 {
                    assert_eq!((blue, green), (1, 1));
                } else {
                    assert_eq!(blue + green, total, "split({}, {})", total, segment);
                }
            }
        }
    }

    #[test]
    fn test_blue_grows_with_segment_size() {
        for total in 2..=30 {
            let mut previous = 0;
            for segment in 0..=100 {
                let (blue, _) = blue_green_replicas(total, segment);
                assert!(blue >= previous);
                previous = blue;
            }
        }
    }

    #[test]
    fn test_large_totals_do_not_overflow() {
        assert_eq!(blue_green_replicas(i32::MAX, 50), (i32::MAX / 2, i32::MAX - i32::MAX / 2));
    }
}
