//! Job identity and block-number based priority.

use parking_lot::Mutex;

use common::blob::VersionedHash;

/// Least urgent priority a job can get. 1 is the most urgent.
pub const MAX_PRIORITY: u32 = 2_097_152;

/// Deterministic job id for `hash` on `queue`, also used as the queue's
/// deduplication key.
pub fn build_job_id(queue: &str, hash: &VersionedHash) -> String {
    format!("{}:{}", queue, hash)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityRange {
    pub min: u64,
    pub max: u64,
}

/// Linearly map `block_number` into `[1, MAX_PRIORITY]`.
///
/// `range.max` maps to 1 and `range.min` to `MAX_PRIORITY`, values outside
/// the range are clamped. Without a block number, or with an empty range,
/// the job is as urgent as possible.
pub fn compute_linear_priority(block_number: Option<u64>, range: PriorityRange) -> u32 {
    let Some(block_number) = block_number else {
        return 1;
    };
    if range.max <= range.min {
        return 1;
    }

    let clamped = block_number.clamp(range.min, range.max);
    let distance = u128::from(range.max - clamped);
    let span = u128::from(range.max - range.min);
    let scaled = 1 + distance * u128::from(MAX_PRIORITY - 1) / span;
    scaled as u32
}

/// Highest block number seen so far, the moving top of the priority scale.
///
/// Only ever moves up. Jobs already queued keep the priority they were
/// given when the mark was lower.
#[derive(Debug, Default)]
pub struct HighWaterMark {
    lowest_block_number: u64,
    highest: Mutex<Option<u64>>,
}

impl HighWaterMark {
    pub fn new(lowest_block_number: u64) -> Self {
        Self {
            lowest_block_number,
            highest: Mutex::new(None),
        }
    }

    pub fn highest(&self) -> Option<u64> {
        *self.highest.lock()
    }

    /// Raise the mark to `block_number` if needed, then score it against
    /// `[lowest_block_number, mark]`.
    pub fn compute_priority(&self, block_number: Option<u64>) -> u32 {
        let Some(block) = block_number else {
            return 1;
        };

        let mut highest = self.highest.lock();
        let mark = match *highest {
            Some(mark) if mark >= block => mark,
            _ => {
                *highest = Some(block);
                block
            }
        };
        drop(highest);

        compute_linear_priority(
            Some(block),
            PriorityRange {
                min: self.lowest_block_number,
                max: mark,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(seed: &str) -> VersionedHash {
        VersionedHash::from_kzg_commitment(seed.as_bytes())
    }

    #[test]
    fn test_job_id_deterministic_and_distinct() {
        let a = hash("a");
        let b = hash("b");
        assert_eq!(build_job_id("s3", &a), build_job_id("s3", &a));
        assert_ne!(build_job_id("s3", &a), build_job_id("s3", &b));
        assert_ne!(build_job_id("s3", &a), build_job_id("google", &a));
        assert_eq!(build_job_id("s3", &a), format!("s3:{}", a));
    }

    #[test]
    fn test_priority_bounds() {
        let range = PriorityRange { min: 100, max: 1_100 };
        assert_eq!(compute_linear_priority(None, range), 1);
        assert_eq!(compute_linear_priority(Some(1_100), range), 1);
        assert_eq!(compute_linear_priority(Some(100), range), MAX_PRIORITY);
        // clamped
        assert_eq!(compute_linear_priority(Some(0), range), MAX_PRIORITY);
        assert_eq!(compute_linear_priority(Some(u64::MAX), range), 1);

        for block in (0..2_000).step_by(7) {
            let priority = compute_linear_priority(Some(block), range);
            assert!((1..=MAX_PRIORITY).contains(&priority), "{block} -> {priority}");
        }
    }

    #[test]
    fn test_priority_is_monotonic() {
        let range = PriorityRange { min: 0, max: 20_000_000 };
        let mut previous = MAX_PRIORITY;
        for block in (0..=20_000_000).step_by(999_999) {
            let priority = compute_linear_priority(Some(block), range);
            assert!(priority <= previous);
            previous = priority;
        }
    }

    #[test]
    fn test_empty_range_is_most_urgent() {
        let range = PriorityRange { min: 5, max: 5 };
        assert_eq!(compute_linear_priority(Some(5), range), 1);
        let inverted = PriorityRange { min: 10, max: 5 };
        assert_eq!(compute_linear_priority(Some(7), inverted), 1);
    }

    #[test]
    fn test_high_water_mark_moves_up_only() {
        let mark = HighWaterMark::new(0);
        assert_eq!(mark.highest(), None);

        assert_eq!(mark.compute_priority(None), 1);
        assert_eq!(mark.highest(), None);

        assert_eq!(mark.compute_priority(Some(1_000)), 1);
        assert_eq!(mark.highest(), Some(1_000));

        let older = mark.compute_priority(Some(500));
        assert!(older > 1 && older < MAX_PRIORITY);
        assert_eq!(mark.highest(), Some(1_000));

        assert_eq!(mark.compute_priority(Some(2_000)), 1);
        assert_eq!(mark.highest(), Some(2_000));
        // the same block is now further from the head
        assert!(mark.compute_priority(Some(500)) > older);
    }
}
