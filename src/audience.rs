//! Control/segment partitioning of an identity population.
//!
//! Each run samples a control group from the newest registrants, folds it into
//! every control identity issued before, and targets whatever is left of the
//! trailing registrant population:
//!
//! ```text
//! sample      = lowest decile of shuffle(current_day)
//! new_control = sample ∪ previous_control
//! new_segment = last_45 − new_control
//! ```
//!
//! All randomness comes from the caller's RNG, so a seeded run is reproducible.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use std::collections::BTreeSet;

pub type IdentitySet = BTreeSet<String>;

pub const DEFAULT_CONTROL_PERCENT: u8 = 10;

/// The three populations one partitioning run reads.
#[derive(Debug, Clone, Default)]
pub struct PartitionInput {
    pub current_day: IdentitySet,
    pub last_45: IdentitySet,
    pub previous_control: IdentitySet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionOutcome {
    pub sample: IdentitySet,
    pub new_control: IdentitySet,
    pub new_segment: IdentitySet,
}

/// Builds the RNG for a run. Without a seed it is drawn from OS entropy.
pub fn run_rng(seed: Option<u64>) -> Pcg64Mcg {
    match seed {
        Some(seed) => Pcg64Mcg::seed_from_u64(seed),
        None => Pcg64Mcg::from_entropy(),
    }
}

/// Number of identities the control sample takes out of `population`.
///
/// Matches the first bucket of an N-tile split: `ceil(population * percent / 100)`.
pub fn control_size(population: usize, percent: u8) -> usize {
    let percent = usize::from(percent.min(100));
    (population * percent).div_ceil(100)
}

/// Shuffles the identities and keeps the lowest `percent` of the random order.
///
/// Re-running with a differently seeded RNG produces a different sample.
pub fn sample_control<R: Rng + ?Sized>(
    current_day: &IdentitySet,
    percent: u8,
    rng: &mut R,
) -> IdentitySet {
    let mut ranked: Vec<&String> = current_day.iter().collect();
    ranked.shuffle(rng);

    let take = control_size(ranked.len(), percent);
    ranked.into_iter().take(take).cloned().collect()
}

/// Union of this run's sample and every control identity issued before.
pub fn accumulate_control(sample: &IdentitySet, previous_control: &IdentitySet) -> IdentitySet {
    sample.union(previous_control).cloned().collect()
}

/// Registrants that are not held out in the control.
pub fn derive_segment(last_45: &IdentitySet, new_control: &IdentitySet) -> IdentitySet {
    last_45.difference(new_control).cloned().collect()
}

pub fn partition<R: Rng + ?Sized>(
    input: &PartitionInput,
    percent: u8,
    rng: &mut R,
) -> PartitionOutcome {
    let sample = sample_control(&input.current_day, percent, rng);
    let new_control = accumulate_control(&sample, &input.previous_control);
    let new_segment = derive_segment(&input.last_45, &new_control);

    PartitionOutcome {
        sample,
        new_control,
        new_segment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> IdentitySet {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn population(n: usize) -> IdentitySet {
        (0..n).map(|i| format!("psid-{i:05}")).collect()
    }

    #[test]
    fn test_empty_input_gives_empty_sample() {
        let mut rng = run_rng(Some(7));
        assert!(sample_control(&IdentitySet::new(), 10, &mut rng).is_empty());
    }

    #[test]
    fn test_ten_identities_give_one_control() {
        let mut rng = run_rng(Some(7));
        let input = PartitionInput {
            current_day: set(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]),
            ..Default::default()
        };

        let outcome = partition(&input, DEFAULT_CONTROL_PERCENT, &mut rng);
        assert_eq!(outcome.new_control.len(), 1);
        assert!(outcome.new_control.is_subset(&input.current_day));
    }

    #[test]
    fn test_sample_size_within_decile_rounding() {
        let mut rng = run_rng(Some(42));
        for n in [1, 5, 9, 10, 11, 99, 100, 101, 1234] {
            let sample = sample_control(&population(n), 10, &mut rng);
            assert!(sample.len() >= n / 10, "n = {n}");
            assert!(sample.len() <= n.div_ceil(10), "n = {n}");
        }
    }

    #[test]
    fn test_control_size_edges() {
        assert_eq!(control_size(0, 10), 0);
        assert_eq!(control_size(1, 10), 1);
        assert_eq!(control_size(20, 10), 2);
        assert_eq!(control_size(21, 10), 3);
        assert_eq!(control_size(50, 0), 0);
        assert_eq!(control_size(50, 200), 50);
    }

    #[test]
    fn test_same_seed_same_sample() {
        let people = population(500);
        let first = sample_control(&people, 10, &mut run_rng(Some(99)));
        let second = sample_control(&people, 10, &mut run_rng(Some(99)));
        let other = sample_control(&people, 10, &mut run_rng(Some(100)));

        assert_eq!(first, second);
        assert_ne!(first, other);
    }

    #[test]
    fn test_control_only_grows() {
        let mut rng = run_rng(Some(3));
        let mut previous_control = IdentitySet::new();

        for day in 0..5 {
            let input = PartitionInput {
                current_day: (0..200).map(|i| format!("day{day}-{i}")).collect(),
                last_45: population(50),
                previous_control: previous_control.clone(),
            };

            let outcome = partition(&input, 10, &mut rng);
            assert!(outcome.new_control.is_superset(&previous_control));
            assert_eq!(outcome.new_control.len(), previous_control.len() + 20);
            previous_control = outcome.new_control;
        }
    }

    #[test]
    fn test_segment_and_control_are_disjoint() {
        let mut rng = run_rng(Some(11));
        let last_45 = population(300);
        let input = PartitionInput {
            current_day: last_45.iter().take(100).cloned().collect(),
            last_45: last_45.clone(),
            previous_control: last_45.iter().skip(250).cloned().collect(),
        };

        let outcome = partition(&input, 10, &mut rng);
        assert!(outcome.new_segment.is_disjoint(&outcome.new_control));
        assert_eq!(
            outcome.new_segment.len() + outcome.new_control.len(),
            last_45.len()
        );
    }

    #[test]
    fn test_accumulate_is_idempotent() {
        let control = set(&["a", "b"]);
        assert_eq!(accumulate_control(&control, &control), control);

        let grown = accumulate_control(&set(&["c"]), &control);
        assert_eq!(accumulate_control(&grown, &control), grown);
    }

    #[test]
    fn test_derive_segment_example() {
        let segment = derive_segment(&set(&["a", "b", "c", "d", "e"]), &set(&["a", "b"]));
        assert_eq!(segment, set(&["c", "d", "e"]));
    }
}
