use exitpool_common::{GuardPolicy, RelayDescriptor};
use rand::seq::SliceRandom;
use rand::Rng;

/// Relays split by role, each ordered by observed bandwidth, highest first
#[derive(Debug, Clone, Default)]
pub struct NodeSelection {
    /// Relays whose exit policy rejects exiting
    pub guards: Vec<RelayDescriptor>,

    /// Relays whose exit policy allows exiting
    pub exits: Vec<RelayDescriptor>,
}

/// Partition the directory into guard and exit candidates
pub struct NodeSelector;

impl NodeSelector {
    /// Ties keep directory order
    pub fn select(relays: &[RelayDescriptor]) -> NodeSelection {
        let (mut exits, mut guards): (Vec<_>, Vec<_>) =
            relays.iter().cloned().partition(|relay| relay.is_exit());

        // sort_by is stable
        guards.sort_by(|a, b| b.observed_bandwidth.cmp(&a.observed_bandwidth));
        exits.sort_by(|a, b| b.observed_bandwidth.cmp(&a.observed_bandwidth));

        NodeSelection { guards, exits }
    }
}

/// Draws the entry hop for each exit node
pub struct GuardPicker<'a> {
    guards: &'a [RelayDescriptor],
    policy: &'a GuardPolicy,
}

impl<'a> GuardPicker<'a> {
    pub fn new(guards: &'a [RelayDescriptor], policy: &'a GuardPolicy) -> Self {
        Self { guards, policy }
    }

    /// The slice guards are drawn from, falling back to every guard when
    /// the directory is too small for the configured window
    fn window(&self) -> &'a [RelayDescriptor] {
        let start = usize::from(self.policy.exclude_top);
        let end = self.policy.slice_len.min(self.guards.len());

        if start < end {
            &self.guards[start..end]
        } else {
            self.guards
        }
    }

    /// Uniform choice from the high-bandwidth window
    pub fn pick<R: Rng + ?Sized>(
        &self,
        exit: &RelayDescriptor,
        rng: &mut R,
    ) -> Result<&'a RelayDescriptor, PathSelectionError> {
        let window = self.window();
        if window.is_empty() {
            return Err(PathSelectionError::NoSuitableEntry);
        }

        if !self.policy.avoid_exit_collision {
            return window.choose(rng).ok_or(PathSelectionError::NoSuitableEntry);
        }

        // Same distribution as re-drawing on a collision, but always terminates
        let candidates: Vec<&RelayDescriptor> = window
            .iter()
            .filter(|guard| guard.fingerprint != exit.fingerprint)
            .collect();

        candidates
            .choose(rng)
            .copied()
            .ok_or(PathSelectionError::InsufficientUniqueNodes)
    }
}

/// Errors that can occur during path selection
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathSelectionError {
    #[error("Insufficient unique nodes available")]
    InsufficientUniqueNodes,

    #[error("No suitable entry guard found")]
    NoSuitableEntry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::relay;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn create_test_directory() -> Vec<RelayDescriptor> {
        // Interleave roles and repeat bandwidths to exercise tie ordering
        (0..20u8)
            .map(|i| relay(i, u64::from(i % 5) * 100, i % 3 == 0))
            .collect()
    }

    #[test]
    fn test_partition_by_exit_policy() {
        let directory = create_test_directory();
        let selection = NodeSelector::select(&directory);

        assert_eq!(selection.guards.len() + selection.exits.len(), directory.len());
        assert!(selection.exits.iter().all(|r| r.is_exit()));
        assert!(selection.guards.iter().all(|r| !r.is_exit()));

        let expected_exits: HashSet<_> = directory
            .iter()
            .filter(|r| r.exit_policy.is_exiting_allowed())
            .map(|r| r.fingerprint)
            .collect();
        let exits: HashSet<_> = selection.exits.iter().map(|r| r.fingerprint).collect();
        assert_eq!(exits, expected_exits);
    }

    #[test]
    fn test_sorted_descending_with_stable_ties() {
        let directory = create_test_directory();
        let selection = NodeSelector::select(&directory);

        for list in [&selection.guards, &selection.exits] {
            for pair in list.windows(2) {
                assert!(pair[0].observed_bandwidth >= pair[1].observed_bandwidth);
                if pair[0].observed_bandwidth == pair[1].observed_bandwidth {
                    let pos = |r: &RelayDescriptor| {
                        directory.iter().position(|d| d.fingerprint == r.fingerprint)
                    };
                    assert!(pos(&pair[0]) < pos(&pair[1]));
                }
            }
        }
    }

    #[test]
    fn test_empty_directory() {
        let selection = NodeSelector::select(&[]);
        assert!(selection.guards.is_empty());
        assert!(selection.exits.is_empty());
    }

    #[test]
    fn test_pick_skips_top_guard_and_stays_in_window() {
        let guards: Vec<_> = (0..60u8).map(|i| relay(i, 10_000 - u64::from(i), false)).collect();
        let exit = relay(200, 5, true);
        let policy = GuardPolicy::default();
        let picker = GuardPicker::new(&guards, &policy);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..500 {
            let guard = picker.pick(&exit, &mut rng).unwrap();
            let index = guards.iter().position(|g| g.fingerprint == guard.fingerprint).unwrap();
            assert!((1..50).contains(&index));
        }
    }

    #[test]
    fn test_pick_never_returns_exit() {
        let shared = relay(1, 100, false);
        let guards = vec![relay(0, 200, false), shared.clone(), relay(2, 50, false)];
        let policy = GuardPolicy {
            slice_len: 3,
            exclude_top: false,
            avoid_exit_collision: true,
        };
        let picker = GuardPicker::new(&guards, &policy);
        let mut rng = StdRng::seed_from_u64(1);

        for _ in 0..200 {
            assert_ne!(picker.pick(&shared, &mut rng).unwrap().fingerprint, shared.fingerprint);
        }
    }

    #[test]
    fn test_small_directory_falls_back_to_all_guards() {
        let guards = vec![relay(0, 200, false)];
        let exit = relay(9, 10, true);
        let policy = GuardPolicy::default();
        let picker = GuardPicker::new(&guards, &policy);

        let guard = picker.pick(&exit, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(guard.fingerprint, guards[0].fingerprint);
    }

    #[test]
    fn test_no_guards() {
        let policy = GuardPolicy::default();
        let picker = GuardPicker::new(&[], &policy);
        let exit = relay(9, 10, true);

        assert_eq!(
            picker.pick(&exit, &mut StdRng::seed_from_u64(3)).unwrap_err(),
            PathSelectionError::NoSuitableEntry
        );
    }
}
