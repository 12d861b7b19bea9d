//! Property-based tests for fanout-batch invariants.
//!
//! These tests use proptest to verify the outcome policy and the definition
//! cache hold across randomly generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;
use tokio_test::block_on;

use fanout_batch::aggregate::{ArraySummary, Outcome, decide_outcome, mark_cacheable};
use fanout_batch::backend::BackendOperation;
use fanout_batch::backend::memory::InMemoryBatchBackend;
use fanout_batch::client::BatchClient;
use fanout_batch::config::BatchConfig;
use fanout_batch::definition::{JobDefinitionCache, JobDefinitionSpec};
use fanout_batch::phase::JobPhase;
use fanout_core::{BitSet, CompactArray};

fn arb_phase() -> impl Strategy<Value = JobPhase> {
    prop::sample::select(JobPhase::ALL.to_vec())
}

/// Generates sub-task phases together with a threshold no larger than the width.
fn arb_array() -> impl Strategy<Value = (Vec<JobPhase>, usize)> {
    prop::collection::vec(arb_phase(), 0..200).prop_flat_map(|phases| {
        let n = phases.len();
        (Just(phases), 0..=n)
    })
}

fn compact(phases: &[JobPhase]) -> CompactArray {
    let mut array = CompactArray::new(phases.len(), JobPhase::BIT_WIDTH).expect("width");
    for (i, phase) in phases.iter().enumerate() {
        array.set(i, phase.as_code()).expect("fits");
    }
    array
}

fn outcome(phases: &[JobPhase], min_successes: usize) -> Outcome {
    let summary = ArraySummary::from_phases(&compact(phases)).expect("summary");
    decide_outcome(&summary, min_successes)
}

proptest! {
    /// INVARIANT: enough successes means Success, whatever else is pending.
    #[test]
    fn threshold_met_is_success(
        phases in prop::collection::vec(arb_phase(), 0..200),
        m_seed in any::<usize>(),
    ) {
        let successes = phases.iter().filter(|p| p.is_success()).count();
        let m = m_seed % (successes + 1);
        prop_assert_eq!(outcome(&phases, m), Outcome::Success);
    }

    /// INVARIANT: a fully terminal array below the threshold fails.
    #[test]
    fn all_terminal_below_threshold_fails(
        phases in prop::collection::vec(
            prop::sample::select(vec![JobPhase::Success, JobPhase::PermanentFailure]),
            1..200,
        ),
        m_seed in any::<usize>(),
    ) {
        let successes = phases.iter().filter(|p| p.is_success()).count();
        prop_assume!(successes < phases.len());
        let m = successes + 1 + m_seed % (phases.len() - successes);
        prop_assert_eq!(outcome(&phases, m), Outcome::Failure);
    }

    /// INVARIANT: once unreachable, the threshold stays unreachable as pending
    /// sub-tasks settle.
    #[test]
    fn early_failure_is_sticky(
        phases in prop::collection::vec(arb_phase(), 1..200),
        m_seed in any::<usize>(),
        settle in prop::collection::vec(any::<bool>(), 200),
    ) {
        let failures = phases.iter().filter(|p| **p == JobPhase::PermanentFailure).count();
        prop_assume!(failures > 0);
        let m = phases.len() - failures + 1 + m_seed % failures;
        prop_assert_eq!(outcome(&phases, m), Outcome::Failure);

        let settled: Vec<JobPhase> = phases
            .iter()
            .zip(settle.iter())
            .map(|(phase, succeed)| match (phase.is_terminal(), succeed) {
                (true, _) => *phase,
                (false, true) => JobPhase::Success,
                (false, false) => JobPhase::PermanentFailure,
            })
            .collect();
        prop_assert_eq!(outcome(&settled, m), Outcome::Failure);
    }

    /// INVARIANT: undecided only while pending sub-tasks could still tip it.
    #[test]
    fn running_means_undecided((phases, m) in arb_array()) {
        let summary = ArraySummary::from_phases(&compact(&phases)).expect("summary");
        if decide_outcome(&summary, m) == Outcome::Running {
            prop_assert!(summary.successes() < m);
            prop_assert!(summary.successes() + summary.pending() >= m);
            prop_assert!(!summary.all_terminal());
        }
    }

    /// INVARIANT: the cache bit is set exactly for successful indexes.
    #[test]
    fn cache_bits_track_successes(phases in prop::collection::vec(arb_phase(), 0..200)) {
        let mut bits = BitSet::new(phases.len());
        for i in (0..phases.len()).step_by(3) {
            bits.set(i).expect("in range");
        }
        mark_cacheable(&compact(&phases), &mut bits).expect("same length");

        for (i, phase) in phases.iter().enumerate() {
            prop_assert_eq!(bits.get(i).expect("in range"), phase.is_success());
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// INVARIANT: concurrent lookups of one spec register it exactly once.
    #[test]
    fn concurrent_lookups_register_once(callers in 1usize..24) {
        let backend = Arc::new(InMemoryBatchBackend::with_latency(Duration::from_millis(2)));
        let handles = block_on(async {
            let client =
                BatchClient::new(backend.clone(), &BatchConfig::default()).expect("client");
            let cache = JobDefinitionCache::new();
            let spec = JobDefinitionSpec {
                image: "worker:1".into(),
                vcpus: 2,
                memory_mib: 1024,
                command: vec!["run".into()],
                environment: BTreeMap::new(),
            };
            let deadline = Instant::now() + Duration::from_secs(10);
            futures::future::join_all(
                (0..callers).map(|_| cache.get_or_register(&client, &spec, deadline)),
            )
            .await
        });

        let first = handles[0].as_ref().expect("registered").clone();
        for handle in &handles {
            prop_assert_eq!(handle.as_ref().expect("registered"), &first);
        }
        prop_assert_eq!(
            backend.call_count(BackendOperation::RegisterJobDefinition).expect("count"),
            1
        );
    }
}
