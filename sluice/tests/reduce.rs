use std::collections::HashMap;

use itertools::Itertools;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use sluice::api::{ReduceNode, Stage};
use sluice::{execute, execute_single, Config, MemoryConfig, ReduceConfig};

/// A configuration whose reduce tables hold a few hundred items, so that they spill.
fn tight(hosts: usize, threads: usize, use_post_thread: bool) -> Config {
    Config::mock(hosts, threads)
        .with_memory(MemoryConfig { block_size: 1024, ..MemoryConfig::default() })
        .with_reduce(ReduceConfig {
            limit_memory_bytes: Some(16 * 1024),
            initial_items_per_partition: 8,
            post_partitions: 4,
            use_post_thread,
            ..ReduceConfig::default()
        })
}

/// The pairs worker `rank` contributes; key 0 is always among them.
fn random_pairs(rank: usize, count: usize, keys: u64) -> Vec<(u64, u64)> {
    let mut rng = SmallRng::seed_from_u64(rank as u64);
    let mut pairs: Vec<(u64, u64)> = (0 .. count).map(|_| (rng.gen_range(0 .. keys), rng.gen_range(0 .. 1000))).collect();
    pairs.push((0, rank as u64));
    pairs
}

fn check_random_reduce(config: Config) {
    let workers = config.communication.threads() * config.communication.hosts();
    let guards = execute(config, |ctx| {
        let pairs = random_pairs(ctx.my_rank(), 2000, 3000);
        ctx.reduce_pair(pairs, |a, b| a + b).unwrap()
    })
    .unwrap();

    let outputs: Vec<Vec<(u64, u64)>> = guards.join().into_iter().map(Result::unwrap).collect();
    let mut expected: HashMap<u64, u64> = HashMap::new();
    for rank in 0 .. workers {
        for (key, value) in random_pairs(rank, 2000, 3000) {
            *expected.entry(key).or_default() += value;
        }
    }

    // each key is reduced on exactly one worker
    let all = outputs.iter().flatten().copied().sorted().collect_vec();
    assert!(all.iter().map(|(key, _)| key).all_unique());
    assert_eq!(all, expected.into_iter().sorted().collect_vec());
    assert!(outputs.iter().filter(|output| !output.is_empty()).count() > 1);
}

#[test]
fn two_workers_concatenate_strings() {
    for config in [Config::process(2), Config::mock(2, 1)] {
        let guards = execute(config, |ctx| {
            let pairs: Vec<(u32, String)> = match ctx.my_rank() {
                0 => vec![(1, "a".into()), (1, "b".into()), (2, "c".into())],
                _ => vec![(1, "d".into())],
            };
            ctx.reduce_pair(pairs, |a, b| format!("{}{}", a, b)).unwrap()
        })
        .unwrap();

        let output = guards.join().into_iter().flat_map(Result::unwrap).sorted().collect_vec();
        assert_eq!(output.len(), 2);
        assert_eq!(output[0].0, 1);
        assert_eq!(output[0].1.chars().sorted().collect::<String>(), "abd");
        assert_eq!(output[1], (2, "c".to_string()));
    }
}

#[test]
fn random_pairs_reduce_across_spills() {
    check_random_reduce(tight(2, 2, false));
}

#[test]
fn random_pairs_reduce_with_a_post_thread() {
    check_random_reduce(tight(3, 1, true));
}

#[test]
fn reduce_by_key_keeps_whole_items() {
    #[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    struct Visit {
        page: String,
        count: u64,
        first: u32,
    }

    let guards = execute(Config::mock(2, 2), |ctx| {
        let visits: Vec<Visit> = (0 .. 100u32)
            .map(|i| Visit { page: format!("/page/{}", i % 7), count: 1, first: i * 4 + ctx.my_rank() as u32 })
            .collect();
        ctx.reduce_by_key(
            visits,
            |visit| visit.page.clone(),
            |a, b| Visit { page: a.page.clone(), count: a.count + b.count, first: a.first.min(b.first) },
        )
        .unwrap()
    })
    .unwrap();

    let visits = guards.join().into_iter().flat_map(Result::unwrap).sorted().collect_vec();
    assert_eq!(visits.len(), 7);
    for (index, visit) in visits.iter().enumerate() {
        assert_eq!(visit.page, format!("/page/{}", index));
        assert_eq!(visit.first, index as u32 * 4);
    }
    assert_eq!(visits.iter().map(|v| v.count).sum::<u64>(), 400);
}

#[test]
fn spilled_output_is_cached_for_repeated_pushes() {
    let guards = execute(tight(1, 2, false), |ctx| {
        let mut node = ReduceNode::new(ctx, |a: &u64, b: &u64| a + b).unwrap();
        node.start_pre_op().unwrap();
        for pair in random_pairs(ctx.my_rank(), 3000, 5000) {
            node.pre_op(pair).unwrap();
        }
        node.stop_pre_op().unwrap();
        node.execute().unwrap();

        let mut first = Vec::new();
        node.push_data(false, &mut |pair: &(u64, u64)| {
            first.push(*pair);
            Ok(())
        })
        .unwrap();
        let mut second = Vec::new();
        node.push_data(true, &mut |pair: &(u64, u64)| {
            second.push(*pair);
            Ok(())
        })
        .unwrap();
        node.dispose();
        assert_eq!(first, second);
        first
    })
    .unwrap();

    let keys = guards.join().into_iter().flat_map(Result::unwrap).map(|(key, _)| key).collect_vec();
    assert!(keys.iter().all_unique());
}

#[test]
fn single_worker_reduces_on_the_calling_thread() {
    let output = execute_single(|ctx| {
        assert_eq!(ctx.num_workers(), 1);
        let pairs = random_pairs(0, 500, 50);
        let mut reduced = ctx.reduce_pair(pairs, |a, b| *a.max(b)).unwrap();
        reduced.sort();
        reduced
    })
    .unwrap();

    let expected = random_pairs(0, 500, 50)
        .into_iter()
        .into_grouping_map()
        .max()
        .into_iter()
        .sorted()
        .collect_vec();
    assert_eq!(output, expected);
}

#[test]
fn consecutive_reductions_use_separate_streams() {
    let guards = execute(Config::mock(2, 2), |ctx| {
        let words = ["a", "b", "a", "c", "b", "a"];
        let first = ctx
            .reduce_pair(words.iter().map(|w| (w.to_string(), 1u64)).collect(), |a, b| a + b)
            .unwrap();
        // feed the counts of the first reduction into a second one keyed by count
        ctx.reduce_pair(first.into_iter().map(|(word, count)| (count, vec![word])).collect(), |a, b| {
            a.iter().chain(b).cloned().sorted().collect()
        })
        .unwrap()
    })
    .unwrap();

    let output = guards.join().into_iter().flat_map(Result::unwrap).sorted().collect_vec();
    assert_eq!(
        output,
        vec![(4, vec!["c".to_string()]), (8, vec!["b".to_string()]), (12, vec!["a".to_string()])],
    );
}
