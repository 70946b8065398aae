use sluice::{execute, Config};

/// Items worker `sender` writes to worker `receiver`.
fn items_for(sender: usize, receiver: usize) -> Vec<(usize, usize, String)> {
    (0 .. sender * 37 + receiver * 5 + 1)
        .map(|i| (sender, i, "x".repeat((i * 7 + receiver) % 23)))
        .collect()
}

fn run_cat(config: Config, block_size: usize) {
    let guards = execute(config, move |ctx| {
        let mut stream = ctx.new_cat_stream().unwrap();
        let mut writers = stream.get_writers(block_size);
        for target in 0 .. ctx.num_workers() {
            writers[target].put_all(&items_for(ctx.my_rank(), target)).unwrap();
        }
        writers.close().unwrap();

        let received = stream.get_reader().unwrap().read_all::<(usize, usize, String)>().unwrap();
        let expected: Vec<_> = (0 .. ctx.num_workers()).flat_map(|sender| items_for(sender, ctx.my_rank())).collect();
        assert_eq!(received, expected);
        assert_eq!(stream.rx().items, expected.len());
        received.len()
    })
    .unwrap();

    for result in guards.join() {
        assert!(result.unwrap() > 0);
    }
}

fn run_mix(config: Config, block_size: usize) {
    let guards = execute(config, move |ctx| {
        let mut stream = ctx.new_mix_stream().unwrap();
        let mut reader = stream.get_reader().unwrap();
        let mut writers = stream.get_writers(block_size);
        for target in 0 .. ctx.num_workers() {
            writers[target].put_all(&items_for(ctx.my_rank(), target)).unwrap();
        }
        writers.close().unwrap();

        let mut per_sender = vec![Vec::new(); ctx.num_workers()];
        while reader.has_next().unwrap() {
            let (sender, item) = reader.next_with_source::<(usize, usize, String)>().unwrap();
            assert_eq!(item.0, sender);
            per_sender[sender].push(item);
        }
        assert!(!reader.has_next().unwrap());
        // arrival order interleaves senders, but each sender's items keep their order
        for (sender, items) in per_sender.into_iter().enumerate() {
            assert_eq!(items, items_for(sender, ctx.my_rank()));
        }
    })
    .unwrap();

    for result in guards.join() {
        result.unwrap();
    }
}

#[test]
fn cat_stream_within_one_host() {
    run_cat(Config::process(3), 64);
}

#[test]
fn cat_stream_across_hosts() {
    run_cat(Config::mock(2, 2), 64);
    run_cat(Config::mock(3, 1), 4096);
}

#[test]
fn mix_stream_within_one_host() {
    run_mix(Config::process(3), 64);
}

#[test]
fn mix_stream_across_hosts() {
    run_mix(Config::mock(2, 2), 32);
    run_mix(Config::mock(3, 2), 4096);
}

#[test]
fn streams_match_up_in_creation_order() {
    let guards = execute(Config::mock(2, 2), |ctx| {
        let mut first = ctx.new_cat_stream().unwrap();
        let mut second = ctx.new_mix_stream().unwrap();
        assert_ne!(first.id(), second.id());

        let mut to_second = second.get_writers(128);
        let mut to_first = first.get_writers(128);
        for target in 0 .. ctx.num_workers() {
            to_first[target].put(&format!("first from {}", ctx.my_rank())).unwrap();
            to_second[target].put(&(ctx.my_rank() as u64)).unwrap();
        }
        // closing in the opposite order of creation is fine
        to_second.close().unwrap();
        to_first.close().unwrap();

        let firsts = first.get_reader().unwrap().read_all::<String>().unwrap();
        let mut seconds = second.get_reader().unwrap().read_all::<u64>().unwrap();
        seconds.sort();
        (firsts, seconds)
    })
    .unwrap();

    for result in guards.join() {
        let (firsts, seconds) = result.unwrap();
        assert_eq!(firsts, (0 .. 4).map(|r| format!("first from {}", r)).collect::<Vec<_>>());
        assert_eq!(seconds, vec![0, 1, 2, 3]);
    }
}

#[test]
fn empty_streams_terminate() {
    let guards = execute(Config::mock(2, 2), |ctx| {
        let mut cat = ctx.new_cat_stream().unwrap();
        let mut mix = ctx.new_mix_stream().unwrap();
        cat.get_writers(64).close().unwrap();
        drop(mix.get_writers(64));
        let cat_items = cat.get_reader().unwrap().read_all::<u8>().unwrap();
        let mix_items = mix.get_reader().unwrap().read_all::<u8>().unwrap();
        cat_items.len() + mix_items.len()
    })
    .unwrap();

    for result in guards.join() {
        assert_eq!(result.unwrap(), 0);
    }
}

#[test]
fn collectives_run_alongside_streams() {
    let guards = execute(Config::mock(2, 3), |ctx| {
        let mut stream = ctx.new_mix_stream().unwrap();
        let mut writers = stream.get_writers(64);
        let next = (ctx.my_rank() + 1) % ctx.num_workers();
        writers[next].put(&ctx.my_rank()).unwrap();
        writers.close().unwrap();

        let total = ctx.flow().all_reduce(ctx.my_rank(), |a, b| a + b).unwrap();
        let offset = ctx.flow().ex_prefix_sum(1usize, |a, b| a + b, 0).unwrap();
        let from_previous = stream.get_reader().unwrap().read_all::<usize>().unwrap();
        (total, offset, from_previous)
    })
    .unwrap();

    for (rank, result) in guards.join().into_iter().enumerate() {
        let (total, offset, from_previous) = result.unwrap();
        assert_eq!(total, 15);
        assert_eq!(offset, rank);
        assert_eq!(from_previous, vec![(rank + 5) % 6]);
    }
}

#[test]
fn workers_sharing_a_link_keep_their_blocks_whole() {
    // eight workers on two hosts, each sending many tiny blocks to every other worker
    let guards = execute(Config::mock(2, 4), |ctx| {
        let mut stream = ctx.new_mix_stream().unwrap();
        let mut reader = stream.get_reader().unwrap();
        let mut writers = stream.get_writers(16);
        for target in 0 .. ctx.num_workers() {
            for i in 0 .. 2000u64 {
                writers[target].put(&(ctx.my_rank() as u64, i)).unwrap();
            }
        }
        writers.close().unwrap();

        let mut next = vec![0u64; ctx.num_workers()];
        while reader.has_next().unwrap() {
            let (sender, (rank, i)) = reader.next_with_source::<(u64, u64)>().unwrap();
            assert_eq!(rank, sender as u64);
            assert_eq!(i, next[sender]);
            next[sender] += 1;
        }
        next
    })
    .unwrap();

    for result in guards.join() {
        assert_eq!(result.unwrap(), vec![2000; 8]);
    }
}
