use std::sync::Arc;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use sluice::data::{BlockPool, File};
use sluice::MemoryConfig;

const BLOCK: usize = 1024;

fn pool(soft: usize, hard: usize) -> Arc<BlockPool> {
    let config = MemoryConfig { hard_limit_wait: Duration::from_millis(200), ..MemoryConfig::default() };
    Arc::new(BlockPool::new(soft, hard, 1, &config, None))
}

#[test]
fn rolling_pins_stay_under_the_hard_limit() {
    let pool = pool(3 * BLOCK, 3 * BLOCK);
    let mut pinned = std::collections::VecDeque::new();
    let mut all = Vec::new();
    for round in 0u8 .. 5 {
        if pinned.len() == 2 {
            pinned.pop_front();
        }
        let mut buffer = pool.allocate(BLOCK, 0).expect("older unpinned blocks should be evicted");
        buffer.extend_from_slice(&[round; BLOCK]);
        let block = buffer.freeze();
        all.push(Arc::clone(block.byte_block()));
        pinned.push_back(block);
    }
    assert!(pool.max_total_bytes() >= 3 * BLOCK);
    assert!(pool.total_bytes() <= 3 * BLOCK);
    drop(pinned);

    // every block comes back intact, wherever it was
    for (round, block) in all.iter().enumerate() {
        let pin = block.pin(0).unwrap();
        assert!(pin.iter().all(|&b| b == round as u8));
    }
}

#[test]
fn get_item_at_finds_items_in_later_blocks() {
    let pool = pool(usize::MAX, usize::MAX);
    // u64s encode to eight bytes: a hundred items per block
    let mut file = File::new(pool, 0, 1, 800);
    let mut writer = file.writer();
    for item in 0u64 .. 1000 {
        writer.put(&item).unwrap();
    }
    writer.close().unwrap();
    drop(writer);

    assert_eq!(file.num_items(), 1000);
    assert_eq!(file.num_blocks(), 10);
    assert_eq!(file.get_item_at::<u64>(550).unwrap(), 550);
    assert_eq!(file.get_item_at::<u64>(0).unwrap(), 0);
    assert_eq!(file.get_item_at::<u64>(999).unwrap(), 999);
    assert!(file.get_item_at::<u64>(1000).is_err());
}

#[test]
fn files_return_what_was_written() {
    let mut rng = SmallRng::seed_from_u64(7);
    let pool = pool(usize::MAX, usize::MAX);
    for block_size in [16, 100, 4096] {
        let items: Vec<(u32, String)> = (0 .. 300)
            .map(|_| {
                let len = rng.gen_range(0 .. 40);
                (rng.gen(), (0 .. len).map(|_| rng.gen_range('a' ..= 'z')).collect())
            })
            .collect();

        let mut file = File::new(Arc::clone(&pool), 0, 0, block_size);
        file.writer().put_all(&items).unwrap();

        assert_eq!(file.num_items(), items.len());
        assert_eq!(file.reader().read_all::<(u32, String)>().unwrap(), items);
        // a keep reader leaves the file as it was
        assert_eq!(file.reader().read_all::<(u32, String)>().unwrap(), items);
        assert_eq!(file.consume_reader().read_all::<(u32, String)>().unwrap(), items);
        assert!(file.is_empty());
    }
    assert_eq!(pool.stats().total_blocks, 0);
}

#[test]
fn evicted_file_blocks_read_back_from_swap() {
    let pool = pool(2 * BLOCK, 4 * BLOCK);
    let mut file = File::new(Arc::clone(&pool), 0, 0, BLOCK);
    let items: Vec<u64> = (0 .. 2000).collect();
    file.writer().put_all(&items).unwrap();
    assert!(file.num_blocks() > 4);

    pool.evict_until(0).unwrap();
    assert!(pool.stats().swapped_blocks > 0);
    assert_eq!(file.reader().read_all::<u64>().unwrap(), items);
}

#[test]
fn block_memory_stays_out_of_the_worker_account() {
    let (limit, expected, used) = sluice::execute_single(|ctx| {
        let mut file = ctx.new_file(0);
        file.writer().put_all(&(0 .. 5000u64).collect::<Vec<_>>()).unwrap();
        assert!(ctx.block_pool().total_bytes() > 0);
        let memory = ctx.memory_config();
        (ctx.tracker().limit(), memory.ram_floating() + memory.ram_workers(), ctx.tracker().current())
    })
    .unwrap();
    assert_eq!(limit, expected);
    assert_eq!(used, 0);
}
