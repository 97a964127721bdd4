use segalloc::allocators::{Config, RawAlloc};
use segalloc::block::{Payload, ALIGNMENT};
use segalloc::grower::ToyHeap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use test_log::test;

// A live allocation: where it is, how many bytes were asked for, and the
// byte it was filled with.
#[derive(Clone, Copy)]
struct Live {
    block: Payload,
    size: usize,
    fill: u8,
}

fn validate(allocator: &RawAlloc<ToyHeap>, live: &[Option<Live>]) {
    let (validity, stats) = allocator.stats();
    log::debug!(
        "heap_size: {}; Validity: {:?}, Stats: {:?}",
        allocator.grower.size(),
        validity,
        stats,
    );
    assert!(validity.is_valid(), "{:?}", validity);
    assert_eq!(stats.heap_size, allocator.grower.size());
    assert_eq!(
        stats.allocated_bytes + stats.free_bytes + 4 * 8,
        stats.heap_size
    );

    let live: Vec<Live> = live.iter().flatten().copied().collect();
    assert_eq!(stats.allocated_blocks, live.len());

    // Every live payload still holds what was written to it, and no two
    // payloads overlap.
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for entry in &live {
        assert_eq!(entry.block.offset() % ALIGNMENT, 0);
        let payload = &allocator.payload(entry.block)[..entry.size];
        assert!(
            payload.iter().all(|&b| b == entry.fill),
            "payload at {} was clobbered",
            entry.block
        );
        ranges.push((entry.block.offset(), entry.block.offset() + entry.size));
    }
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
}

fn run(seed: u64, config: Config) {
    log::info!("Using seed {}", seed);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut allocator = RawAlloc::with_config(ToyHeap::new(4 * 1024 * 1024), config);
    allocator.init().unwrap();

    let mut slots: Vec<Option<Live>> = vec![None; 64];

    for step in 0..2048 {
        let fill = (step % 255) as u8 + 1;
        let slot = slots.choose_mut(&mut rng).unwrap();
        let size = rng.gen_range(1usize..=32) * rng.gen_range(1usize..=32);

        let current = *slot;
        match current {
            None => {
                let block = allocator.allocate(size).expect("toy heap is large enough");
                allocator.payload_mut(block)[..size].fill(fill);
                *slot = Some(Live { block, size, fill });
            }
            Some(live) if rng.gen_bool(0.3) => {
                let block = allocator
                    .resize(live.block, size)
                    .expect("toy heap is large enough");
                let kept = live.size.min(size);
                assert!(
                    allocator.payload(block)[..kept]
                        .iter()
                        .all(|&b| b == live.fill),
                    "resize from {} to {} lost data",
                    live.size,
                    size
                );
                allocator.payload_mut(block)[..size].fill(fill);
                *slot = Some(Live { block, size, fill });
            }
            Some(live) => {
                allocator.release(live.block);
                *slot = None;
            }
        }

        validate(&allocator, &slots);
    }

    // Releasing everything leaves one free block covering the whole heap
    for slot in slots.iter_mut() {
        if let Some(live) = slot.take() {
            allocator.release(live.block);
        }
    }
    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid());
    assert_eq!(stats.allocated_blocks, 0);
    assert_eq!(stats.free_blocks, 1);
}

#[test]
fn test_stress() {
    for seed in [0, 1, 0x5eed, 20_240_601] {
        run(seed, Config::default());
    }
}

#[test]
fn test_stress_always_move() {
    let config = Config {
        resize_in_place: false,
        ..Config::default()
    };
    for seed in [2, 3] {
        run(seed, config);
    }
}

#[test]
fn test_stress_tiny_chunks() {
    let config = Config {
        chunk_size: 16,
        ..Config::default()
    };
    run(7, config);
}
