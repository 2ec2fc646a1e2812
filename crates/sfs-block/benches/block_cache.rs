#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sfs_block::{
    BlockBuf, BlockCache, BlockSource, CacheOptions, CancelFlag, JobPriority, WorkerPool,
    WorkerPoolConfig,
};
use sfs_error::Result;
use sfs_types::BlockId;
use std::sync::Arc;

const BLOCK_SIZE: u32 = 64 * 1024;

/// In-memory block source for benchmarks; "decoding" is a memset.
struct MemSource {
    num_blocks: u32,
}

impl BlockSource for MemSource {
    fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn decompressed_len(&self, _block: BlockId) -> u64 {
        u64::from(BLOCK_SIZE)
    }

    fn load(&self, block: BlockId, _cancel: &CancelFlag) -> Result<BlockBuf> {
        Ok(BlockBuf::new(vec![block.0 as u8; BLOCK_SIZE as usize]))
    }
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_cache");

    group.bench_function("hit_path", |b| {
        let pool = WorkerPool::new(&WorkerPoolConfig::default());
        let cache = BlockCache::new(
            Arc::new(MemSource { num_blocks: 8 }),
            pool,
            CacheOptions::default(),
        );
        // Warm the single block so every iteration is a pure hit.
        drop(cache.get(BlockId(0), JobPriority::Foreground).expect("warm"));
        b.iter(|| {
            let handle = cache
                .get(black_box(BlockId(0)), JobPriority::Foreground)
                .expect("get");
            black_box(handle.data()[0]);
        });
    });

    group.bench_function("miss_evict_cycle", |b| {
        let pool = WorkerPool::new(&WorkerPoolConfig::default());
        let cache = BlockCache::new(
            Arc::new(MemSource { num_blocks: 64 }),
            pool,
            CacheOptions {
                budget_bytes: 2 * u64::from(BLOCK_SIZE),
                ..CacheOptions::default()
            },
        );
        let mut next = 0_u32;
        b.iter(|| {
            let handle = cache
                .get(BlockId(next % 64), JobPriority::Foreground)
                .expect("get");
            black_box(handle.data()[0]);
            next = next.wrapping_add(1);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_cache);
criterion_main!(benches);
