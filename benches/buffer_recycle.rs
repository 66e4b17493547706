/// 接收缓冲区复用基准测试
///
/// 对比：
/// 1. 监听器不保留载荷时的原地复用
/// 2. 监听器保留部分载荷时的换新与回收
/// 3. 每次都新分配缓冲区（不复用）作为基线

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use msglane::buffer::{BufferManager, BufferStats, RecvBuffer};
use rand::{rngs::StdRng, Rng, SeedableRng};

const BUFFER_SIZE: usize = 8 * 1024;
const MAX_TRACKED: usize = 64;

/// 模拟一次读取：写入随机长度的数据
fn fill(buf: &mut RecvBuffer, len: usize) {
    let unfilled = buf.unfilled_mut();
    let n = len.min(unfilled.len());
    unfilled[..n].fill(0xAB);
    buf.commit(n);
}

fn bench_recycle(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let lengths: Vec<usize> = (0..1024).map(|_| rng.gen_range(1..BUFFER_SIZE)).collect();

    let mut group = c.benchmark_group("buffer_recycle");
    group.throughput(Throughput::Elements(lengths.len() as u64));

    group.bench_function("reuse_in_place", |b| {
        let mut manager = BufferManager::new(BUFFER_SIZE, MAX_TRACKED, Arc::new(BufferStats::default()));
        let mut buf = manager.acquire();
        b.iter(|| {
            for &len in &lengths {
                if let Some(inner) = Arc::get_mut(&mut buf) {
                    fill(inner, len);
                }
                let shares = Arc::strong_count(&buf);
                black_box(buf.len());
                buf = manager.recycle(buf, shares);
            }
        });
    });

    group.bench_function("retain_every_eighth", |b| {
        let mut manager = BufferManager::new(BUFFER_SIZE, MAX_TRACKED, Arc::new(BufferStats::default()));
        let mut buf = manager.acquire();
        let mut held = Vec::with_capacity(8);
        b.iter(|| {
            for (i, &len) in lengths.iter().enumerate() {
                if let Some(inner) = Arc::get_mut(&mut buf) {
                    fill(inner, len);
                }
                let shares = Arc::strong_count(&buf);
                if i % 8 == 0 {
                    held.push(buf.clone());
                }
                if held.len() == held.capacity() {
                    // 消费者批量释放，缓冲区可被回收
                    held.clear();
                }
                buf = manager.recycle(buf, shares);
            }
        });
    });

    group.bench_function("allocate_every_read", |b| {
        b.iter(|| {
            for &len in &lengths {
                let mut buf = RecvBuffer::new(BUFFER_SIZE);
                fill(&mut buf, len);
                black_box(buf.len());
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_recycle);
criterion_main!(benches);
