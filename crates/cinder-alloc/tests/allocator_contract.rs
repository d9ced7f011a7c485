//! 分配器公开契约测试。
//!
//! # 教案级导览
//!
//! - **Why**：锁定门面层的可观测行为——块的创建粒度、子页的页级
//!   计账、huge 旁路、配置校验的失败口径。这些是上层运行时据以
//!   做容量规划的硬承诺。
//! - **How**：统一使用单 Arena 配置让统计快照可精确断言；断言前用
//!   `free_current_thread_cache` 冲掉线程缓存，使块层面的字节状态
//!   与缓存驻留解耦。
//! - **What**：每个用例对应一条契约条目，失败信息直接指出被破坏的
//!   承诺。

use bytes::BufMut;
use cinder_alloc::{codes, PoolConfig, PooledAllocator};

const PAGE: usize = 8192;
const MAX_ORDER: u32 = 11;
const CHUNK: usize = PAGE << MAX_ORDER; // 16 MiB

fn single_arena_pool() -> PooledAllocator {
    PooledAllocator::new(
        PoolConfig::new()
            .with_num_heap_arenas(1)
            .with_num_direct_arenas(0)
            .with_page_size(PAGE)
            .with_max_order(MAX_ORDER),
    )
    .expect("单 Arena 配置必须合法")
}

#[test]
fn whole_chunk_allocation_creates_exactly_one_chunk() {
    let pool = single_arena_pool();
    let buf = pool.new_heap_buffer(CHUNK, CHUNK).expect("16 MiB 缓冲");
    assert_eq!(buf.capacity(), CHUNK);

    let stats = pool.statistics();
    assert_eq!(stats.chunk_count, 1, "整块请求只应创建一个块");
    assert_eq!(stats.allocated_bytes, CHUNK);
    assert_eq!(stats.available_bytes, 0, "整块运行后块内不应有空闲字节");

    drop(buf);
    pool.free_current_thread_cache();
    let stats = pool.statistics();
    assert_eq!(
        stats.available_bytes, stats.allocated_bytes,
        "释放并清空缓存后字节应全部回到块"
    );
}

#[test]
fn half_page_request_consumes_one_full_page() {
    let pool = single_arena_pool();
    let buf = pool.new_heap_buffer(4096, 4096).expect("4 KiB 缓冲");
    assert_eq!(buf.capacity(), 4096);

    let stats = pool.statistics();
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(
        stats.allocated_bytes - stats.available_bytes,
        PAGE,
        "半页请求在块层面占用整页（子页承载）"
    );
    drop(buf);
    pool.free_current_thread_cache();
}

#[test]
fn ten_tiny_buffers_share_a_single_page() {
    let pool = single_arena_pool();
    let bufs: Vec<_> = (0..10)
        .map(|_| pool.new_heap_buffer(32, 32).expect("32 字节缓冲"))
        .collect();
    for b in &bufs {
        assert_eq!(b.capacity(), 32);
    }

    let stats = pool.statistics();
    assert_eq!(stats.chunk_count, 1, "十次 tiny 只应触发一个块");
    assert_eq!(
        stats.allocated_bytes - stats.available_bytes,
        PAGE,
        "块层面只消耗一个页，而不是 10×32 字节"
    );
    assert_eq!(stats.active_leases, 10);
    drop(bufs);
    pool.free_current_thread_cache();
}

#[test]
fn invalid_page_size_fails_loudly() {
    let err = PooledAllocator::new(PoolConfig::new().with_page_size(3000))
        .expect_err("页大小 3000 必须被拒绝");
    assert_eq!(err.code(), codes::BAD_CONFIG);
    assert!(
        err.message().contains("power of two"),
        "错误消息应指出 2 的幂约束: {}",
        err.message()
    );
}

#[test]
fn invalid_max_order_fails_loudly() {
    let err = PooledAllocator::new(PoolConfig::new().with_max_order(15))
        .expect_err("树深 15 必须被拒绝");
    assert_eq!(err.code(), codes::BAD_CONFIG);
    assert!(
        err.message().contains("0-14"),
        "错误消息应给出合法区间: {}",
        err.message()
    );
}

#[test]
fn huge_allocation_bypasses_chunks_entirely() {
    let pool = single_arena_pool();
    let buf = pool
        .new_heap_buffer(CHUNK + 1, CHUNK * 2)
        .expect("超块请求走直接分配");
    assert!(!buf.is_pooled());
    assert_eq!(buf.capacity(), CHUNK + 1, "huge 容量不归一化");
    assert_eq!(pool.statistics().chunk_count, 0, "huge 不得创建池内块");
    drop(buf);
    assert_eq!(pool.statistics().active_leases, 0);
}

#[test]
fn allocate_free_round_trip_restores_pool_state() {
    // 性质：在“结构已就位”的池上（等级的子页、块都经历过首次使用），
    // 同尺寸的一次分配-释放把池精确带回操作前的状态。首轮操作会留下
    // 结构性驻留（每个 tiny/small 等级保留最后一个子页），因此先做
    // 一轮预热，再对第二轮往返做逐字节对账。
    let pool = single_arena_pool();
    let sizes = [1usize, 16, 100, 511, 512, 4096, PAGE, PAGE * 4, CHUNK];

    for size in sizes {
        // 预热：让该等级的子页池与块结构稳定下来。
        drop(pool.new_heap_buffer(size, CHUNK).expect("预热分配"));
        pool.free_current_thread_cache();
        let baseline = pool.statistics();

        let buf = pool.new_heap_buffer(size, CHUNK).expect("往返分配");
        drop(buf);
        pool.free_current_thread_cache();

        let after = pool.statistics();
        assert_eq!(
            (after.allocated_bytes, after.available_bytes, after.chunk_count),
            (
                baseline.allocated_bytes,
                baseline.available_bytes,
                baseline.chunk_count
            ),
            "尺寸 {size} 的往返未能复原池状态"
        );
    }
    assert_eq!(pool.statistics().active_leases, 0);
}

#[test]
fn concurrent_buffers_never_overlap() {
    // 互不重叠的经典观测法：每个缓冲写满自有签名，
    // 任何区间重叠都会在校验阶段表现为签名被污染。
    let pool = std::sync::Arc::new(single_arena_pool());
    let mut workers = Vec::new();
    for t in 0..4u8 {
        let pool = std::sync::Arc::clone(&pool);
        workers.push(std::thread::spawn(move || {
            let mut live = Vec::new();
            for i in 0..64u8 {
                let size = match i % 4 {
                    0 => 32,
                    1 => 640,
                    2 => 4096,
                    _ => PAGE * 2,
                };
                let mut buf = pool.new_heap_buffer(size, size).expect("并发分配");
                let signature = t.wrapping_mul(67).wrapping_add(i);
                let cap = buf.capacity();
                buf.put_bytes(signature, cap);
                live.push((buf, signature));
                if i % 3 == 0 {
                    // 交错释放制造复用压力。
                    live.swap_remove((i as usize * 7) % live.len());
                }
            }
            for (buf, signature) in &live {
                assert!(
                    buf.as_slice().iter().all(|b| b == signature),
                    "缓冲签名被并发写入污染"
                );
            }
            drop(live);
        }));
    }
    for w in workers {
        w.join().expect("并发工作线程不应 panic");
    }
}
