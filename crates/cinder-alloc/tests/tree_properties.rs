//! 池状态性质验证（影子模型）。
//!
//! # 教案级导览
//!
//! - **Why**：伙伴树的字节守恒与归一化的单调性是整个引擎的地基；
//!   任何一次分配/释放序列破坏它们，都意味着池在悄悄漏字节或错配
//!   等级。性质测试用随机序列把这两条不变式钉死在公开接口上。
//! - **How**：关闭线程缓存（三级队列深度全部置零）让统计快照与块
//!   层面严格同步；影子模型只记录每个存活缓冲的归一化容量，
//!   逐步与 `allocated_bytes - available_bytes` 对账。
//! - **What**：
//!   1. 守恒：任意时刻块持有字节 − 空闲字节 = 存活容量之和；
//!   2. 归一化单调：`c1 <= c2 ⇒ capacity(c1) <= capacity(c2)`；
//!   3. 往返：全部释放后池回到“无占用”状态。
//! - **Trade-offs**：模型只覆盖 normal 等级的精确对账——tiny/small
//!   的页粒度计账属于子页职责，由 crate 内部的单元与属性测试锁定。

use proptest::prelude::*;

use cinder_alloc::{PoolConfig, PooledAllocator, PooledBuf};

const PAGE: usize = 4096;
const ORDER: u32 = 3;
const CHUNK: usize = PAGE << ORDER;

fn uncached_pool() -> PooledAllocator {
    PooledAllocator::new(
        PoolConfig::new()
            .with_num_heap_arenas(1)
            .with_num_direct_arenas(0)
            .with_page_size(PAGE)
            .with_max_order(ORDER)
            .with_cache_sizes(0, 0, 0),
    )
    .expect("无缓存配置合法")
}

/// 一步操作：`alloc` 为真时按 `selector` 取一个 normal 尺寸，
/// 否则释放第 `selector % live.len()` 个存活缓冲。
#[derive(Clone, Debug)]
struct Step {
    alloc: bool,
    selector: u32,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    (any::<bool>(), any::<u32>()).prop_map(|(alloc, selector)| Step { alloc, selector })
}

fn live_bytes(live: &[PooledBuf]) -> usize {
    live.iter().map(PooledBuf::capacity).sum()
}

proptest! {
    /// 性质 1 + 3：字节守恒贯穿任意操作序列，终态完全复原。
    #[test]
    fn conservation_holds_across_random_sequences(
        steps in proptest::collection::vec(step_strategy(), 1..48)
    ) {
        let pool = uncached_pool();
        let mut live: Vec<PooledBuf> = Vec::new();

        for step in steps {
            if step.alloc {
                // normal 等级：1、2、4 或 8 页。
                let pages = 1usize << (step.selector % (ORDER + 1));
                let size = PAGE * pages;
                match pool.new_heap_buffer(size, CHUNK) {
                    Ok(buf) => live.push(buf),
                    // 池会自动扩块，分配只在系统内存耗尽时失败；
                    // 属性测试环境下视为不可达。
                    Err(err) => prop_assert!(false, "池内分配不应失败: {err}"),
                }
            } else if !live.is_empty() {
                let idx = step.selector as usize % live.len();
                drop(live.swap_remove(idx));
            }

            let stats = pool.statistics();
            prop_assert_eq!(
                stats.allocated_bytes - stats.available_bytes,
                live_bytes(&live),
                "块持有减空闲必须等于存活容量之和（live={}）",
                live.len()
            );
        }

        drop(live);
        let stats = pool.statistics();
        prop_assert_eq!(
            stats.available_bytes,
            stats.allocated_bytes,
            "终态必须无任何存活占用"
        );
        prop_assert_eq!(stats.active_leases, 0usize);
    }

    /// 性质 2：归一化容量对请求容量单调不减，且从不缩小请求。
    #[test]
    fn normalized_capacity_is_monotone(c1 in 1usize..CHUNK, c2 in 1usize..CHUNK) {
        let pool = uncached_pool();
        let (lo, hi) = if c1 <= c2 { (c1, c2) } else { (c2, c1) };
        let buf_lo = pool.new_heap_buffer(lo, CHUNK).expect("较小请求");
        let buf_hi = pool.new_heap_buffer(hi, CHUNK).expect("较大请求");
        prop_assert!(buf_lo.capacity() >= lo, "归一化不得缩小请求");
        prop_assert!(buf_hi.capacity() >= hi);
        prop_assert!(
            buf_lo.capacity() <= buf_hi.capacity(),
            "归一化必须单调: {} -> {}, {} -> {}",
            lo, buf_lo.capacity(), hi, buf_hi.capacity()
        );
    }
}
