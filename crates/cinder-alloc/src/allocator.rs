//! 分配器门面：Arena 编队 + 路由器 + 公开操作。
//!
//! # 设计背景（Why）
//! - 对上层运行时而言，池就是三个动作：按类别要缓冲、问一句直接内存
//!   是否池化、在需要时读一份统计快照。其余一切（归一化、缓存命中、
//!   档位迁移、死线程清扫）都收在门面之下。
//!
//! # 数据流（How）
//! - `new_*_buffer` → 线程缓存弹出（免锁）；未命中 → 绑定 Arena 加锁
//!   分配；huge → 绕过池直取独立区域。释放路径由 [`PooledBuf`] 的
//!   析构逆向走完。

use std::sync::Arc;

use crate::arena::PoolArena;
use crate::buffer::PooledBuf;
use crate::config::{PoolConfig, ResolvedConfig};
use crate::error::{codes, PoolError};
use crate::region::{DirectRegionProvider, HeapRegionProvider, MemoryKind};
use crate::router::CacheRouter;
use crate::size_class::SizeClass;
use crate::stats::{PoolStatDimension, PoolStats};

/// 档位维度键，与 `Tier::index` 顺序一致。
const TIER_DIMENSION_KEYS: [&str; 6] = [
    "qinit_chunks",
    "q000_chunks",
    "q025_chunks",
    "q050_chunks",
    "q075_chunks",
    "q100_chunks",
];

/// 池化字节缓冲分配器。
///
/// # 契约说明（What）
/// - **线程安全**：所有方法可被任意线程并发调用；
/// - **构造失败**：非法配置在 [`PooledAllocator::new`] 以
///   [`codes::BAD_CONFIG`] 立即失败，绝不带病运行；
/// - **关闭语义**：析构时先排空全部线程缓存并撤销巡检任务，
///   Arena 与块随最后一个存活缓冲的消亡而释放。
pub struct PooledAllocator {
    cfg: ResolvedConfig,
    heap_arenas: Vec<Arc<PoolArena>>,
    direct_arenas: Vec<Arc<PoolArena>>,
    router: Arc<CacheRouter>,
}

impl PooledAllocator {
    /// 校验配置并组建 Arena 编队。
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        let cfg = config.resolve()?;
        let sc = cfg.size_classes;
        let heap_arenas: Vec<Arc<PoolArena>> = (0..cfg.num_heap_arenas)
            .map(|_| {
                Arc::new(PoolArena::new(
                    Box::new(HeapRegionProvider),
                    sc,
                    cfg.max_order,
                ))
            })
            .collect();
        let direct_arenas: Vec<Arc<PoolArena>> = (0..cfg.num_direct_arenas)
            .map(|_| {
                Arc::new(PoolArena::new(
                    Box::new(DirectRegionProvider::new(sc.page_size)),
                    sc,
                    cfg.max_order,
                ))
            })
            .collect();
        let router = CacheRouter::new(heap_arenas.clone(), direct_arenas.clone(), cfg.clone());

        tracing::debug!(
            num_heap_arenas = cfg.num_heap_arenas,
            num_direct_arenas = cfg.num_direct_arenas,
            page_size = cfg.page_size(),
            max_order = cfg.max_order,
            chunk_size = cfg.chunk_size(),
            tiny_cache_size = cfg.tiny_cache_size,
            small_cache_size = cfg.small_cache_size,
            normal_cache_size = cfg.normal_cache_size,
            max_cached_buffer_capacity = cfg.max_cached_buffer_capacity,
            cache_trim_interval = cfg.cache_trim_interval,
            cache_cleanup_interval_ms = cfg.cache_cleanup_interval.as_millis() as u64,
            "pooled allocator constructed"
        );

        Ok(Self {
            cfg,
            heap_arenas,
            direct_arenas,
            router,
        })
    }

    /// 等价于 `new(PoolConfig::default())`。
    pub fn with_defaults() -> Result<Self, PoolError> {
        Self::new(PoolConfig::default())
    }

    /// 申请一个堆内存缓冲。
    pub fn new_heap_buffer(
        &self,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, PoolError> {
        self.new_buffer(MemoryKind::Heap, initial_capacity, max_capacity)
    }

    /// 申请一个直接内存（页对齐）缓冲。
    pub fn new_direct_buffer(
        &self,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, PoolError> {
        self.new_buffer(MemoryKind::Direct, initial_capacity, max_capacity)
    }

    /// 按配置偏好选择内存类别。
    pub fn buffer(
        &self,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, PoolError> {
        let kind = if self.cfg.prefer_direct && !self.direct_arenas.is_empty() {
            MemoryKind::Direct
        } else {
            MemoryKind::Heap
        };
        self.new_buffer(kind, initial_capacity, max_capacity)
    }

    /// 直接内存是否走池化路径。
    pub fn is_direct_pooled(&self) -> bool {
        !self.direct_arenas.is_empty()
    }

    /// 立即释放当前线程在本分配器上的缓存（罕用；线程池收缩前调用）。
    pub fn free_current_thread_cache(&self) {
        self.router.remove_local_cache();
    }

    /// 读取统计快照。
    pub fn statistics(&self) -> PoolStats {
        let mut stats = PoolStats {
            active_leases: self.router.active_leases(),
            registered_thread_caches: self.router.registered_caches(),
            ..PoolStats::default()
        };
        let mut tier_chunks = [0usize; 6];
        let mut partial_subpages = 0;
        for arena in self.heap_arenas.iter().chain(self.direct_arenas.iter()) {
            let s = arena.stats();
            stats.allocated_bytes += s.reserved_bytes;
            stats.available_bytes += s.free_bytes;
            stats.chunk_count += s.chunk_count;
            partial_subpages += s.partial_subpages;
            for (total, n) in tier_chunks.iter_mut().zip(s.tier_chunks) {
                *total += n;
            }
        }
        stats.custom_dimensions = vec![
            PoolStatDimension::new("heap_arenas", self.heap_arenas.len()),
            PoolStatDimension::new("direct_arenas", self.direct_arenas.len()),
            PoolStatDimension::new("partial_subpages", partial_subpages),
            PoolStatDimension::new("sweeper_running", usize::from(self.router.sweeper_running())),
        ];
        for (key, value) in TIER_DIMENSION_KEYS.into_iter().zip(tier_chunks) {
            stats.custom_dimensions.push(PoolStatDimension::new(key, value));
        }
        stats
    }

    fn new_buffer(
        &self,
        kind: MemoryKind,
        initial_capacity: usize,
        max_capacity: usize,
    ) -> Result<PooledBuf, PoolError> {
        if initial_capacity > max_capacity {
            return Err(PoolError::new(
                codes::BAD_CONFIG,
                format!(
                    "initialCapacity: {initial_capacity} (expected: <= maxCapacity {max_capacity})"
                ),
            ));
        }
        let cache = self.router.local_cache()?;
        let Some(bound) = cache.bound_arena(kind) else {
            return Err(PoolError::new(
                codes::ARENA_DISABLED,
                match kind {
                    MemoryKind::Heap => "pooled heap memory is disabled (numHeapArenas = 0)",
                    MemoryKind::Direct => "pooled direct memory is disabled (numDirectArenas = 0)",
                },
            ));
        };
        let sc = bound.size_classes();
        let norm = sc.normalize(initial_capacity);

        let buf = match sc.classify(norm) {
            SizeClass::Huge => {
                let region = bound.allocate_huge(initial_capacity)?;
                PooledBuf::from_region(Arc::clone(&self.router), region, max_capacity)
            }
            class => match cache.try_allocate(kind, norm, class) {
                Some((origin, raw)) => {
                    PooledBuf::from_raw(Arc::clone(&self.router), origin, raw, max_capacity)
                }
                None => {
                    let raw = bound.allocate(norm, class)?;
                    PooledBuf::from_raw(
                        Arc::clone(&self.router),
                        Arc::clone(bound),
                        raw,
                        max_capacity,
                    )
                }
            },
        };
        self.router.lease_created();
        Ok(buf)
    }
}

impl Drop for PooledAllocator {
    fn drop(&mut self) {
        self.router.shutdown();
    }
}

impl std::fmt::Debug for PooledAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAllocator")
            .field("heap_arenas", &self.heap_arenas.len())
            .field("direct_arenas", &self.direct_arenas.len())
            .field("page_size", &self.cfg.page_size())
            .field("chunk_size", &self.cfg.chunk_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BufMut};

    fn small_pool() -> PooledAllocator {
        PooledAllocator::new(
            PoolConfig::new()
                .with_num_heap_arenas(1)
                .with_num_direct_arenas(1)
                .with_page_size(4096)
                .with_max_order(3),
        )
        .expect("测试池必须可构造")
    }

    #[test]
    fn heap_and_direct_buffers_report_their_kind() {
        let pool = small_pool();
        let heap = pool.new_heap_buffer(1024, 4096).expect("堆缓冲");
        let direct = pool.new_direct_buffer(1024, 4096).expect("直接缓冲");
        assert!(!heap.is_direct());
        assert!(direct.is_direct());
        assert!(pool.is_direct_pooled());
        pool.free_current_thread_cache();
    }

    #[test]
    fn zero_direct_arenas_disable_direct_pooling() {
        let pool = PooledAllocator::new(
            PoolConfig::new()
                .with_num_heap_arenas(1)
                .with_num_direct_arenas(0)
                .with_page_size(4096)
                .with_max_order(3),
        )
        .expect("仅堆配置合法");
        assert!(!pool.is_direct_pooled());
        let err = pool.new_direct_buffer(64, 64).expect_err("直接池已禁用");
        assert_eq!(err.code(), codes::ARENA_DISABLED);
    }

    #[test]
    fn initial_capacity_must_not_exceed_max() {
        let pool = small_pool();
        let err = pool.new_heap_buffer(4096, 1024).expect_err("上限校验");
        assert_eq!(err.code(), codes::BAD_CONFIG);
        pool.free_current_thread_cache();
    }

    #[test]
    fn buffer_round_trips_bytes_through_buf_traits() {
        let pool = small_pool();
        let mut buf = pool.new_heap_buffer(256, 4096).expect("缓冲");
        assert!(buf.capacity() >= 256);
        buf.put_slice(b"cinder");
        assert_eq!(buf.remaining(), 6);
        assert_eq!(buf.as_slice(), b"cinder");
        let mut out = [0u8; 6];
        buf.copy_to_slice(&mut out);
        assert_eq!(&out, b"cinder");
        assert_eq!(buf.remaining(), 0);
        pool.free_current_thread_cache();
    }

    #[test]
    fn huge_requests_bypass_the_pool() {
        let pool = small_pool();
        let chunk_size = 4096 << 3;
        let buf = pool
            .new_heap_buffer(chunk_size + 1, chunk_size * 2)
            .expect("huge 缓冲");
        assert!(!buf.is_pooled());
        assert_eq!(buf.capacity(), chunk_size + 1);
        let stats = pool.statistics();
        assert_eq!(stats.chunk_count, 0, "huge 不得占用池内块");
        assert_eq!(stats.active_leases, 1);
        drop(buf);
        assert_eq!(pool.statistics().active_leases, 0);
    }

    #[test]
    fn prefer_direct_routes_default_buffers() {
        let pool = PooledAllocator::new(
            PoolConfig::new()
                .with_num_heap_arenas(1)
                .with_num_direct_arenas(1)
                .with_page_size(4096)
                .with_max_order(3)
                .with_prefer_direct(true),
        )
        .expect("偏好直接内存的配置");
        let buf = pool.buffer(64, 64).expect("默认缓冲");
        assert!(buf.is_direct());
        drop(buf);
        pool.free_current_thread_cache();
    }

    #[test]
    fn statistics_expose_tier_dimensions() {
        let pool = small_pool();
        let buf = pool.new_heap_buffer(4096, 4096).expect("单页缓冲");
        let stats = pool.statistics();
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.allocated_bytes, 4096 << 3);
        assert_eq!(stats.available_bytes, (4096 << 3) - 4096);
        assert_eq!(stats.dimension("qinit_chunks"), Some(1));
        drop(buf);
        pool.free_current_thread_cache();
    }
}
