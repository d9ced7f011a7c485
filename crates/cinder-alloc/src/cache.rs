//! 线程缓存：释放与再分配之间的无锁直通车。
//!
//! # 设计背景（Why）
//! - 网络负载的分配模式高度重复：同一线程反复申请再释放同一等级的
//!   缓冲。让释放的区间先在线程本地停留，下一次同级请求即可免锁命中，
//!   Arena 锁只在缓存未命中时才会被触碰。
//! - 每个尺寸等级一条有界环形队列（tiny 512、small 256、normal 64），
//!   队列满即拒收、由调用方直接还给 Arena；超过 32 KiB 的容量不缓存，
//!   避免少数大缓冲长期霸占内存。
//!
//! # 并发（What）
//! - 环形队列选用无锁的 [`ArrayQueue`]：热路径上只有拥有线程触碰它，
//!   而清理线程在判定拥有线程死亡后可以直接排空同一批队列，
//!   无需与死者握手。
//! - 条目必须归还到“起源 Arena”——本线程绑定的 Arena 与条目的
//!   起源可以不同，条目内嵌的 `Arc<PoolArena>` 保证了这一点。

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::arena::{PoolArena, RawAlloc};
use crate::config::ResolvedConfig;
use crate::region::MemoryKind;
use crate::size_class::{SizeClass, SizeClasses, TINY_CLASS_COUNT};

/// 待复用的已释放区间。持有起源 Arena 的强引用：只要条目还在队列里，
/// 对应的块就有存活的分配记录，基址指针保持有效。
pub(crate) struct CacheEntry {
    pub arena: Arc<PoolArena>,
    pub chunk_id: u32,
    pub handle: u64,
    pub base: NonNull<u8>,
    pub offset: usize,
    pub cap: usize,
}

// 条目只在拥有线程与清理线程之间转移，指向的区间在树中仍记为已分配，
// 不存在并发访问同一字节的路径。
unsafe impl Send for CacheEntry {}

impl CacheEntry {
    /// 把条目交还起源 Arena（修剪、排空或队列拒收时的出口）。
    pub(crate) fn release(self) {
        self.arena.free(self.chunk_id, self.handle);
    }

    fn into_raw(self) -> (Arc<PoolArena>, RawAlloc) {
        let raw = RawAlloc {
            chunk_id: self.chunk_id,
            handle: self.handle,
            base: self.base,
            offset: self.offset,
            cap: self.cap,
        };
        (self.arena, raw)
    }
}

/// 单个尺寸等级的环形队列；深度为 0 时退化为“永远拒收”。
struct Ring {
    queue: Option<ArrayQueue<CacheEntry>>,
    capacity: u32,
    /// 自上次修剪以来的命中数，决定修剪力度。
    pops_since_trim: AtomicU32,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            queue: (capacity > 0).then(|| ArrayQueue::new(capacity)),
            capacity: capacity as u32,
            pops_since_trim: AtomicU32::new(0),
        }
    }

    fn pop(&self) -> Option<CacheEntry> {
        let entry = self.queue.as_ref()?.pop()?;
        self.pops_since_trim.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    fn push(&self, entry: CacheEntry) -> Result<(), CacheEntry> {
        match &self.queue {
            Some(queue) => queue.push(entry),
            None => Err(entry),
        }
    }

    /// 修剪：自上次修剪以来没被命中消化掉的配额全部归还 Arena。
    ///
    /// `capacity - pops` 为本轮可驱逐的条目数——命中越少，说明该等级
    /// 正在降温，驻留的条目越应该让出去。
    fn trim(&self) {
        let pops = self.pops_since_trim.swap(0, Ordering::Relaxed);
        let spare = self.capacity.saturating_sub(pops);
        for _ in 0..spare {
            match self.queue.as_ref().and_then(|q| q.pop()) {
                Some(entry) => entry.release(),
                None => break,
            }
        }
    }

    fn drain(&self) -> usize {
        let mut released = 0;
        while let Some(entry) = self.queue.as_ref().and_then(|q| q.pop()) {
            entry.release();
            released += 1;
        }
        released
    }
}

/// 一类内存（堆或直接内存）的整套等级队列。
struct KindCaches {
    /// 本线程在该类内存上绑定的 Arena，缓存未命中时的去处。
    arena: Arc<PoolArena>,
    tiny: Box<[Ring]>,
    small: Box<[Ring]>,
    normal: Box<[Ring]>,
}

impl KindCaches {
    fn new(arena: Arc<PoolArena>, cfg: &ResolvedConfig) -> Self {
        let sc = cfg.size_classes;
        // 环数 = 可缓存的最大 2 的幂等级；上限不是 2 的幂时向下取整，
        // 绝不为超过上限的等级建队列。
        let normal_count = if cfg.max_cached_buffer_capacity >= sc.page_size {
            let max = cfg.max_cached_buffer_capacity.min(sc.chunk_size);
            (crate::size_class::log2(max / sc.page_size) + 1) as usize
        } else {
            0
        };
        let rings = |count: usize, depth: usize| -> Box<[Ring]> {
            (0..count).map(|_| Ring::new(depth)).collect()
        };
        Self {
            arena,
            tiny: rings(TINY_CLASS_COUNT, cfg.tiny_cache_size),
            small: rings(sc.small_class_count(), cfg.small_cache_size),
            normal: rings(normal_count, cfg.normal_cache_size),
        }
    }

    fn ring(&self, sc: &SizeClasses, norm: usize, class: SizeClass) -> Option<&Ring> {
        match class {
            SizeClass::Tiny => self.tiny.get(sc.tiny_idx(norm)),
            SizeClass::Small => self.small.get(sc.small_idx(norm)),
            SizeClass::Normal => self.normal.get(sc.normal_idx(norm)),
            SizeClass::Huge => None,
        }
    }

    fn for_each_ring(&self, mut f: impl FnMut(&Ring)) {
        self.tiny.iter().for_each(&mut f);
        self.small.iter().for_each(&mut f);
        self.normal.iter().for_each(&mut f);
    }
}

/// 一个线程的完整缓存。创建后由 TLS 与清理注册表共同持有（`Arc`）。
pub(crate) struct ThreadCache {
    sc: SizeClasses,
    heap: Option<KindCaches>,
    direct: Option<KindCaches>,
    /// 自上次全量修剪以来的缓存命中数。
    allocations: AtomicU32,
    trim_interval: u32,
}

impl ThreadCache {
    pub(crate) fn new(
        heap_arena: Option<Arc<PoolArena>>,
        direct_arena: Option<Arc<PoolArena>>,
        cfg: &ResolvedConfig,
    ) -> Self {
        Self {
            sc: cfg.size_classes,
            heap: heap_arena.map(|a| KindCaches::new(a, cfg)),
            direct: direct_arena.map(|a| KindCaches::new(a, cfg)),
            allocations: AtomicU32::new(0),
            trim_interval: cfg.cache_trim_interval,
        }
    }

    fn kind_caches(&self, kind: MemoryKind) -> Option<&KindCaches> {
        match kind {
            MemoryKind::Heap => self.heap.as_ref(),
            MemoryKind::Direct => self.direct.as_ref(),
        }
    }

    /// 本线程在该类内存上绑定的 Arena。
    pub(crate) fn bound_arena(&self, kind: MemoryKind) -> Option<&Arc<PoolArena>> {
        self.kind_caches(kind).map(|set| &set.arena)
    }

    /// 缓存命中路径：弹出一个同级条目并重建分配描述。
    ///
    /// 命中计数达到修剪间隔时顺手做一轮全量修剪——修剪发生在
    /// 拥有线程自己的分配路径上，无需额外调度。
    pub(crate) fn try_allocate(
        &self,
        kind: MemoryKind,
        norm: usize,
        class: SizeClass,
    ) -> Option<(Arc<PoolArena>, RawAlloc)> {
        let set = self.kind_caches(kind)?;
        let entry = set.ring(&self.sc, norm, class)?.pop()?;
        let hits = self.allocations.fetch_add(1, Ordering::Relaxed) + 1;
        if hits >= self.trim_interval {
            self.allocations.store(0, Ordering::Relaxed);
            self.trim();
        }
        Some(entry.into_raw())
    }

    /// 缓存回收路径：容量可缓存且队列有空位则入队，否则原样退还，
    /// 由调用方直接交给起源 Arena。
    pub(crate) fn try_add(&self, entry: CacheEntry) -> Result<(), CacheEntry> {
        let kind = entry.arena.kind();
        let class = self.sc.classify(entry.cap);
        let Some(set) = self.kind_caches(kind) else {
            return Err(entry);
        };
        match set.ring(&self.sc, entry.cap, class) {
            Some(ring) => ring.push(entry),
            None => Err(entry),
        }
    }

    /// 全量修剪：每条队列驱逐“未被命中消化”的配额。
    pub(crate) fn trim(&self) {
        if let Some(set) = &self.heap {
            set.for_each_ring(Ring::trim);
        }
        if let Some(set) = &self.direct {
            set.for_each_ring(Ring::trim);
        }
    }

    /// 清空全部队列，把每个条目还给起源 Arena。
    ///
    /// 幂等：线程退出钩子与周期巡检可以安全地先后调用。
    pub(crate) fn drain(&self) -> usize {
        let mut released = 0;
        if let Some(set) = &self.heap {
            set.for_each_ring(|r| released += r.drain());
        }
        if let Some(set) = &self.direct {
            set.for_each_ring(|r| released += r.drain());
        }
        released
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        // 兜底：即使注册表没来得及排空，条目也不能泄漏在队列里。
        self.drain();
    }
}
