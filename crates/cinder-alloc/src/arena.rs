//! Arena：一把锁之下的块集合与子页池。
//!
//! # 设计背景（Why）
//! - 全局只有一个分配器锁时，高并发下的争用会吞掉池化的全部收益。
//!   引擎因此把状态切成若干彼此独立的 Arena，线程按轮转绑定其一；
//!   Arena 内部则退回到最朴素的方案——单把互斥锁保护块链表、
//!   伙伴树与子页池的一切变更，锁内只做 O(max_order) 的树操作。
//! - 块按使用率分入六个档位链表。分配时的搜索顺序是
//!   `q050 → q025 → q000 → qInit → q075`：优先榨取半满的块能让热块
//!   保持活跃、减少在用块总数；把 q075 放到最后，是让接近满载的块
//!   尽快漂向 q100 并在排空后成为可回收对象。q100 从不参与搜索。
//!
//! # 契约说明（What）
//! - 所有公开方法线程安全；除 `allocate_huge` 外都会短暂持有 Arena 锁。
//! - 释放路径不返回错误；句柄非法属编程错误，仅在 debug 构建断言。

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::chunk::{
    encode_run_handle, encode_subpage_handle, handle_bitmap_idx, handle_mem_map_idx,
    is_subpage_handle, PoolChunk,
};
use crate::error::PoolError;
use crate::region::{MemoryKind, Region, RegionProvider};
use crate::size_class::{log2, SizeClass, SizeClasses, TINY_CLASS_COUNT};
use crate::subpage::{PoolSubpage, SubpageFree, SubpageRef};

/// 块使用率档位。区间端点与迁移规则见各变体注释；迁移只发生在
/// 分配（向前）与释放（向后）之后，`QInit` 永不回迁。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tier {
    /// 全新块的入口档：使用率 < 25% 且尚未证明过自己有用。
    QInit,
    /// 1%–50%。向后越过下界意味着块已彻底排空，成为回收候选。
    Q000,
    /// 25%–75%。
    Q025,
    /// 50%–100%。
    Q050,
    /// 75%–100%。
    Q075,
    /// 满载档，从不参与分配搜索。
    Q100,
}

/// 分配搜索顺序（`q100` 缺席是刻意的）。
const ALLOC_ORDER: [Tier; 5] = [Tier::Q050, Tier::Q025, Tier::Q000, Tier::QInit, Tier::Q075];

/// 档位总数，档位链表头数组的长度。
const TIER_COUNT: usize = 6;

/// 使用率跌破下界时的去向。
enum Backward {
    /// 留在原档（`QInit`）。
    Stay,
    /// 退到前一档。
    To(Tier),
    /// 已到 `Q000` 下界：块彻底排空，进入回收判定。
    ReleaseCandidate,
}

impl Tier {
    fn index(self) -> usize {
        match self {
            Tier::QInit => 0,
            Tier::Q000 => 1,
            Tier::Q025 => 2,
            Tier::Q050 => 3,
            Tier::Q075 => 4,
            Tier::Q100 => 5,
        }
    }

    fn min_usage(self) -> i64 {
        match self {
            Tier::QInit => i64::MIN,
            Tier::Q000 => 1,
            Tier::Q025 => 25,
            Tier::Q050 => 50,
            Tier::Q075 => 75,
            Tier::Q100 => 100,
        }
    }

    fn max_usage(self) -> i64 {
        match self {
            Tier::QInit => 25,
            Tier::Q000 => 50,
            Tier::Q025 => 75,
            Tier::Q050 => 100,
            Tier::Q075 => 100,
            Tier::Q100 => i64::MAX,
        }
    }

    fn forward(self) -> Option<Tier> {
        match self {
            Tier::QInit => Some(Tier::Q000),
            Tier::Q000 => Some(Tier::Q025),
            Tier::Q025 => Some(Tier::Q050),
            Tier::Q050 => Some(Tier::Q075),
            Tier::Q075 => Some(Tier::Q100),
            Tier::Q100 => None,
        }
    }

    fn backward(self) -> Backward {
        match self {
            Tier::QInit => Backward::Stay,
            Tier::Q000 => Backward::ReleaseCandidate,
            Tier::Q025 => Backward::To(Tier::Q000),
            Tier::Q050 => Backward::To(Tier::Q025),
            Tier::Q075 => Backward::To(Tier::Q050),
            Tier::Q100 => Backward::To(Tier::Q075),
        }
    }
}

/// 一次池内分配的原始描述，供缓冲层与线程缓存消费。
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawAlloc {
    pub chunk_id: u32,
    pub handle: u64,
    /// 所在块后备区域的基址；块存活期间恒定。
    pub base: NonNull<u8>,
    /// 分配区间在块内的字节偏移。
    pub offset: usize,
    /// 归一化容量。
    pub cap: usize,
}

/// 子页池：某个尺寸等级下所有“部分占用”子页组成的侵入式链表。
#[derive(Clone, Copy, Default)]
struct SubpagePool {
    head: Option<SubpageRef>,
    len: usize,
}

/// Arena 锁内状态。
struct ArenaShared {
    sc: SizeClasses,
    max_order: u32,
    /// 块槽位表：块 id 即下标，回收后的槽位复用。
    chunks: Vec<Option<PoolChunk>>,
    free_slots: Vec<u32>,
    tier_heads: [Option<u32>; TIER_COUNT],
    tiny_pools: [SubpagePool; TINY_CLASS_COUNT],
    small_pools: Vec<SubpagePool>,
}

/// 子页池的定位键。
#[derive(Clone, Copy, Debug)]
enum PoolKey {
    Tiny(usize),
    Small(usize),
}

/// 单个 Arena：一组块、六个档位链表、每尺寸等级一个子页池。
pub(crate) struct PoolArena {
    kind: MemoryKind,
    sc: SizeClasses,
    provider: Box<dyn RegionProvider>,
    shared: Mutex<ArenaShared>,
}

/// 锁内状态的瞬时快照，供统计与测试观测。
#[derive(Clone, Debug)]
pub(crate) struct ArenaStats {
    pub chunk_count: usize,
    pub reserved_bytes: usize,
    pub free_bytes: usize,
    /// 按 `Tier::index` 排列的各档块数。
    pub tier_chunks: [usize; TIER_COUNT],
    /// 仍有空槽的子页总数。
    pub partial_subpages: usize,
}

impl PoolArena {
    pub(crate) fn new(
        provider: Box<dyn RegionProvider>,
        sc: SizeClasses,
        max_order: u32,
    ) -> Self {
        let kind = provider.kind();
        Self {
            kind,
            sc,
            provider,
            shared: Mutex::new(ArenaShared {
                sc,
                max_order,
                chunks: Vec::new(),
                free_slots: Vec::new(),
                tier_heads: [None; TIER_COUNT],
                tiny_pools: [SubpagePool::default(); TINY_CLASS_COUNT],
                small_pools: vec![SubpagePool::default(); sc.small_class_count()],
            }),
        }
    }

    pub(crate) fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub(crate) fn size_classes(&self) -> SizeClasses {
        self.sc
    }

    /// 池内分配（tiny/small/normal）。调用方已先询问过线程缓存。
    pub(crate) fn allocate(&self, norm: usize, class: SizeClass) -> Result<RawAlloc, PoolError> {
        let mut shared = self.shared.lock();
        match class {
            SizeClass::Tiny | SizeClass::Small => {
                shared.allocate_subpage_elem(norm, class, self.provider.as_ref())
            }
            SizeClass::Normal => shared.allocate_normal(norm, self.provider.as_ref()),
            SizeClass::Huge => unreachable!("huge 请求不进入 Arena"),
        }
    }

    /// huge 路径：绕过池直接向供应者索要独立区域，永不缓存。
    pub(crate) fn allocate_huge(&self, size: usize) -> Result<Region, PoolError> {
        self.provider.allocate(size)
    }

    /// 归还一个池内分配。线程缓存拒收或缓存被清排时最终都落到这里。
    pub(crate) fn free(&self, chunk_id: u32, handle: u64) {
        let mut shared = self.shared.lock();
        shared.free_handle(chunk_id, handle);
        shared.reclassify_after_free(chunk_id);
    }

    pub(crate) fn stats(&self) -> ArenaStats {
        let shared = self.shared.lock();
        let mut stats = ArenaStats {
            chunk_count: 0,
            reserved_bytes: 0,
            free_bytes: 0,
            tier_chunks: [0; TIER_COUNT],
            partial_subpages: 0,
        };
        for chunk in shared.chunks.iter().flatten() {
            stats.chunk_count += 1;
            stats.reserved_bytes += chunk.chunk_size();
            stats.free_bytes += chunk.free_bytes();
            stats.tier_chunks[chunk.tier.index()] += 1;
        }
        let pool_len = |p: &SubpagePool| p.len;
        stats.partial_subpages += shared.tiny_pools.iter().map(pool_len).sum::<usize>();
        stats.partial_subpages += shared.small_pools.iter().map(pool_len).sum::<usize>();
        stats
    }
}

impl ArenaShared {
    // ---- 子页（tiny/small）路径 -------------------------------------------

    fn pool_key(&self, norm: usize, class: SizeClass) -> PoolKey {
        match class {
            SizeClass::Tiny => PoolKey::Tiny(self.sc.tiny_idx(norm)),
            SizeClass::Small => PoolKey::Small(self.sc.small_idx(norm)),
            _ => unreachable!("子页池只服务 tiny/small"),
        }
    }

    fn pool(&self, key: PoolKey) -> &SubpagePool {
        match key {
            PoolKey::Tiny(i) => &self.tiny_pools[i],
            PoolKey::Small(i) => &self.small_pools[i],
        }
    }

    fn pool_mut(&mut self, key: PoolKey) -> &mut SubpagePool {
        match key {
            PoolKey::Tiny(i) => &mut self.tiny_pools[i],
            PoolKey::Small(i) => &mut self.small_pools[i],
        }
    }

    fn allocate_subpage_elem(
        &mut self,
        norm: usize,
        class: SizeClass,
        provider: &dyn RegionProvider,
    ) -> Result<RawAlloc, PoolError> {
        let key = self.pool_key(norm, class);
        if self.pool(key).head.is_some() {
            return Ok(self.allocate_from_pool(key));
        }

        // 该等级暂无部分占用子页：从块里切出一个新页并就地建子页。
        let (chunk_id, leaf) = self.claim_run(self.max_order, provider)?;
        let chunk = self.chunk_mut(chunk_id);
        let page_idx = chunk.page_idx(leaf);
        let run_offset = chunk.run_offset(leaf);
        let page_size = chunk.page_size();
        chunk.install_subpage(page_idx, PoolSubpage::new(leaf, run_offset, page_size, norm));
        self.pool_insert(key, SubpageRef { chunk_id, page_idx });
        self.reclassify_after_alloc(chunk_id);
        Ok(self.allocate_from_pool(key))
    }

    /// 从等级池表头取一个槽位。表头存在即保证有空槽。
    fn allocate_from_pool(&mut self, key: PoolKey) -> RawAlloc {
        let head = self.pool(key).head.expect("调用前必须确认池非空");
        let (alloc, became_full) = {
            let chunk = self.chunks[head.chunk_id as usize]
                .as_mut()
                .expect("池中引用指向存活的块");
            let base = chunk.base();
            let sp = chunk
                .subpage_mut(head.page_idx)
                .expect("池中引用指向存活的子页");
            let bitmap_idx = sp.allocate().expect("池中子页必有空槽");
            let alloc = RawAlloc {
                chunk_id: head.chunk_id,
                handle: encode_subpage_handle(sp.mem_map_idx(), bitmap_idx),
                base,
                offset: sp.elem_offset(bitmap_idx),
                cap: sp.elem_size(),
            };
            (alloc, sp.num_avail() == 0)
        };
        if became_full {
            // 满载子页离开池，维持“池中子页必有空槽”的不变式。
            self.pool_remove(key, head);
        }
        alloc
    }

    fn pool_insert(&mut self, key: PoolKey, r: SubpageRef) {
        let old_head = self.pool(key).head;
        {
            let sp = self.subpage_mut(r);
            debug_assert!(!sp.in_pool, "子页不得重复入池");
            sp.in_pool = true;
            sp.prev = None;
            sp.next = old_head;
        }
        if let Some(old) = old_head {
            self.subpage_mut(old).prev = Some(r);
        }
        let pool = self.pool_mut(key);
        pool.head = Some(r);
        pool.len += 1;
    }

    fn pool_remove(&mut self, key: PoolKey, r: SubpageRef) {
        let (prev, next) = {
            let sp = self.subpage_mut(r);
            debug_assert!(sp.in_pool, "移除的子页必须在池中");
            sp.in_pool = false;
            (sp.prev.take(), sp.next.take())
        };
        match prev {
            Some(p) => self.subpage_mut(p).next = next,
            None => self.pool_mut(key).head = next,
        }
        if let Some(n) = next {
            self.subpage_mut(n).prev = prev;
        }
        self.pool_mut(key).len -= 1;
    }

    fn subpage_mut(&mut self, r: SubpageRef) -> &mut PoolSubpage {
        self.chunks[r.chunk_id as usize]
            .as_mut()
            .expect("子页引用指向存活的块")
            .subpage_mut(r.page_idx)
            .expect("子页引用指向存活的子页")
    }

    // ---- normal 路径 ------------------------------------------------------

    fn allocate_normal(
        &mut self,
        norm: usize,
        provider: &dyn RegionProvider,
    ) -> Result<RawAlloc, PoolError> {
        let d = self.max_order - (log2(norm) - self.sc.page_shifts);
        let (chunk_id, node) = self.claim_run(d, provider)?;
        let chunk = self.chunk_ref(chunk_id);
        let alloc = RawAlloc {
            chunk_id,
            handle: encode_run_handle(node),
            base: chunk.base(),
            offset: chunk.run_offset(node),
            cap: chunk.run_size(node),
        };
        self.reclassify_after_alloc(chunk_id);
        Ok(alloc)
    }

    /// 依档位顺序在现有块中找一个深度 `d` 的运行；全部失败则新建块。
    fn claim_run(
        &mut self,
        d: u32,
        provider: &dyn RegionProvider,
    ) -> Result<(u32, u32), PoolError> {
        for tier in ALLOC_ORDER {
            let mut cur = self.tier_heads[tier.index()];
            while let Some(id) = cur {
                let chunk = self.chunks[id as usize].as_mut().expect("链表节点必须存活");
                if let Some(node) = chunk.allocate_run(d) {
                    return Ok((id, node));
                }
                cur = chunk.next;
            }
        }

        let region = provider.allocate(self.sc.chunk_size)?;
        let chunk = PoolChunk::new(region, self.sc.page_size, self.max_order);
        let id = self.insert_chunk(chunk);
        let node = self
            .chunk_mut(id)
            .allocate_run(d)
            .expect("全新块必然容得下任何池内运行");
        Ok((id, node))
    }

    fn insert_chunk(&mut self, chunk: PoolChunk) -> u32 {
        let id = match self.free_slots.pop() {
            Some(id) => {
                self.chunks[id as usize] = Some(chunk);
                id
            }
            None => {
                self.chunks.push(Some(chunk));
                (self.chunks.len() - 1) as u32
            }
        };
        self.link_into_tier(id, Tier::QInit);
        id
    }

    // ---- 释放与档位迁移 ----------------------------------------------------

    fn free_handle(&mut self, chunk_id: u32, handle: u64) {
        if !is_subpage_handle(handle) {
            self.chunk_mut(chunk_id).free_run(handle_mem_map_idx(handle));
            return;
        }

        let leaf = handle_mem_map_idx(handle);
        let bitmap_idx = handle_bitmap_idx(handle);
        let (outcome, elem_size, page_idx) = {
            let chunk = self.chunk_mut(chunk_id);
            let page_idx = chunk.page_idx(leaf);
            let sp = chunk
                .subpage_mut(page_idx)
                .expect("子页句柄指向存活的子页");
            (sp.free(bitmap_idx), sp.elem_size(), page_idx)
        };
        let class = self.sc.classify(elem_size);
        let key = self.pool_key(elem_size, class);
        let r = SubpageRef { chunk_id, page_idx };
        match outcome {
            SubpageFree::WasFull => self.pool_insert(key, r),
            SubpageFree::StillInUse => {}
            SubpageFree::Empty => {
                // 等级池里仅剩这一个子页时保留它，避免下一个同级请求
                // 立刻重建；否则连同底层页一起归还伙伴树。
                if self.pool(key).len > 1 {
                    self.pool_remove(key, r);
                    let chunk = self.chunk_mut(chunk_id);
                    chunk.remove_subpage(page_idx);
                    chunk.free_run(leaf);
                }
            }
        }
    }

    fn reclassify_after_alloc(&mut self, chunk_id: u32) {
        loop {
            let (usage, tier) = {
                let c = self.chunk_ref(chunk_id);
                (c.usage() as i64, c.tier)
            };
            let Some(next) = tier.forward() else { break };
            if usage < tier.max_usage() {
                break;
            }
            self.move_chunk(chunk_id, next);
        }
    }

    fn reclassify_after_free(&mut self, chunk_id: u32) {
        loop {
            let (usage, tier) = {
                let c = self.chunk_ref(chunk_id);
                (c.usage() as i64, c.tier)
            };
            if usage >= tier.min_usage() {
                break;
            }
            match tier.backward() {
                Backward::Stay => break,
                Backward::To(prev) => self.move_chunk(chunk_id, prev),
                Backward::ReleaseCandidate => {
                    debug_assert_eq!(usage, 0, "q000 下界只可能因彻底排空而触及");
                    // 仅当 qInit 仍备有新鲜块时才把这块内存还给供应者；
                    // 否则留着它吸收下一波分配，避免块级抖动。
                    if self.tier_heads[Tier::QInit.index()].is_some() {
                        self.unlink_chunk(chunk_id);
                        self.chunks[chunk_id as usize] = None;
                        self.free_slots.push(chunk_id);
                    }
                    break;
                }
            }
        }
    }

    fn move_chunk(&mut self, chunk_id: u32, to: Tier) {
        self.unlink_chunk(chunk_id);
        self.link_into_tier(chunk_id, to);
    }

    fn link_into_tier(&mut self, chunk_id: u32, tier: Tier) {
        let old_head = self.tier_heads[tier.index()];
        {
            let chunk = self.chunk_mut(chunk_id);
            chunk.tier = tier;
            chunk.prev = None;
            chunk.next = old_head;
        }
        if let Some(old) = old_head {
            self.chunk_mut(old).prev = Some(chunk_id);
        }
        self.tier_heads[tier.index()] = Some(chunk_id);
    }

    fn unlink_chunk(&mut self, chunk_id: u32) {
        let (tier, prev, next) = {
            let chunk = self.chunk_mut(chunk_id);
            (chunk.tier, chunk.prev.take(), chunk.next.take())
        };
        match prev {
            Some(p) => self.chunk_mut(p).next = next,
            None => self.tier_heads[tier.index()] = next,
        }
        if let Some(n) = next {
            self.chunk_mut(n).prev = prev;
        }
    }

    fn chunk_ref(&self, chunk_id: u32) -> &PoolChunk {
        self.chunks[chunk_id as usize]
            .as_ref()
            .expect("块 id 必须指向存活的块")
    }

    fn chunk_mut(&mut self, chunk_id: u32) -> &mut PoolChunk {
        self.chunks[chunk_id as usize]
            .as_mut()
            .expect("块 id 必须指向存活的块")
    }
}
