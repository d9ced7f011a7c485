//! 块：一整片后备区域上的伙伴页分配器。
//!
//! # 设计背景（Why）
//! - 每个块持有 `chunk_size` 字节（默认 16 MiB）并用一棵完全二叉树管理：
//!   深度 `d` 的节点代表 `chunk_size >> d` 字节的连续区间，叶子是单页。
//!   分配 `2^k` 页即是在深度 `max_order - k` 取一个完全空闲的节点。
//! - `memory_map[id]` 记录“以 `id` 为根的子树中，最浅可用深度”：等于自身
//!   深度表示整段空闲，等于 `max_order + 1`（哨兵）表示整段耗尽。一次
//!   树下降即可定位目标，代价 O(max_order)。
//!
//! # 不变式（What）
//! - `memory_map[id] >= depth_map[id]` 恒成立；
//! - 标记叶子后自底向上维护：父节点取两子较小值，伙伴双双完全空闲时
//!   父节点回落到自身深度（重新构成完整的大区间）；
//! - `free_bytes` 精确等于树中未分配区间的字节和。
//!
//! # 数值语义
//! - `memory_map` 按无符号 8 位运算（`max_order <= 14`，哨兵最大 15），
//!   不做符号扩展。

use std::ptr::NonNull;

use crate::arena::Tier;
use crate::region::Region;
use crate::subpage::PoolSubpage;

/// 句柄最高位：置位表示子页分配。
pub(crate) const SUBPAGE_FLAG: u64 = 1 << 63;

/// 位图下标的代际戳：让“子页第 0 槽”与普通运行句柄在编码上可区分。
const BITMAP_IDX_STAMP: u32 = 0x4000_0000;
const BITMAP_IDX_MASK: u32 = 0x3FFF_FFFF;

/// 普通运行句柄：低 32 位即树节点编号。
pub(crate) fn encode_run_handle(mem_map_idx: u32) -> u64 {
    mem_map_idx as u64
}

/// 子页句柄：`(1 << 63) | (戳位 | 位图下标) << 32 | 树节点编号`。
pub(crate) fn encode_subpage_handle(mem_map_idx: u32, bitmap_idx: u32) -> u64 {
    SUBPAGE_FLAG | (((bitmap_idx | BITMAP_IDX_STAMP) as u64) << 32) | mem_map_idx as u64
}

pub(crate) fn is_subpage_handle(handle: u64) -> bool {
    handle & SUBPAGE_FLAG != 0
}

pub(crate) fn handle_mem_map_idx(handle: u64) -> u32 {
    handle as u32
}

pub(crate) fn handle_bitmap_idx(handle: u64) -> u32 {
    ((handle >> 32) as u32) & BITMAP_IDX_MASK
}

/// 单个后备块及其伙伴树。除构造外的所有方法都要求持有所属 Arena 的锁。
pub(crate) struct PoolChunk {
    region: Region,
    /// `memory_map[id]`：子树最浅可用深度；`unusable` 为耗尽哨兵。
    memory_map: Box<[u8]>,
    /// `depth_map[id]`：节点原始深度，构造后不变。
    depth_map: Box<[u8]>,
    /// 已拆分为子页的叶子；下标为页号。
    subpages: Box<[Option<PoolSubpage>]>,
    page_size: usize,
    max_order: u32,
    chunk_size: usize,
    unusable: u8,
    free_bytes: usize,
    /// 使用率档位链表的侵入式指针，由 Arena 在锁内维护。
    pub(crate) tier: Tier,
    pub(crate) prev: Option<u32>,
    pub(crate) next: Option<u32>,
}

impl PoolChunk {
    pub(crate) fn new(region: Region, page_size: usize, max_order: u32) -> Self {
        let chunk_size = page_size << max_order;
        debug_assert_eq!(region.size(), chunk_size);
        let node_count = 1usize << (max_order + 1);
        let mut depth_map = vec![0u8; node_count].into_boxed_slice();
        for d in 0..=max_order {
            for id in (1usize << d)..(1usize << (d + 1)) {
                depth_map[id] = d as u8;
            }
        }
        let memory_map = depth_map.clone();
        let page_count = 1usize << max_order;
        let subpages = std::iter::repeat_with(|| None)
            .take(page_count)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            region,
            memory_map,
            depth_map,
            subpages,
            page_size,
            max_order,
            chunk_size,
            unusable: (max_order + 1) as u8,
            free_bytes: chunk_size,
            tier: Tier::QInit,
            prev: None,
            next: None,
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// 使用率百分比。有任何占用时至少报告 1%，满载报告 100%。
    pub(crate) fn usage(&self) -> u32 {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_percentage = (self.free_bytes * 100 / self.chunk_size) as u32;
        if free_percentage == 0 {
            // 占用不足 1% 粒度时仍须与“全新”区分开。
            return 99;
        }
        100 - free_percentage
    }

    /// 在目标深度 `d` 取一个完全空闲的节点。
    ///
    /// # 逻辑解析（How）
    /// 1. 根的 `memory_map` 超过 `d` 说明不存在这么大的空闲区间，直接失败；
    /// 2. 自根下降：优先走左子，左子容不下（值大于 `d`）才走右子——
    ///    不变式保证此时右子必然容得下。左倾让占用聚向低地址，
    ///    右侧保留大区间；
    /// 3. 到达深度 `d` 后把节点标记为耗尽并回溯维护父链。
    pub(crate) fn allocate_run(&mut self, d: u32) -> Option<u32> {
        debug_assert!(d <= self.max_order);
        let target = d as u8;
        if self.memory_map[1] > target {
            return None;
        }
        let mut id: usize = 1;
        while self.depth_map[id] < target {
            id <<= 1;
            if self.memory_map[id] > target {
                id ^= 1;
            }
        }
        debug_assert_eq!(
            self.memory_map[id], target,
            "下降终点必须是完全空闲节点"
        );
        self.memory_map[id] = self.unusable;
        self.update_parents_alloc(id);
        self.free_bytes -= self.chunk_size >> d;
        Some(id as u32)
    }

    /// 归还一个运行区间。释放不允许失败；重复释放在 debug 构建断言。
    pub(crate) fn free_run(&mut self, mem_map_idx: u32) {
        let id = mem_map_idx as usize;
        debug_assert_eq!(
            self.memory_map[id], self.unusable,
            "释放未处于分配状态的节点 {id}"
        );
        let depth = self.depth_map[id];
        self.memory_map[id] = depth;
        self.update_parents_free(id);
        self.free_bytes += self.chunk_size >> depth;
    }

    fn update_parents_alloc(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            self.memory_map[parent] = self.memory_map[id].min(self.memory_map[id ^ 1]);
            id = parent;
        }
    }

    fn update_parents_free(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            let child_depth = self.depth_map[id];
            let left = self.memory_map[id];
            let right = self.memory_map[id ^ 1];
            self.memory_map[parent] = if left == child_depth && right == child_depth {
                // 伙伴双双完全空闲：父节点重新构成一个完整区间。
                child_depth - 1
            } else {
                left.min(right)
            };
            id = parent;
        }
    }

    /// 节点代表的区间字节数。
    pub(crate) fn run_size(&self, mem_map_idx: u32) -> usize {
        self.chunk_size >> self.depth_map[mem_map_idx as usize]
    }

    /// 节点代表的区间在块内的字节偏移。
    pub(crate) fn run_offset(&self, mem_map_idx: u32) -> usize {
        let id = mem_map_idx as usize;
        let depth = self.depth_map[id];
        (id ^ (1usize << depth)) * (self.chunk_size >> depth)
    }

    /// 叶子节点编号 → 页号。
    pub(crate) fn page_idx(&self, leaf_id: u32) -> u32 {
        debug_assert_eq!(self.depth_map[leaf_id as usize] as u32, self.max_order);
        leaf_id ^ (1u32 << self.max_order)
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn subpage_mut(&mut self, page_idx: u32) -> Option<&mut PoolSubpage> {
        self.subpages[page_idx as usize].as_mut()
    }

    pub(crate) fn install_subpage(&mut self, page_idx: u32, subpage: PoolSubpage) {
        debug_assert!(self.subpages[page_idx as usize].is_none());
        self.subpages[page_idx as usize] = Some(subpage);
    }

    pub(crate) fn remove_subpage(&mut self, page_idx: u32) -> Option<PoolSubpage> {
        self.subpages[page_idx as usize].take()
    }

    /// 一致性校验入口：导出 `memory_map` 视图供属性测试重建期望值。
    #[cfg(test)]
    pub(crate) fn memory_map_snapshot(&self) -> Vec<u8> {
        self.memory_map.to_vec()
    }

    #[cfg(test)]
    pub(crate) fn depth_map_snapshot(&self) -> Vec<u8> {
        self.depth_map.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{HeapRegionProvider, RegionProvider};

    const PAGE: usize = 4096;
    const ORDER: u32 = 3; // 8 页、32 KiB 的迷你块

    fn mini_chunk() -> PoolChunk {
        let region = HeapRegionProvider
            .allocate(PAGE << ORDER)
            .expect("测试块必须可分配");
        PoolChunk::new(region, PAGE, ORDER)
    }

    #[test]
    fn whole_chunk_run_exhausts_free_bytes() {
        let mut chunk = mini_chunk();
        let id = chunk.allocate_run(0).expect("深度 0 的整块运行");
        assert_eq!(id, 1, "整块运行就是根节点");
        assert_eq!(chunk.free_bytes(), 0);
        assert_eq!(chunk.usage(), 100);
        assert!(chunk.allocate_run(ORDER).is_none(), "满块不能再分配");
    }

    #[test]
    fn single_pages_fill_left_to_right() {
        let mut chunk = mini_chunk();
        for expected_page in 0..(1u32 << ORDER) {
            let id = chunk.allocate_run(ORDER).expect("页级运行");
            assert_eq!(chunk.page_idx(id), expected_page, "左倾下降应按页序填充");
            assert_eq!(chunk.run_offset(id), expected_page as usize * PAGE);
            assert_eq!(chunk.run_size(id), PAGE);
        }
        assert_eq!(chunk.free_bytes(), 0);
    }

    #[test]
    fn allocate_then_free_restores_tree_bytewise() {
        let mut chunk = mini_chunk();
        let before = chunk.memory_map_snapshot();
        let free_before = chunk.free_bytes();

        let a = chunk.allocate_run(ORDER).expect("页 1");
        let b = chunk.allocate_run(ORDER - 1).expect("双页运行");
        chunk.free_run(b);
        chunk.free_run(a);

        assert_eq!(chunk.memory_map_snapshot(), before, "树必须逐字节复原");
        assert_eq!(chunk.free_bytes(), free_before);
    }

    #[test]
    fn freed_buddies_reform_larger_runs() {
        let mut chunk = mini_chunk();
        // 吃满整块再释放两个相邻的伙伴页。
        let pages: Vec<u32> = (0..(1u32 << ORDER))
            .map(|_| chunk.allocate_run(ORDER).expect("页级运行"))
            .collect();
        chunk.free_run(pages[0]);
        chunk.free_run(pages[1]);
        let merged = chunk
            .allocate_run(ORDER - 1)
            .expect("伙伴合并后必须能取双页运行");
        assert_eq!(chunk.run_offset(merged), 0);
        assert_eq!(chunk.run_size(merged), 2 * PAGE);
    }

    #[test]
    fn refuses_runs_larger_than_remaining_space() {
        let mut chunk = mini_chunk();
        let _half = chunk.allocate_run(1).expect("半块运行");
        assert!(chunk.allocate_run(0).is_none(), "剩余半块容不下整块请求");
        let _quarter = chunk.allocate_run(2).expect("四分之一块");
        assert_eq!(chunk.free_bytes(), PAGE << (ORDER - 2));
    }

    #[test]
    fn byte_conservation_over_interleaved_ops() {
        let mut chunk = mini_chunk();
        let mut live: Vec<(u32, usize)> = Vec::new();
        let plan = [3u32, 3, 2, 3, 1];
        for d in plan {
            if let Some(id) = chunk.allocate_run(d) {
                live.push((id, chunk.run_size(id)));
            }
        }
        let live_total: usize = live.iter().map(|(_, s)| s).sum();
        assert_eq!(
            chunk.free_bytes() + live_total,
            chunk.chunk_size(),
            "空闲字节与存活分配之和必须等于块大小"
        );
        for (id, _) in live {
            chunk.free_run(id);
        }
        assert_eq!(chunk.free_bytes(), chunk.chunk_size());
    }

    #[test]
    fn handle_encoding_round_trips() {
        let run = encode_run_handle(42);
        assert!(!is_subpage_handle(run));
        assert_eq!(handle_mem_map_idx(run), 42);

        let sp = encode_subpage_handle(2048, 0);
        assert!(is_subpage_handle(sp));
        assert_eq!(handle_mem_map_idx(sp), 2048);
        assert_eq!(handle_bitmap_idx(sp), 0, "戳位不得泄漏进位图下标");

        let sp2 = encode_subpage_handle(2049, 131);
        assert_eq!(handle_bitmap_idx(sp2), 131);
        assert_ne!(sp, encode_run_handle(2048), "子页句柄必须与运行句柄可区分");
    }

    /// 树一致性的精确刻画：
    /// - 伙伴双双完全空闲（值等于子深度）时父节点回落到自身深度；
    /// - 其余情况父节点取两子较小值（耗尽哨兵随 min 自然传播）。
    fn assert_tree_consistent(chunk: &PoolChunk) {
        let mm = chunk.memory_map_snapshot();
        let dm = chunk.depth_map_snapshot();
        for parent in 1..(mm.len() / 2) {
            let (l, r) = (mm[parent * 2], mm[parent * 2 + 1]);
            let child_depth = dm[parent * 2];
            let expected = if l == child_depth && r == child_depth {
                child_depth - 1
            } else {
                l.min(r)
            };
            assert_eq!(
                mm[parent], expected,
                "节点 {parent} 与其子状态不一致 (l={l}, r={r})"
            );
            assert!(mm[parent] >= dm[parent], "memory_map 不得低于原始深度");
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Alloc(u32),
            Free(usize),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0..=ORDER).prop_map(Op::Alloc),
                any::<usize>().prop_map(Op::Free),
            ]
        }

        proptest! {
            /// 任意分配/释放序列后：树局部一致、字节守恒、区间互不重叠。
            #[test]
            fn tree_invariants_survive_random_sequences(
                ops in proptest::collection::vec(op_strategy(), 1..64)
            ) {
                let mut chunk = mini_chunk();
                let mut live: Vec<u32> = Vec::new();

                for op in ops {
                    match op {
                        Op::Alloc(d) => {
                            if let Some(id) = chunk.allocate_run(d) {
                                live.push(id);
                            }
                        }
                        Op::Free(sel) => {
                            if !live.is_empty() {
                                let id = live.swap_remove(sel % live.len());
                                chunk.free_run(id);
                            }
                        }
                    }

                    assert_tree_consistent(&chunk);

                    let live_total: usize = live.iter().map(|&id| chunk.run_size(id)).sum();
                    prop_assert_eq!(
                        chunk.free_bytes() + live_total,
                        chunk.chunk_size(),
                        "字节守恒被破坏"
                    );

                    let mut ranges: Vec<(usize, usize)> = live
                        .iter()
                        .map(|&id| (chunk.run_offset(id), chunk.run_offset(id) + chunk.run_size(id)))
                        .collect();
                    ranges.sort_unstable();
                    for pair in ranges.windows(2) {
                        prop_assert!(
                            pair[0].1 <= pair[1].0,
                            "存活区间出现重叠: {:?}",
                            pair
                        );
                    }
                }

                for id in live.drain(..) {
                    chunk.free_run(id);
                }
                assert_tree_consistent(&chunk);
                prop_assert_eq!(chunk.free_bytes(), chunk.chunk_size(), "终态必须完全空闲");
            }
        }
    }

    #[test]
    fn usage_reports_at_least_one_percent_when_touched() {
        let mut chunk = mini_chunk();
        let id = chunk.allocate_run(ORDER).expect("单页");
        // 1 页 / 8 页 = 12.5%，向下取整后空闲 87%，使用率 13%。
        assert_eq!(chunk.usage(), 13);
        chunk.free_run(id);
        assert_eq!(chunk.usage(), 0);
    }
}
