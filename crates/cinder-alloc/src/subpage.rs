//! 子页：把一个页切成等宽槽位的位图 slab。
//!
//! # 设计背景（Why）
//! - tiny/small 请求远小于一个页；直接走伙伴树会把 16 字节的请求放大到
//!   8 KiB。子页把一个叶子页再细分为 `page_size / elem_size` 个槽位，
//!   用位图管理占用，使一个页能同时承载数百个小分配。
//! - 槽位宽度在子页初始化时固定；同一尺寸等级的部分占用子页由 Arena
//!   以侵入式双向链表串联，分配时从表头取第一个空槽。
//!
//! # 并发（What）
//! - 本类型自身无任何同步：位图、计数与链表指针都只在持有所属 Arena
//!   锁时访问。

/// Arena 子页池中的节点坐标：`(块 id, 页下标)`。
///
/// 链表指针不直接持有 `&mut PoolSubpage`——节点存活在块的槽位数组里，
/// 用索引对表达“指针”可以让所有权始终停留在 Arena → Chunk 一条边上。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SubpageRef {
    pub chunk_id: u32,
    pub page_idx: u32,
}

/// `free` 之后子页的占用状态迁移，驱动 Arena 的池链表维护。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SubpageFree {
    /// 之前满载，现在出现了空槽：应插入所属等级池的表头。
    WasFull,
    /// 仍有存活槽位：保持现状。
    StillInUse,
    /// 全部槽位空闲：若等级池中还有其它子页，可连同底层页一起回收。
    Empty,
}

/// 单页 slab。位图中 bit = 1 表示槽位空闲。
pub(crate) struct PoolSubpage {
    /// 所属叶子在伙伴树中的节点编号。
    mem_map_idx: u32,
    /// 页在块内的字节偏移。
    run_offset: usize,
    /// 槽位宽度（已归一化的 tiny/small 容量）。
    elem_size: usize,
    /// 槽位总数 = `page_size / elem_size`。
    max_num_elems: usize,
    /// 当前空闲槽位数，始终等于位图中置位比特数。
    num_avail: usize,
    bitmap: Box<[u64]>,
    /// 最近释放的槽位，作为下次分配的直达提示。
    next_avail: Option<u32>,
    /// 等级池链表指针，仅在 Arena 锁内读写。
    pub(crate) prev: Option<SubpageRef>,
    pub(crate) next: Option<SubpageRef>,
    pub(crate) in_pool: bool,
}

impl PoolSubpage {
    pub(crate) fn new(mem_map_idx: u32, run_offset: usize, page_size: usize, elem_size: usize) -> Self {
        debug_assert!(elem_size >= 16 && elem_size <= page_size / 2);
        // 槽位数向下取整：页尾不足一个槽位的零头保持闲置（tiny 等级
        // 多为 16 的倍数，不必整除页大小）。
        let max_num_elems = page_size / elem_size;
        let words = max_num_elems.div_ceil(64);
        let mut bitmap = vec![0u64; words].into_boxed_slice();
        for (word_idx, word) in bitmap.iter_mut().enumerate() {
            let bits_here = (max_num_elems - word_idx * 64).min(64);
            *word = if bits_here == 64 { u64::MAX } else { (1u64 << bits_here) - 1 };
        }
        Self {
            mem_map_idx,
            run_offset,
            elem_size,
            max_num_elems,
            num_avail: max_num_elems,
            bitmap,
            next_avail: None,
            prev: None,
            next: None,
            in_pool: false,
        }
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub(crate) fn mem_map_idx(&self) -> u32 {
        self.mem_map_idx
    }

    pub(crate) fn num_avail(&self) -> usize {
        self.num_avail
    }

    pub(crate) fn max_num_elems(&self) -> usize {
        self.max_num_elems
    }

    /// 槽位在块内的字节偏移。
    pub(crate) fn elem_offset(&self, bitmap_idx: u32) -> usize {
        self.run_offset + bitmap_idx as usize * self.elem_size
    }

    /// 占用一个空槽，返回其位图下标。
    ///
    /// 调用方在返回 `Some` 且 `num_avail() == 0` 时必须把本子页移出
    /// 等级池，维持“池中子页必有空槽”的不变式。
    pub(crate) fn allocate(&mut self) -> Option<u32> {
        if self.num_avail == 0 {
            return None;
        }
        let idx = match self.next_avail.take() {
            Some(hint) => hint,
            None => self.find_next_avail()?,
        };
        debug_assert!(self.is_free(idx), "提示槽位必须处于空闲状态");
        self.clear_bit(idx);
        self.num_avail -= 1;
        Some(idx)
    }

    /// 归还一个槽位并报告占用状态迁移。
    ///
    /// 释放不允许失败；debug 构建下对重复释放断言。
    pub(crate) fn free(&mut self, bitmap_idx: u32) -> SubpageFree {
        debug_assert!(
            !self.is_free(bitmap_idx),
            "重复释放子页槽位 {bitmap_idx}（页节点 {}）",
            self.mem_map_idx
        );
        self.set_bit(bitmap_idx);
        self.num_avail += 1;
        self.next_avail = Some(bitmap_idx);

        if self.num_avail == 1 {
            SubpageFree::WasFull
        } else if self.num_avail == self.max_num_elems {
            SubpageFree::Empty
        } else {
            SubpageFree::StillInUse
        }
    }

    fn find_next_avail(&self) -> Option<u32> {
        for (word_idx, &word) in self.bitmap.iter().enumerate() {
            if word != 0 {
                let bit = word.trailing_zeros();
                let idx = word_idx as u32 * 64 + bit;
                if (idx as usize) < self.max_num_elems {
                    return Some(idx);
                }
            }
        }
        None
    }

    fn is_free(&self, idx: u32) -> bool {
        self.bitmap[idx as usize / 64] & (1u64 << (idx % 64)) != 0
    }

    fn clear_bit(&mut self, idx: u32) {
        self.bitmap[idx as usize / 64] &= !(1u64 << (idx % 64));
    }

    fn set_bit(&mut self, idx: u32) {
        self.bitmap[idx as usize / 64] |= 1u64 << (idx % 64);
    }

    /// 位图置位计数，供一致性校验使用。
    #[cfg(test)]
    fn popcount(&self) -> usize {
        self.bitmap.iter().map(|w| w.count_ones() as usize).sum()
    }
}
