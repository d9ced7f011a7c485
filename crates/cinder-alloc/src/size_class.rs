//! 尺寸等级表：把任意请求容量归一化到缓存友好的离散等级。
//!
//! # 设计背景（Why）
//! - 池化分配要求释放的内存能被后续请求精确复用；若按原始字节数管理，
//!   自由链表会碎成无法匹配的长尾。归一化把请求空间折叠为少量等级，
//!   每个等级对应 Arena 的一个子页池与线程缓存的一个环形队列。
//! - 等级边界沿用 jemalloc 系的划分：小于 512 字节按 16 字节步进（tiny），
//!   512 到页大小之间按 2 的幂（small），页的 2^k 倍为 normal，
//!   超过块大小的请求（huge）绕过池直接分配。
//!
//! # 契约说明（What）
//! - 归一化单调不减：`c1 <= c2` 蕴含 `normalize(c1) <= normalize(c2)`。
//! - 归一化不缩小：`normalize(c) >= c`（huge 原样返回）。

/// tiny 等级数量：`512 >> 4`，下标 0 不使用。
pub(crate) const TINY_CLASS_COUNT: usize = 32;

/// tiny 与 small 的分界（字节）。
pub(crate) const SMALL_THRESHOLD: usize = 512;

/// 请求容量归一化后所属的大类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SizeClass {
    /// `< 512`，16 字节步进。
    Tiny,
    /// `512 ..< page_size`，2 的幂。
    Small,
    /// `page_size ..= chunk_size`，`page_size << k`。
    Normal,
    /// `> chunk_size`，绕过池。
    Huge,
}

/// 由配置派生的等级几何参数，构造后不再变化，按值在各组件间传递。
#[derive(Clone, Copy, Debug)]
pub(crate) struct SizeClasses {
    pub page_size: usize,
    pub page_shifts: u32,
    pub chunk_size: usize,
}

impl SizeClasses {
    pub(crate) fn new(page_size: usize, page_shifts: u32, chunk_size: usize) -> Self {
        Self {
            page_size,
            page_shifts,
            chunk_size,
        }
    }

    /// small 等级数量：`[512, page_size)` 区间内 2 的幂个数。
    pub(crate) fn small_class_count(&self) -> usize {
        (self.page_shifts as usize) - 9
    }

    /// 判定归一化容量所属大类。
    pub(crate) fn classify(&self, norm_capacity: usize) -> SizeClass {
        if norm_capacity > self.chunk_size {
            SizeClass::Huge
        } else if norm_capacity >= self.page_size {
            SizeClass::Normal
        } else if norm_capacity >= SMALL_THRESHOLD {
            SizeClass::Small
        } else {
            SizeClass::Tiny
        }
    }

    /// 把请求容量上取整到其等级容量。
    ///
    /// # 逻辑解析（How）
    /// - huge 请求不归一化：它不进池，保持原始字节数可避免浪费。
    /// - `>= 512` 上取整到下一个 2 的幂；`< 512` 上取整到 16 的倍数，
    ///   零请求按最小等级 16 处理。
    pub(crate) fn normalize(&self, req_capacity: usize) -> usize {
        if req_capacity > self.chunk_size {
            return req_capacity;
        }
        if req_capacity >= SMALL_THRESHOLD {
            return req_capacity.next_power_of_two();
        }
        ((req_capacity + 15) & !15).max(16)
    }

    /// tiny 等级下标：`norm >> 4`，取值 `1..=31`。
    pub(crate) fn tiny_idx(&self, norm_capacity: usize) -> usize {
        norm_capacity >> 4
    }

    /// small 等级下标：`log2(norm) - 9`，512 对应 0。
    pub(crate) fn small_idx(&self, norm_capacity: usize) -> usize {
        (log2(norm_capacity) - 9) as usize
    }

    /// normal 缓存下标：`log2(norm) - page_shifts`，单页对应 0。
    pub(crate) fn normal_idx(&self, norm_capacity: usize) -> usize {
        (log2(norm_capacity) - self.page_shifts) as usize
    }
}

/// 以整数位运算求 `floor(log2(x))`；`x` 必须非零。
pub(crate) fn log2(x: usize) -> u32 {
    debug_assert!(x != 0);
    usize::BITS - 1 - x.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> SizeClasses {
        SizeClasses::new(8192, 13, 8192 << 11)
    }

    #[test]
    fn tiny_rounds_to_sixteen_multiples() {
        let sc = classes();
        assert_eq!(sc.normalize(1), 16);
        assert_eq!(sc.normalize(16), 16);
        assert_eq!(sc.normalize(17), 32);
        assert_eq!(sc.normalize(496), 496);
        assert_eq!(sc.normalize(511), 512);
    }

    #[test]
    fn small_and_normal_round_to_powers_of_two() {
        let sc = classes();
        assert_eq!(sc.normalize(512), 512);
        assert_eq!(sc.normalize(513), 1024);
        assert_eq!(sc.normalize(4097), 8192);
        assert_eq!(sc.normalize(9000), 16384);
    }

    #[test]
    fn huge_passes_through_unchanged() {
        let sc = classes();
        let huge = sc.chunk_size + 1;
        assert_eq!(sc.normalize(huge), huge);
        assert_eq!(sc.classify(huge), SizeClass::Huge);
    }

    #[test]
    fn classification_boundaries() {
        let sc = classes();
        assert_eq!(sc.classify(16), SizeClass::Tiny);
        assert_eq!(sc.classify(496), SizeClass::Tiny);
        assert_eq!(sc.classify(512), SizeClass::Small);
        assert_eq!(sc.classify(4096), SizeClass::Small);
        assert_eq!(sc.classify(8192), SizeClass::Normal);
        assert_eq!(sc.classify(sc.chunk_size), SizeClass::Normal);
    }

    #[test]
    fn class_indices_match_layout() {
        let sc = classes();
        assert_eq!(sc.tiny_idx(16), 1);
        assert_eq!(sc.tiny_idx(496), 31);
        assert_eq!(sc.small_idx(512), 0);
        assert_eq!(sc.small_idx(4096), 3);
        assert_eq!(sc.small_class_count(), 4);
        assert_eq!(sc.normal_idx(8192), 0);
        assert_eq!(sc.normal_idx(32768), 2);
    }

    #[test]
    fn normalize_is_monotone_across_boundaries() {
        let sc = classes();
        let mut last = 0;
        for c in 1..=(sc.page_size * 2) {
            let n = sc.normalize(c);
            assert!(n >= last, "归一化在 {c} 处出现回退");
            assert!(n >= c);
            last = n;
        }
    }
}
