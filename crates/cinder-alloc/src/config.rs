use std::thread;
use std::time::Duration;

use crate::error::{codes, PoolError};
use crate::size_class::SizeClasses;

/// 页大小下界（字节）。
pub const MIN_PAGE_SIZE: usize = 4096;

/// 单块容量上界：`2^30` 字节。更大的块会让伙伴树句柄越出 32 位编码空间。
pub const MAX_CHUNK_SIZE: usize = 1 << 30;

/// 伙伴树深度上界。
pub const MAX_ORDER_LIMIT: u32 = 14;

/// `PoolConfig` 汇集分配器的全部可调参数。
///
/// # 设计背景（Why）
/// - 三层引擎的行为几乎完全由几何参数决定：页大小与树深定下块布局，
///   缓存深度与修剪间隔定下线程缓存的驻留曲线。把它们集中在一个
///   Builder 风格的结构里，调用方可以只改动关心的少数旋钮。
/// - 默认值沿用久经考验的生产配置：8 KiB 页、11 层树（16 MiB 块）、
///   512/256/64 的三级缓存深度、32 KiB 缓存容量上限、8192 次分配触发
///   修剪、5 秒死线程巡检周期。
///
/// # 契约说明（What）
/// - **前置条件**：构造后必须经 [`PoolConfig::resolve`] 校验；非法组合
///   （页大小非 2 的幂或小于 4096、树深超过 14、块大小溢出 2^30）
///   在该步骤以 [`codes::BAD_CONFIG`] 失败，绝不静默降级。
/// - **后置条件**：校验产出的 [`ResolvedConfig`] 在分配器生命周期内不变。
///
/// # 设计取舍（Trade-offs）
/// - Arena 数量默认取 CPU 并行度；进程没有可查询的堆上限，
///   内存峰值的约束交由显式的 Arena 数与块几何参数控制。
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// `buffer()` 在两类池都可用时优先选择直接内存。
    pub prefer_direct: bool,
    /// 堆 Arena 数量；`None` 取 CPU 并行度，`Some(0)` 禁用池化堆内存。
    pub num_heap_arenas: Option<usize>,
    /// 直接内存 Arena 数量；语义同上。
    pub num_direct_arenas: Option<usize>,
    /// 页大小（字节），必须是 `>= 4096` 的 2 的幂。
    pub page_size: usize,
    /// 伙伴树深度，`chunk_size = page_size << max_order`。
    pub max_order: u32,
    /// tiny 等级每线程缓存队列深度。
    pub tiny_cache_size: usize,
    /// small 等级每线程缓存队列深度。
    pub small_cache_size: usize,
    /// normal 等级每线程缓存队列深度。
    pub normal_cache_size: usize,
    /// 可进入线程缓存的最大缓冲容量（字节）。
    pub max_cached_buffer_capacity: usize,
    /// 两次缓存修剪之间允许的缓存命中次数。
    pub cache_trim_interval: u32,
    /// 死线程巡检周期。
    pub cache_cleanup_interval: Duration,
    /// 线程正常退出时是否立刻清空其缓存（关闭后完全依赖周期巡检）。
    pub thread_exit_eager_drain: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            prefer_direct: false,
            num_heap_arenas: None,
            num_direct_arenas: None,
            page_size: 8192,
            max_order: 11,
            tiny_cache_size: 512,
            small_cache_size: 256,
            normal_cache_size: 64,
            max_cached_buffer_capacity: 32 * 1024,
            cache_trim_interval: 8192,
            cache_cleanup_interval: Duration::from_millis(5000),
            thread_exit_eager_drain: true,
        }
    }
}

impl PoolConfig {
    /// 等价于 `Default::default()`，便于链式书写。
    pub fn new() -> Self {
        Self::default()
    }

    /// 设定堆 Arena 数量；0 表示禁用池化堆内存。
    pub fn with_num_heap_arenas(mut self, n: usize) -> Self {
        self.num_heap_arenas = Some(n);
        self
    }

    /// 设定直接内存 Arena 数量；0 表示禁用池化直接内存。
    pub fn with_num_direct_arenas(mut self, n: usize) -> Self {
        self.num_direct_arenas = Some(n);
        self
    }

    /// 设定页大小（字节）。
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// 设定伙伴树深度。
    pub fn with_max_order(mut self, max_order: u32) -> Self {
        self.max_order = max_order;
        self
    }

    /// 设定三级缓存队列深度。
    pub fn with_cache_sizes(mut self, tiny: usize, small: usize, normal: usize) -> Self {
        self.tiny_cache_size = tiny;
        self.small_cache_size = small;
        self.normal_cache_size = normal;
        self
    }

    /// 设定可被线程缓存的最大缓冲容量。
    pub fn with_max_cached_buffer_capacity(mut self, capacity: usize) -> Self {
        self.max_cached_buffer_capacity = capacity;
        self
    }

    /// 设定修剪间隔（缓存命中次数）。
    pub fn with_cache_trim_interval(mut self, interval: u32) -> Self {
        self.cache_trim_interval = interval;
        self
    }

    /// 设定死线程巡检周期。
    pub fn with_cache_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cache_cleanup_interval = interval;
        self
    }

    /// 设定 `buffer()` 的默认内存类别偏好。
    pub fn with_prefer_direct(mut self, prefer: bool) -> Self {
        self.prefer_direct = prefer;
        self
    }

    /// 线程退出时是否立即清空缓存。
    pub fn with_thread_exit_eager_drain(mut self, eager: bool) -> Self {
        self.thread_exit_eager_drain = eager;
        self
    }

    /// 校验全部参数并产出冻结视图。
    ///
    /// # 契约说明（What）
    /// - **返回值**：校验通过时为 [`ResolvedConfig`]；任何违例以
    ///   [`codes::BAD_CONFIG`] 报错并给出具体参数与期望。
    /// - **后置条件**：无任何部分初始化状态残留。
    pub fn resolve(&self) -> Result<ResolvedConfig, PoolError> {
        let page_shifts = validate_page_size(self.page_size)?;
        let chunk_size = validate_chunk_size(self.page_size, self.max_order)?;

        let default_arenas = thread::available_parallelism().map_or(1, usize::from);
        let num_heap_arenas = self.num_heap_arenas.unwrap_or(default_arenas);
        let num_direct_arenas = self.num_direct_arenas.unwrap_or(default_arenas);

        Ok(ResolvedConfig {
            prefer_direct: self.prefer_direct,
            num_heap_arenas,
            num_direct_arenas,
            size_classes: SizeClasses::new(self.page_size, page_shifts, chunk_size),
            max_order: self.max_order,
            tiny_cache_size: self.tiny_cache_size,
            small_cache_size: self.small_cache_size,
            normal_cache_size: self.normal_cache_size,
            max_cached_buffer_capacity: self.max_cached_buffer_capacity.min(chunk_size),
            cache_trim_interval: self.cache_trim_interval.max(1),
            cache_cleanup_interval: self.cache_cleanup_interval,
            thread_exit_eager_drain: self.thread_exit_eager_drain,
        })
    }
}

/// 校验通过后的只读配置视图。
#[derive(Clone, Debug)]
pub(crate) struct ResolvedConfig {
    pub prefer_direct: bool,
    pub num_heap_arenas: usize,
    pub num_direct_arenas: usize,
    pub size_classes: SizeClasses,
    pub max_order: u32,
    pub tiny_cache_size: usize,
    pub small_cache_size: usize,
    pub normal_cache_size: usize,
    pub max_cached_buffer_capacity: usize,
    pub cache_trim_interval: u32,
    pub cache_cleanup_interval: Duration,
    pub thread_exit_eager_drain: bool,
}

impl ResolvedConfig {
    pub(crate) fn chunk_size(&self) -> usize {
        self.size_classes.chunk_size
    }

    pub(crate) fn page_size(&self) -> usize {
        self.size_classes.page_size
    }
}

/// 页大小校验：`>= 4096` 且为 2 的幂，返回 `log2(page_size)`。
fn validate_page_size(page_size: usize) -> Result<u32, PoolError> {
    if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
        return Err(PoolError::new(
            codes::BAD_CONFIG,
            format!("pageSize: {page_size} (expected: power of two >= {MIN_PAGE_SIZE})"),
        ));
    }
    Ok(crate::size_class::log2(page_size))
}

/// 树深校验：`<= 14` 且 `page_size << max_order` 不越过 [`MAX_CHUNK_SIZE`]。
fn validate_chunk_size(page_size: usize, max_order: u32) -> Result<usize, PoolError> {
    if max_order > MAX_ORDER_LIMIT {
        return Err(PoolError::new(
            codes::BAD_CONFIG,
            format!("maxOrder: {max_order} (expected: 0-{MAX_ORDER_LIMIT})"),
        ));
    }
    let mut chunk_size = page_size;
    for _ in 0..max_order {
        if chunk_size > MAX_CHUNK_SIZE / 2 {
            return Err(PoolError::new(
                codes::BAD_CONFIG,
                format!(
                    "pageSize ({page_size}) << maxOrder ({max_order}) must not exceed {MAX_CHUNK_SIZE}"
                ),
            ));
        }
        chunk_size <<= 1;
    }
    Ok(chunk_size)
}
