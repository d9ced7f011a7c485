use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;

use crate::error::{codes, PoolError};

/// 后备内存的类别。
///
/// - `Heap`：普通堆内存，按 16 字节对齐，适合协议编解码等纯 CPU 访问。
/// - `Direct`：页对齐内存，适合交给内核做 I/O（direct I/O、`readv` 等
///   对齐敏感的路径）。两类内存走完全相同的池化引擎，仅对齐与 Arena
///   归属不同。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    Heap,
    Direct,
}

/// 堆区域的对齐：与通用分配器的最大基本对齐一致。
const HEAP_ALIGN: usize = 16;

/// `Region` 是一整块由池独占持有的原始内存。
///
/// # 设计背景（Why）
/// - 伙伴树只负责划分偏移区间，真正的字节存储必须有一个所有权清晰的
///   载体。`Region` 用 `NonNull<u8> + Layout` 直接持有分配结果，
///   `Drop` 时归还给系统分配器——“释放回块供应者”就是让它离开作用域。
///
/// # 契约说明（What）
/// - **前置条件**：只能由 [`RegionProvider`] 构造，内存已零初始化。
/// - **后置条件**：`base()` 在整个生命周期内稳定；持有者负责保证并发
///   访问互不重叠（由伙伴树的区间划分与 Arena 锁保证）。
pub(crate) struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
    kind: MemoryKind,
}

// Region 的字节只会经由伙伴树划分出的互不重叠区间被访问，跨线程移动
// 指针本身不构成数据竞争；访问竞争由上层的 Arena 锁与缓冲独占性排除。
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// 区域首地址；在 `Region` 存活期间保持不变。
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    /// 区域字节数。
    pub(crate) fn size(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn kind(&self) -> MemoryKind {
        self.kind
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // 布局与分配时完全一致，指针来自同一分配器。
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// `RegionProvider` 是引擎与原始内存来源之间的接缝。
///
/// # 设计背景（Why）
/// - 核心引擎不关心字节从哪里来：堆、页对齐内存乃至将来可能的
///   大页/注册内存都通过同一接口供应。Arena 在新建块与 huge 分配时
///   调用它，其余路径完全复用既有区域。
///
/// # 契约说明（What）
/// - **输入**：`size` 为所需字节数（块大小或 huge 请求的原始容量）。
/// - **返回值**：成功时为零初始化且满足本供应者对齐的 [`Region`]；
///   失败以 [`codes::OUT_OF_MEMORY`] 报告，不留部分状态。
pub(crate) trait RegionProvider: Send + Sync + 'static {
    fn kind(&self) -> MemoryKind;

    fn allocate(&self, size: usize) -> Result<Region, PoolError>;
}

/// 普通堆内存供应者。
pub(crate) struct HeapRegionProvider;

impl RegionProvider for HeapRegionProvider {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Heap
    }

    fn allocate(&self, size: usize) -> Result<Region, PoolError> {
        allocate_raw(size, HEAP_ALIGN, MemoryKind::Heap)
    }
}

/// 页对齐内存供应者；`align` 在构造时取配置的页大小。
pub(crate) struct DirectRegionProvider {
    align: usize,
}

impl DirectRegionProvider {
    pub(crate) fn new(align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        Self { align }
    }
}

impl RegionProvider for DirectRegionProvider {
    fn kind(&self) -> MemoryKind {
        MemoryKind::Direct
    }

    fn allocate(&self, size: usize) -> Result<Region, PoolError> {
        allocate_raw(size, self.align, MemoryKind::Direct)
    }
}

fn allocate_raw(size: usize, align: usize, kind: MemoryKind) -> Result<Region, PoolError> {
    let layout = Layout::from_size_align(size, align).map_err(|err| {
        PoolError::new(
            codes::OUT_OF_MEMORY,
            format!("region layout rejected: size={size} align={align}"),
        )
        .with_cause(err)
    })?;
    // 零初始化让上层能够安全地把任意已分配区间暴露为 &[u8]；
    // 复用区间里的旧数据同样是已初始化字节，不构成未定义行为。
    let raw = unsafe { alloc_zeroed(layout) };
    let ptr = NonNull::new(raw).ok_or_else(|| {
        PoolError::new(
            codes::OUT_OF_MEMORY,
            format!("region provider returned no memory for {size} bytes"),
        )
    })?;
    Ok(Region { ptr, layout, kind })
}
