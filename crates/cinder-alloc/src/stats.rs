use std::borrow::Cow;

/// 池统计快照，供运维观测与自适应调度使用。
///
/// # 契约说明（What）
/// - 所有字段为调用瞬间的一致快照（逐 Arena 持锁收集后聚合）；
/// - `allocated_bytes` 只统计池持有的块，huge 分配不计入——它们的
///   生命周期由调用方直接决定，池不是它们的常驻地；
/// - `custom_dimensions` 键使用稳定的蛇形命名，新增维度不破坏旧键。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 池当前向系统持有的后备字节总量（块数 × 块大小）。
    pub allocated_bytes: usize,
    /// 伙伴树中立即可供分配的字节总量。
    pub available_bytes: usize,
    /// 存活缓冲数量（含 huge）。
    pub active_leases: usize,
    /// 存活块数量。
    pub chunk_count: usize,
    /// 注册表中的线程缓存数量。
    pub registered_thread_caches: usize,
    /// 实现维度扩展：档位分布、子页池规模、巡检任务状态等。
    pub custom_dimensions: Vec<PoolStatDimension>,
}

impl PoolStats {
    /// 按键查找扩展维度。
    pub fn dimension(&self, key: &str) -> Option<usize> {
        self.custom_dimensions
            .iter()
            .find(|d| d.key == key)
            .map(|d| d.value)
    }
}

/// 扩展指标维度。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStatDimension {
    pub key: Cow<'static, str>,
    pub value: usize,
}

impl PoolStatDimension {
    pub(crate) fn new(key: &'static str, value: usize) -> Self {
        Self {
            key: Cow::Borrowed(key),
            value,
        }
    }
}
