use std::borrow::Cow;
use std::error::Error;
use std::fmt;

/// 稳定错误码命名空间。
///
/// # 设计背景（Why）
/// - 分配器的失败模式极少（配置非法、后备内存耗尽、池被禁用），但调用方的
///   日志、指标与告警系统需要按稳定码值做自动化分类，不能依赖解析消息文本。
/// - 码值遵循 `<域>.<语义>` 约定，与运行时侧其它错误域可以合流到同一套治理
///   流水线。
///
/// # 契约说明（What）
/// - 所有码值均为 `'static` 字符串且永不变更；新增失败模式只追加新码。
pub mod codes {
    /// 构造期配置校验失败：页大小、树深或块大小不满足约束。
    pub const BAD_CONFIG: &str = "pool.bad_config";
    /// 系统资源耗尽：区域供应者拿不到新的后备内存，或巡检线程
    /// 无法创建。
    pub const OUT_OF_MEMORY: &str = "pool.out_of_memory";
    /// 请求的池化类别（堆或直接内存）没有配置任何 Arena。
    pub const ARENA_DISABLED: &str = "pool.arena_disabled";
}

/// `PoolError` 是分配器对外暴露的唯一错误类型。
///
/// # 设计背景（Why）
/// - 分配热路径绝不返回错误；错误只出现在构造与“新建块”两条冷路径上，
///   因此一个携带稳定码、可读消息与底层原因链的轻量结构已经足够。
/// - 释放路径被契约定义为不可失败：重复释放或伪造句柄属于编程错误，
///   在 debug 构建下以断言暴露，而不是以 `Result` 污染所有调用方。
///
/// # 逻辑解析（How）
/// - `code` 为 [`codes`] 中的稳定字符串；`message` 面向排障人员；
///   `cause` 以 `Box<dyn Error>` 保留底层原因（例如布局计算溢出）。
///
/// # 契约说明（What）
/// - **前置条件**：`code` 必须取自 [`codes`]，调用方不得自造码值。
/// - **后置条件**：实例可跨线程移动（`Send + Sync + 'static`），
///   `source()` 暴露完整根因链。
#[derive(Debug)]
pub struct PoolError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<Box<dyn Error + Send + Sync>>,
}

impl PoolError {
    /// 构造带稳定码的错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// 附带底层原因并返回新的错误实例。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取面向排障人员的描述。
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for PoolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}
