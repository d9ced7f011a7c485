#![doc = "cinder-alloc：面向高吞吐网络运行时的池化字节缓冲分配器。"]
#![doc = ""]
#![doc = "== 引擎分层 =="]
#![doc = "1. **Chunk**：单个大后备区域（默认 16 MiB）由完全二叉伙伴树切分成页与运行；"]
#![doc = "2. **Arena**：一把锁管辖一组块与各尺寸等级的子页池，块按使用率在六个档位链表间迁移；"]
#![doc = "3. **ThreadCache**：线程本地的等级环形队列让热路径完全免锁，路由器轮转指派线程与 Arena 的绑定，并周期清扫死线程的缓存。"]
#![doc = ""]
#![doc = "== 使用约定 =="]
#![doc = "构造期参数非法会以稳定错误码立刻失败；分配热路径只在缓存未命中时短暂触碰 Arena 锁；释放路径永不失败，缓冲析构自动归还。"]

mod allocator;
mod arena;
mod buffer;
mod cache;
mod chunk;
mod config;
mod error;
mod region;
mod router;
mod size_class;
mod stats;
mod subpage;

pub use allocator::PooledAllocator;
pub use buffer::PooledBuf;
pub use config::{PoolConfig, MAX_CHUNK_SIZE, MAX_ORDER_LIMIT, MIN_PAGE_SIZE};
pub use error::{codes, PoolError};
pub use region::MemoryKind;
pub use stats::{PoolStatDimension, PoolStats};

/// 统一的结果别名。
pub type Result<T, E = PoolError> = core::result::Result<T, E>;
