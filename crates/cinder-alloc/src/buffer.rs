//! 池化缓冲句柄：携带归还路径的字节窗口。
//!
//! # 设计背景（Why）
//! - 引擎对外只需要交出“一段可读写的字节 + 在析构时走对归还路径”。
//!   完整的缓冲对象族（视图拆分、引用计数、游标代数）属于上层运行时，
//!   这里刻意只给最小表面：切片访问加上 `bytes` 生态的 `Buf`/`BufMut`
//!   互操作。
//! - 归还逻辑内嵌在 `Drop`：池化分配先尝试回到当前线程的缓存，
//!   缓存拒收才落回起源 Arena；huge 分配从不缓存，析构即释放区域。

use std::ptr::NonNull;
use std::sync::Arc;

use bytes::buf::UninitSlice;
use bytes::{Buf, BufMut};

use crate::arena::{PoolArena, RawAlloc};
use crate::cache::CacheEntry;
use crate::region::{MemoryKind, Region};
use crate::router::CacheRouter;

/// 缓冲的后备形态。
enum Backing {
    /// 池内分配：持有起源 Arena 与路由器，析构时走缓存/Arena 归还。
    Pooled {
        router: Arc<CacheRouter>,
        arena: Arc<PoolArena>,
        chunk_id: u32,
        handle: u64,
        base: NonNull<u8>,
        offset: usize,
        cap: usize,
    },
    /// huge 分配：独立区域，绕过池，析构直接释放。
    Huge {
        router: Arc<CacheRouter>,
        region: Region,
    },
    /// 析构过程中的占位。
    Released,
}

/// `PooledBuf` 是分配器交给调用方的不透明缓冲。
///
/// # 契约说明（What）
/// - **容量固定**：`capacity()` 即归一化容量，不提供增长；
///   `max_capacity` 仅作为调用方声明的上限记录。
/// - **内容初始化**：后备区域诞生时零初始化，复用的区间保留上一任
///   租户的旧字节——与内核给出的内存一样，读到什么不作承诺，
///   但永远是已初始化内存。
/// - **析构即归还**：不需要显式 free；析构幂等且绝不失败。
///
/// # 并发安全（Trade-offs）
/// - 写访问都要求 `&mut self`，读方法只触摸不可变窗口，符合借用规则
///   即不存在数据竞争；因此这里对含裸指针的结构手工实现
///   `Send`/`Sync` 是安全的。
pub struct PooledBuf {
    backing: Backing,
    reader: usize,
    writer: usize,
    max_capacity: usize,
}

// 缓冲独占其字节区间（伙伴树保证区间互不重叠），跨线程移动或共享
// 引用都不会引入对同一字节的并发可变访问。
unsafe impl Send for PooledBuf {}
unsafe impl Sync for PooledBuf {}

impl PooledBuf {
    pub(crate) fn from_raw(
        router: Arc<CacheRouter>,
        arena: Arc<PoolArena>,
        raw: RawAlloc,
        max_capacity: usize,
    ) -> Self {
        Self {
            backing: Backing::Pooled {
                router,
                arena,
                chunk_id: raw.chunk_id,
                handle: raw.handle,
                base: raw.base,
                offset: raw.offset,
                cap: raw.cap,
            },
            reader: 0,
            writer: 0,
            max_capacity,
        }
    }

    pub(crate) fn from_region(router: Arc<CacheRouter>, region: Region, max_capacity: usize) -> Self {
        Self {
            backing: Backing::Huge { router, region },
            reader: 0,
            writer: 0,
            max_capacity,
        }
    }

    /// 实际可用容量（归一化后的字节数）。
    pub fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Pooled { cap, .. } => *cap,
            Backing::Huge { region, .. } => region.size(),
            Backing::Released => 0,
        }
    }

    /// 调用方声明的容量上限。
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// 是否由直接内存（页对齐区域）承载。
    pub fn is_direct(&self) -> bool {
        let kind = match &self.backing {
            Backing::Pooled { arena, .. } => arena.kind(),
            Backing::Huge { region, .. } => region.kind(),
            Backing::Released => return false,
        };
        kind == MemoryKind::Direct
    }

    /// 是否来自池（huge 分配绕过池）。
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Pooled { .. })
    }

    /// 已写入且尚未读走的窗口。
    pub fn as_slice(&self) -> &[u8] {
        let ptr = self.data_ptr();
        unsafe {
            std::slice::from_raw_parts(ptr.add(self.reader), self.writer - self.reader)
        }
    }

    /// 整个容量窗口的可变视图（绕开游标直接填充时使用）。
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let ptr = self.data_ptr();
        unsafe { std::slice::from_raw_parts_mut(ptr, self.capacity()) }
    }

    /// 重置读写游标；内容保持原样。
    pub fn clear(&mut self) {
        self.reader = 0;
        self.writer = 0;
    }

    fn data_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Pooled { base, offset, .. } => unsafe { base.as_ptr().add(*offset) },
            Backing::Huge { region, .. } => region.base().as_ptr(),
            Backing::Released => unreachable!("缓冲在析构后不可再访问"),
        }
    }
}

impl Buf for PooledBuf {
    fn remaining(&self) -> usize {
        self.writer - self.reader
    }

    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining(), "advance 越过已写窗口");
        self.reader += cnt;
    }
}

unsafe impl BufMut for PooledBuf {
    fn remaining_mut(&self) -> usize {
        self.capacity() - self.writer
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining_mut(), "advance_mut 越过容量上限");
        self.writer += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        let remaining = self.remaining_mut();
        let ptr = unsafe { self.data_ptr().add(self.writer) };
        unsafe { UninitSlice::from_raw_parts_mut(ptr, remaining) }
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.backing, Backing::Released) {
            Backing::Pooled {
                router,
                arena,
                chunk_id,
                handle,
                base,
                offset,
                cap,
            } => {
                router.release(CacheEntry {
                    arena,
                    chunk_id,
                    handle,
                    base,
                    offset,
                    cap,
                });
                router.lease_dropped();
            }
            Backing::Huge { router, region } => {
                drop(region);
                router.lease_dropped();
            }
            Backing::Released => {}
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("capacity", &self.capacity())
            .field("written", &self.writer)
            .field("direct", &self.is_direct())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
