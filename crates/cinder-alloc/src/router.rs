//! 路由器：线程与 Arena 的绑定、缓存注册表与死线程巡检。
//!
//! # 设计背景（Why）
//! - Arena 分片只有在“线程稳定地使用同一个 Arena”时才能摊薄锁争用。
//!   路由器用一个单调递增的计数器在首次分配时把线程轮转指派到
//!   堆/直接内存各自的 Arena 上，绑定关系伴随线程终身。
//! - 线程缓存的生命周期必须被看护：缓存里的条目在块层面都是存活分配，
//!   线程悄然退出会让这些字节永远漂在队列里。注册表以弱引用探测
//!   线程存活（TLS 哨兵被析构即判死），一个周期任务定期清扫。
//!
//! # 逻辑解析（How）
//! - TLS 槽位按“分配器实例 id”区分，同一线程可同时服务多个分配器；
//! - 巡检任务一次只存在一个：注册表空了它就自行退场，下一次缓存
//!   注册时重新拉起；关闭路径通过条件变量立刻唤醒它。
//! - 线程正常退出时，TLS 析构可以就地清空该线程的缓存
//!   （`thread_exit_eager_drain`，默认开启）；关闭该开关后，死线程的
//!   缓存只能由周期巡检发现并回收。

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::arena::PoolArena;
use crate::cache::{CacheEntry, ThreadCache};
use crate::config::ResolvedConfig;
use crate::error::{codes, PoolError};

/// 分配器实例 id 发生器；TLS 槽位以它为键。
static ROUTER_IDS: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// 本线程持有的全部缓存槽位（通常只有一两个分配器实例）。
    static LOCAL_CACHES: RefCell<Vec<LocalEntry>> = const { RefCell::new(Vec::new()) };
}

/// 存活哨兵：注册表只持弱引用，强引用唯一地住在 TLS 里。
/// 线程退出 ⇔ 哨兵析构 ⇔ 弱引用升级失败。
struct ThreadSentinel;

/// TLS 槽位。析构即线程退出（或显式移除）时的清理钩子。
struct LocalEntry {
    router_id: u64,
    thread_id: ThreadId,
    cache: Arc<ThreadCache>,
    #[allow(dead_code)]
    sentinel: Arc<ThreadSentinel>,
    router: Weak<CacheRouter>,
    eager_drain: bool,
}

impl Drop for LocalEntry {
    fn drop(&mut self) {
        if !self.eager_drain {
            // 保留注册表条目，交给周期巡检发现。
            return;
        }
        if let Some(router) = self.router.upgrade() {
            router.deregister_and_drain(self.thread_id);
        } else {
            // 分配器已整体关闭；缓存可能仍押着条目，就地归还。
            self.cache.drain();
        }
    }
}

struct Registered {
    liveness: Weak<ThreadSentinel>,
    cache: Arc<ThreadCache>,
}

struct Registry {
    caches: HashMap<ThreadId, Registered>,
    task_running: bool,
}

/// 路由器本体。由分配器以 `Arc` 持有；缓冲对象间接经由它走释放路径。
pub(crate) struct CacheRouter {
    id: u64,
    cfg: ResolvedConfig,
    heap_arenas: Box<[Arc<PoolArena>]>,
    direct_arenas: Box<[Arc<PoolArena>]>,
    assign_counter: AtomicUsize,
    /// 存活缓冲数（含 huge），仅用于统计快照。
    active_leases: AtomicUsize,
    registry: Mutex<Registry>,
    task_wakeup: Condvar,
    shutdown: AtomicBool,
}

impl CacheRouter {
    pub(crate) fn new(
        heap_arenas: Vec<Arc<PoolArena>>,
        direct_arenas: Vec<Arc<PoolArena>>,
        cfg: ResolvedConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ROUTER_IDS.fetch_add(1, Ordering::Relaxed),
            cfg,
            heap_arenas: heap_arenas.into_boxed_slice(),
            direct_arenas: direct_arenas.into_boxed_slice(),
            assign_counter: AtomicUsize::new(0),
            active_leases: AtomicUsize::new(0),
            registry: Mutex::new(Registry {
                caches: HashMap::new(),
                task_running: false,
            }),
            task_wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// 取当前线程在本分配器上的缓存；首次调用完成轮转指派与注册。
    ///
    /// # 失败语义（What）
    /// - 注册需要保证巡检任务在位；系统拒绝创建巡检线程（进程线程数
    ///   触顶等资源耗尽）时，本次注册整体回退并以
    ///   [`codes::OUT_OF_MEMORY`] 上报——不留半注册状态，下一次分配
    ///   会重新尝试。
    pub(crate) fn local_cache(self: &Arc<Self>) -> Result<Arc<ThreadCache>, PoolError> {
        LOCAL_CACHES
            .try_with(|slot| {
                let mut entries = slot.borrow_mut();
                if let Some(entry) = entries.iter().find(|e| e.router_id == self.id) {
                    return Ok(Arc::clone(&entry.cache));
                }

                let idx = self.assign_counter.fetch_add(1, Ordering::Relaxed);
                let cache = Arc::new(ThreadCache::new(
                    pick_arena(&self.heap_arenas, idx),
                    pick_arena(&self.direct_arenas, idx),
                    &self.cfg,
                ));
                let sentinel = Arc::new(ThreadSentinel);
                let thread_id = thread::current().id();
                self.register(thread_id, Arc::downgrade(&sentinel), Arc::clone(&cache))?;
                entries.push(LocalEntry {
                    router_id: self.id,
                    thread_id,
                    cache: Arc::clone(&cache),
                    sentinel,
                    router: Arc::downgrade(self),
                    eager_drain: self.cfg.thread_exit_eager_drain,
                });
                Ok(cache)
            })
            .unwrap_or_else(|_| {
                // TLS 已进入析构序：给调用方一个未注册的独立缓存，
                // 条目最终由 ThreadCache::drop 兜底归还。
                Ok(Arc::new(ThreadCache::new(
                    pick_arena(&self.heap_arenas, 0),
                    pick_arena(&self.direct_arenas, 0),
                    &self.cfg,
                )))
            })
    }

    /// 缓冲释放入口：优先进当前线程缓存，进不去就直接还给起源 Arena。
    ///
    /// 本线程从未在这个分配器上分配过时不会凭空建缓存——缓存只在
    /// 分配路径上诞生，纯释放线程的条目直达 Arena。
    pub(crate) fn release(self: &Arc<Self>, entry: CacheEntry) {
        if self.shutdown.load(Ordering::Acquire) {
            entry.release();
            return;
        }
        let local = LOCAL_CACHES
            .try_with(|slot| {
                slot.borrow()
                    .iter()
                    .find(|e| e.router_id == self.id)
                    .map(|e| Arc::clone(&e.cache))
            })
            .ok()
            .flatten();
        match local {
            Some(cache) => {
                if let Err(rejected) = cache.try_add(entry) {
                    rejected.release();
                }
            }
            None => entry.release(),
        }
    }

    /// 把缓存挂入注册表；巡检任务不在位时先把它拉起。
    ///
    /// 先拉线程、后写注册表：拉起失败时注册表保持原样，错误沿分配
    /// 路径回传给调用方，而不是在分配线程里 panic。
    fn register(
        self: &Arc<Self>,
        thread_id: ThreadId,
        liveness: Weak<ThreadSentinel>,
        cache: Arc<ThreadCache>,
    ) -> Result<(), PoolError> {
        let mut registry = self.registry.lock();
        if !registry.task_running {
            let router = Arc::clone(self);
            thread::Builder::new()
                .name("cinder-cache-sweeper".into())
                .spawn(move || cleanup_loop(router))
                .map_err(|err| {
                    PoolError::new(
                        codes::OUT_OF_MEMORY,
                        "cache sweeper thread could not be spawned",
                    )
                    .with_cause(err)
                })?;
            registry.task_running = true;
            tracing::debug!(router = self.id, "cache sweeper armed");
        }
        registry.caches.insert(thread_id, Registered { liveness, cache });
        Ok(())
    }

    fn deregister_and_drain(&self, thread_id: ThreadId) {
        let cache = {
            let mut registry = self.registry.lock();
            registry.caches.remove(&thread_id).map(|r| r.cache)
        };
        if let Some(cache) = cache {
            let released = cache.drain();
            tracing::debug!(router = self.id, released, "thread cache drained on exit");
        }
    }

    /// 显式释放当前线程在本分配器上的缓存。
    pub(crate) fn remove_local_cache(&self) {
        let _ = LOCAL_CACHES.try_with(|slot| {
            let mut entries = slot.borrow_mut();
            if let Some(pos) = entries.iter().position(|e| e.router_id == self.id) {
                let mut entry = entries.remove(pos);
                // 显式移除无视配置，必须立即清空。
                entry.eager_drain = true;
            }
        });
    }

    pub(crate) fn lease_created(&self) {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lease_dropped(&self) {
        self.active_leases.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn active_leases(&self) -> usize {
        self.active_leases.load(Ordering::Relaxed)
    }

    /// 巡检任务当前是否在运行（统计与测试观测点）。
    pub(crate) fn sweeper_running(&self) -> bool {
        self.registry.lock().task_running
    }

    pub(crate) fn registered_caches(&self) -> usize {
        self.registry.lock().caches.len()
    }

    /// 关闭：先清空所有注册缓存，再撤销巡检任务。
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let drained: Vec<Arc<ThreadCache>> = {
            let mut registry = self.registry.lock();
            self.task_wakeup.notify_all();
            registry.caches.drain().map(|(_, r)| r.cache).collect()
        };
        for cache in drained {
            cache.drain();
        }
        tracing::debug!(router = self.id, "cache router shut down");
    }
}

fn pick_arena(arenas: &[Arc<PoolArena>], idx: usize) -> Option<Arc<PoolArena>> {
    if arenas.is_empty() {
        None
    } else {
        Some(Arc::clone(&arenas[idx % arenas.len()]))
    }
}

/// 周期巡检：清空死线程的缓存；注册表空了就自行退场。
fn cleanup_loop(router: Arc<CacheRouter>) {
    let interval = router.cfg.cache_cleanup_interval;
    let mut registry = router.registry.lock();
    loop {
        if router.shutdown.load(Ordering::Acquire) || registry.caches.is_empty() {
            break;
        }
        let _ = router.task_wakeup.wait_for(&mut registry, interval);
        if router.shutdown.load(Ordering::Acquire) {
            break;
        }
        let dead: Vec<ThreadId> = registry
            .caches
            .iter()
            .filter(|(_, r)| r.liveness.strong_count() == 0)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in dead {
            if let Some(r) = registry.caches.remove(&tid) {
                let released = r.cache.drain();
                tracing::debug!(
                    router = router.id,
                    thread = ?tid,
                    released,
                    "released cache bound to dead thread"
                );
            }
        }
    }
    registry.task_running = false;
    tracing::debug!(router = router.id, "cache sweeper disarmed");
}
