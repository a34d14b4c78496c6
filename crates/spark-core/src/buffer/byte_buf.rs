use std::{
    fmt, mem,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{BufferRecycler, ReferenceCounted};
use crate::{CoreError, Result, error::codes};

/// 同一块分配在所有视图之间共享的元数据。
///
/// - `ref_cnt`：显式引用计数，初始为 1；
/// - `components`：组合缓冲持有的分量引用，归零时逐个释放；
/// - `recycler`：可选的池回收钩子。
struct Shared {
    ref_cnt: AtomicUsize,
    capacity: usize,
    components: Mutex<Vec<ByteBuf>>,
    recycler: Option<Arc<dyn BufferRecycler>>,
}

impl Shared {
    fn new(
        capacity: usize,
        components: Vec<ByteBuf>,
        recycler: Option<Arc<dyn BufferRecycler>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ref_cnt: AtomicUsize::new(1),
            capacity,
            components: Mutex::new(components),
            recycler,
        })
    }

    fn retain(&self) -> Result<()> {
        let mut current = self.ref_cnt.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(illegal_ref_count(current, 1));
            }
            match self.ref_cnt.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self) -> Result<bool> {
        let mut current = self.ref_cnt.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(illegal_ref_count(current, -1));
            }
            match self.ref_cnt.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if current == 1 => {
                    self.deallocate();
                    return Ok(true);
                }
                Ok(_) => return Ok(false),
                Err(observed) => current = observed,
            }
        }
    }

    fn deallocate(&self) {
        let components = mem::take(&mut *self.components.lock());
        for component in components {
            if let Err(err) = component.release() {
                tracing::warn!(error.code = err.code(), "组合缓冲释放分量失败: {err}");
            }
        }
        if let Some(recycler) = &self.recycler {
            recycler.reclaim(self.capacity);
        }
    }
}

fn illegal_ref_count(current: usize, delta: isize) -> CoreError {
    CoreError::new(
        codes::BUFFER_ILLEGAL_REFCOUNT,
        format!("refCnt: {current}, delta: {delta}"),
    )
}

/// 带显式引用计数的只读字节缓冲。
///
/// # 设计背景（Why）
/// - 出站缓冲、合并队列与 ChannelGroup 的扇出写都需要精确地“谁消费了一次引用”，
///   `Arc` 的隐式计数无法表达“逻辑上已释放但句柄仍在”的状态，因此另设原子计数。
///
/// # 逻辑解析（How）
/// - `content` 是当前可读窗口，读取类操作（[`skip_bytes`](Self::skip_bytes)、
///   [`read_retained_slice`](Self::read_retained_slice)）只移动本视图的窗口；
/// - [`duplicate`](Self::duplicate) 与切片共享 `shared`，即共享同一个引用计数；
/// - 计数归零时回收组合分量并通知 [`BufferRecycler`]。
///
/// # 契约说明（What）
/// - 类型刻意不实现 `Clone`：复制视图必须显式选择 `duplicate`（不加计数）或
///   `retained_duplicate`（加一次计数），避免无意间共享所有权；
/// - 对计数已归零的缓冲执行读取类操作返回 `buffer.illegal_refcount`。
pub struct ByteBuf {
    shared: Arc<Shared>,
    content: Bytes,
}

impl ByteBuf {
    /// 基于已有的 `Bytes` 构造计数为 1 的缓冲。
    pub fn from_bytes(content: Bytes) -> Self {
        let capacity = content.len();
        Self {
            shared: Shared::new(capacity, Vec::new(), None),
            content,
        }
    }

    /// 复制切片内容构造缓冲。
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }

    /// 基于静态数据构造缓冲，不发生拷贝。
    pub fn from_static(data: &'static [u8]) -> Self {
        Self::from_bytes(Bytes::from_static(data))
    }

    /// 空缓冲。
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// 构造计数归零时回调 `recycler` 的缓冲。
    pub fn with_recycler(content: Bytes, recycler: Arc<dyn BufferRecycler>) -> Self {
        let capacity = content.len();
        Self {
            shared: Shared::new(capacity, Vec::new(), Some(recycler)),
            content,
        }
    }

    /// 将多个缓冲组合为一个缓冲。
    ///
    /// # 契约说明（What）
    /// - **所有权**：消费 `components` 中每个缓冲的一次引用；组合缓冲在自身计数归零时逐个释放它们；
    /// - **内容**：按顺序拼接各分量的可读区域；
    /// - **失败**：若任一分量已被释放，返回 `buffer.illegal_refcount`，并释放其余分量，
    ///   调用方不再拥有任何分量的引用。
    ///
    /// # 风险与权衡（Trade-offs）
    /// - 内容在组合时拷贝一次，换取读取侧单一连续切片；分量引用仍保留到组合缓冲释放，
    ///   使引用计数语义与零拷贝组合保持一致。
    pub fn compose(components: Vec<ByteBuf>) -> Result<ByteBuf> {
        if let Some(released) = components.iter().find(|c| c.ref_count() == 0) {
            let err = illegal_ref_count(released.ref_count(), 0);
            for component in components.iter().filter(|c| c.ref_count() > 0) {
                if let Err(err) = component.release() {
                    tracing::warn!(error.code = err.code(), "组合失败后释放分量失败: {err}");
                }
            }
            return Err(err);
        }
        let total = components.iter().map(ByteBuf::readable_bytes).sum();
        let mut merged = BytesMut::with_capacity(total);
        for component in &components {
            merged.extend_from_slice(&component.content);
        }
        Ok(Self {
            shared: Shared::new(total, components, None),
            content: merged.freeze(),
        })
    }

    /// 可读字节数。
    pub fn readable_bytes(&self) -> usize {
        self.content.len()
    }

    /// 是否仍有可读字节。
    pub fn is_readable(&self) -> bool {
        !self.content.is_empty()
    }

    /// 引用计数是否大于零。
    pub fn is_accessible(&self) -> bool {
        self.ref_count() > 0
    }

    /// 可读区域的切片视图。
    pub fn as_slice(&self) -> &[u8] {
        &self.content
    }

    /// 可读区域的 `Bytes` 视图，供传输层零拷贝写出。
    pub fn bytes(&self) -> &Bytes {
        &self.content
    }

    /// 将可读区域复制为 `Vec`。
    pub fn to_vec(&self) -> Vec<u8> {
        self.content.to_vec()
    }

    /// 跳过 `len` 个可读字节。
    pub fn skip_bytes(&mut self, len: usize) -> Result<()> {
        self.ensure_accessible()?;
        self.ensure_readable(len)?;
        let _ = self.content.split_to(len);
        Ok(())
    }

    /// 共享计数的视图，不增加引用。
    pub fn duplicate(&self) -> ByteBuf {
        Self {
            shared: Arc::clone(&self.shared),
            content: self.content.clone(),
        }
    }

    /// 共享计数的视图，并增加一次引用。
    pub fn retained_duplicate(&self) -> Result<ByteBuf> {
        self.retain()?;
        Ok(self.duplicate())
    }

    /// 读取前 `len` 字节作为新视图并增加一次引用，本视图的窗口随之前移。
    pub fn read_retained_slice(&mut self, len: usize) -> Result<ByteBuf> {
        self.ensure_readable(len)?;
        self.retain()?;
        let slice = self.content.split_to(len);
        Ok(Self {
            shared: Arc::clone(&self.shared),
            content: slice,
        })
    }

    /// 是否由 [`compose`](Self::compose) 构造。
    pub fn is_composite(&self) -> bool {
        !self.shared.components.lock().is_empty()
    }

    /// 组合分量数量；计数归零后为 0。
    pub fn component_count(&self) -> usize {
        self.shared.components.lock().len()
    }

    /// 按顺序遍历组合分量。
    pub fn for_each_component(&self, mut visitor: impl FnMut(&ByteBuf)) {
        for component in self.shared.components.lock().iter() {
            visitor(component);
        }
    }

    /// 两个视图是否共享同一块分配（同一个引用计数）。
    pub fn same_allocation(&self, other: &ByteBuf) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn ensure_accessible(&self) -> Result<()> {
        let current = self.ref_count();
        if current == 0 {
            return Err(illegal_ref_count(current, 0));
        }
        Ok(())
    }

    fn ensure_readable(&self, len: usize) -> Result<()> {
        if len > self.content.len() {
            return Err(CoreError::new(
                codes::BUFFER_OUT_OF_BOUNDS,
                format!(
                    "requested {len} bytes, readable {}",
                    self.content.len()
                ),
            ));
        }
        Ok(())
    }
}

impl ReferenceCounted for ByteBuf {
    fn ref_count(&self) -> usize {
        self.shared.ref_cnt.load(Ordering::Acquire)
    }

    fn retain(&self) -> Result<()> {
        self.shared.retain()
    }

    fn release(&self) -> Result<bool> {
        self.shared.release()
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("readable", &self.content.len())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct CountingRecycler(AtomicUsize);

    impl BufferRecycler for CountingRecycler {
        fn reclaim(&self, capacity: usize) {
            self.0.fetch_add(capacity, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_to_zero_triggers_recycler_once() {
        let recycler = Arc::new(CountingRecycler(AtomicUsize::new(0)));
        let buf = ByteBuf::with_recycler(Bytes::from_static(b"abcd"), recycler.clone());
        let dup = buf.retained_duplicate().expect("计数为 1 时可以 retain");
        assert_eq!(buf.ref_count(), 2);
        assert!(!dup.release().expect("第一次释放"));
        assert!(buf.release().expect("第二次释放"));
        assert_eq!(recycler.0.load(Ordering::SeqCst), 4);
        let err = buf.release().expect_err("归零后再次释放必须失败");
        assert_eq!(err.code(), codes::BUFFER_ILLEGAL_REFCOUNT);
        assert_eq!(recycler.0.load(Ordering::SeqCst), 4, "回收钩子只触发一次");
    }

    #[test]
    fn read_retained_slice_moves_window_and_shares_count() {
        let mut buf = ByteBuf::copy_from_slice(b"hello world");
        let head = buf.read_retained_slice(5).expect("切片");
        assert_eq!(head.as_slice(), b"hello");
        assert_eq!(buf.as_slice(), b" world");
        assert!(head.same_allocation(&buf));
        assert_eq!(buf.ref_count(), 2);
        assert!(buf.read_retained_slice(64).is_err());
    }

    #[test]
    fn composite_releases_components_on_deallocate() {
        let parts: Vec<_> = [b"a".as_slice(), b"bc", b"def"]
            .into_iter()
            .map(ByteBuf::copy_from_slice)
            .collect();
        let probes: Vec<_> = parts.iter().map(ByteBuf::duplicate).collect();
        let composite = ByteBuf::compose(parts).expect("组合");
        assert_eq!(composite.as_slice(), b"abcdef");
        assert_eq!(composite.component_count(), 3);
        assert!(composite.release().expect("释放组合缓冲"));
        assert!(probes.iter().all(|p| p.ref_count() == 0));
    }

    #[traced_test]
    #[test]
    fn failed_compose_releases_live_components_quietly() {
        let first = ByteBuf::copy_from_slice(b"first");
        let second = ByteBuf::copy_from_slice(b"second");
        let observers = [first.duplicate(), second.duplicate()];
        let dead = ByteBuf::copy_from_slice(b"dead");
        dead.release().expect("先释放一个分量");

        let err = ByteBuf::compose(vec![first, dead, second]).expect_err("包含已释放分量时必须失败");
        assert_eq!(err.code(), codes::BUFFER_ILLEGAL_REFCOUNT);
        assert!(observers.iter().all(|p| p.ref_count() == 0), "存活分量全部释放");
        assert!(!logs_contain("组合失败后释放分量失败"), "存活分量的释放不会报错");
    }
}
