use std::{collections::VecDeque, fmt, sync::Arc};

use spark_core::{
    BufferAllocator, ByteBuf, ChannelPromise, CoreError, PipelineMessage, Result, error::codes,
};

use super::OutboundBuffer;
use crate::context::ChannelHandlerContext;

enum Item {
    Buffer(ByteBuf),
    Promise(ChannelPromise),
}

/// 把连续写入的字节缓冲合并成更大块的队列。
///
/// # 教案式说明
/// - **意图（Why）**：协议层（例如加密或分帧）常把许多小写入攒起来，按目标块大小取出后一次写出；
///   取出的块可能横跨多个原始写入，也可能只取走某个写入的前半段。
/// - **逻辑（How）**：
///   - 队列按顺序保存“缓冲、其 Promise、缓冲、其 Promise……”；
///   - [`remove`](Self::remove) 自队首取出最多 `max_bytes` 字节：整段取走的缓冲直接成为组成部分，
///     末尾不足一段时以 `read_retained_slice` 切出前半段、余下部分放回队首；
///     途经的 Promise 挂到聚合 Promise 上，聚合完成时以相同结果完成它们；
///   - 多个组成部分经分配器组合为一个缓冲，组合缓冲持有各部分的引用。
/// - **契约（What）**：
///   - 每个加入的缓冲恰好被消费一次引用：随取出的块在其释放时归还，或在
///     [`release_and_fail_all`](Self::release_and_fail_all) 中释放；
///   - 只属于单个执行器，不做内部同步；
///   - 可选地把可读字节同步计入某个 [`OutboundBuffer`] 的挂起字节，参与 Channel 可写性。
pub struct CoalescingBufferQueue {
    items: VecDeque<Item>,
    readable: usize,
    tracker: Option<Arc<OutboundBuffer>>,
}

impl CoalescingBufferQueue {
    /// 不参与可写性统计的队列。
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            readable: 0,
            tracker: None,
        }
    }

    /// 可读字节同步计入 `tracker` 挂起字节的队列。
    pub fn with_writability_tracking(tracker: Arc<OutboundBuffer>) -> Self {
        Self {
            tracker: Some(tracker),
            ..Self::new()
        }
    }

    /// 追加缓冲及其 Promise；void Promise 不入队。
    pub fn add(&mut self, buf: ByteBuf, promise: ChannelPromise) {
        let len = buf.readable_bytes();
        self.items.push_back(Item::Buffer(buf));
        if !promise.is_void() {
            self.items.push_back(Item::Promise(promise));
        }
        self.increment(len);
    }

    /// 在队首插回缓冲及其 Promise。
    pub fn add_first(&mut self, buf: ByteBuf, promise: ChannelPromise) {
        let len = buf.readable_bytes();
        if !promise.is_void() {
            self.items.push_front(Item::Promise(promise));
        }
        self.items.push_front(Item::Buffer(buf));
        self.increment(len);
    }

    /// 自队首取出最多 `max_bytes` 字节。
    ///
    /// 途经的原始 Promise 在 `aggregate` 完成时以相同结果完成。`aggregate` 不得为 void；
    /// 组合失败时 `aggregate` 以同一错误失败。队列为空时返回空缓冲。
    pub fn remove(
        &mut self,
        allocator: &dyn BufferAllocator,
        max_bytes: usize,
        aggregate: &ChannelPromise,
    ) -> Result<ByteBuf> {
        if aggregate.is_void() {
            return Err(CoreError::new(
                codes::FUTURE_VOID,
                "coalescing remove requires a non-void aggregate promise",
            ));
        }
        let mut budget = max_bytes.min(self.readable);
        let original = budget;
        let mut parts = Vec::new();
        let mut failure = None;
        while let Some(item) = self.items.pop_front() {
            match item {
                Item::Promise(promise) => aggregate.cascade_to(promise),
                Item::Buffer(mut buf) => {
                    let len = buf.readable_bytes();
                    if len > budget {
                        if budget > 0 {
                            match buf.read_retained_slice(budget) {
                                Ok(slice) => {
                                    parts.push(slice);
                                    budget = 0;
                                }
                                Err(err) => failure = Some(err),
                            }
                        }
                        self.items.push_front(Item::Buffer(buf));
                        break;
                    }
                    budget -= len;
                    parts.push(buf);
                }
            }
        }
        self.decrement(original - budget);
        if let Some(err) = failure {
            for part in parts {
                PipelineMessage::Buffer(part).release_quietly();
            }
            aggregate.try_failure(err.clone());
            return Err(err);
        }
        let result = match parts.len() {
            0 => Ok(allocator.empty()),
            1 => Ok(parts.pop().unwrap_or_else(|| allocator.empty())),
            _ => allocator.compose(parts),
        };
        if let Err(err) = &result {
            aggregate.try_failure(err.clone());
        }
        result
    }

    /// 取出队首的单个缓冲，其紧随的 Promise 挂到 `aggregate` 上。
    pub fn remove_first(&mut self, aggregate: &ChannelPromise) -> Option<ByteBuf> {
        let buf = loop {
            match self.items.pop_front()? {
                Item::Buffer(buf) => break buf,
                Item::Promise(promise) => aggregate.cascade_to(promise),
            }
        };
        if let Some(Item::Promise(_)) = self.items.front() {
            if let Some(Item::Promise(promise)) = self.items.pop_front() {
                aggregate.cascade_to(promise);
            }
        }
        self.decrement(buf.readable_bytes());
        Some(buf)
    }

    /// 释放全部缓冲并以 `cause` 失败全部 Promise，按入队顺序。
    pub fn release_and_fail_all(&mut self, cause: CoreError) {
        let pending = self.readable;
        while let Some(item) = self.items.pop_front() {
            match item {
                Item::Buffer(buf) => {
                    PipelineMessage::Buffer(buf).release_quietly();
                }
                Item::Promise(promise) => {
                    promise.try_failure(cause.clone());
                }
            }
        }
        self.decrement(pending);
    }

    /// 把全部缓冲按顺序写给 `ctx`，每个缓冲带着它自己的 Promise。
    pub fn write_and_remove_all(&mut self, ctx: &ChannelHandlerContext) {
        let pending = self.readable;
        self.decrement(pending);
        let mut previous: Option<ByteBuf> = None;
        while let Some(item) = self.items.pop_front() {
            match item {
                Item::Buffer(buf) => {
                    if let Some(prev) = previous.replace(buf) {
                        ctx.write(PipelineMessage::Buffer(prev), ChannelPromise::void());
                    }
                }
                Item::Promise(promise) => match previous.take() {
                    Some(prev) => {
                        ctx.write(PipelineMessage::Buffer(prev), promise);
                    }
                    None => {
                        promise.try_success();
                    }
                },
            }
        }
        if let Some(prev) = previous {
            ctx.write(PipelineMessage::Buffer(prev), ChannelPromise::void());
        }
    }

    /// 把本队列的内容复制到 `dest` 队尾：每个缓冲增加一次引用，Promise 共享。
    pub fn copy_to(&self, dest: &mut CoalescingBufferQueue) -> Result<()> {
        let mut copied = VecDeque::with_capacity(self.items.len());
        for item in &self.items {
            match item {
                Item::Buffer(buf) => match buf.retained_duplicate() {
                    Ok(dup) => copied.push_back(Item::Buffer(dup)),
                    Err(err) => {
                        for item in copied {
                            if let Item::Buffer(buf) = item {
                                PipelineMessage::Buffer(buf).release_quietly();
                            }
                        }
                        return Err(err);
                    }
                },
                Item::Promise(promise) => copied.push_back(Item::Promise(promise.clone())),
            }
        }
        dest.items.extend(copied);
        dest.increment(self.readable);
        Ok(())
    }

    /// 当前可读字节数。
    pub fn readable_bytes(&self) -> usize {
        self.readable
    }

    /// 是否为空。
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn increment(&mut self, len: usize) {
        self.readable += len;
        if let Some(tracker) = &self.tracker {
            tracker.increment_pending_outbound_bytes(len);
        }
    }

    fn decrement(&mut self, len: usize) {
        self.readable -= len;
        if let Some(tracker) = &self.tracker {
            tracker.decrement_pending_outbound_bytes(len);
        }
    }
}

impl Default for CoalescingBufferQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CoalescingBufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingBufferQueue")
            .field("items", &self.items.len())
            .field("readable", &self.readable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use spark_core::{ReferenceCounted, UnpooledAllocator};

    use super::*;

    #[test]
    fn splits_across_boundary_and_keeps_remainder() {
        let mut queue = CoalescingBufferQueue::new();
        let first = ChannelPromise::new();
        let second = ChannelPromise::new();
        queue.add(ByteBuf::copy_from_slice(b"abc"), first.clone());
        queue.add(ByteBuf::copy_from_slice(b"defg"), second.clone());

        let aggregate = ChannelPromise::new();
        let chunk = queue.remove(&UnpooledAllocator, 5, &aggregate).unwrap();
        assert_eq!(chunk.as_slice(), b"abcde");
        assert_eq!(queue.readable_bytes(), 2);

        aggregate.try_success();
        assert!(first.is_success(), "整段取走的写入随聚合完成");
        assert!(!second.is_done(), "只取走一半的写入不受本次聚合影响");

        let rest = ChannelPromise::new();
        let tail = queue.remove(&UnpooledAllocator, usize::MAX, &rest).unwrap();
        assert_eq!(tail.as_slice(), b"fg");
        rest.try_success();
        assert!(second.is_success());
        chunk.release().unwrap();
        tail.release().unwrap();
    }

    #[test]
    fn void_aggregate_is_rejected() {
        let mut queue = CoalescingBufferQueue::new();
        queue.add(ByteBuf::copy_from_slice(b"x"), ChannelPromise::new());
        let err = queue
            .remove(&UnpooledAllocator, 1, &ChannelPromise::void())
            .unwrap_err();
        assert_eq!(err.code(), codes::FUTURE_VOID);
        assert_eq!(queue.readable_bytes(), 1, "被拒绝的取出不改变队列");
    }

    #[test]
    fn release_and_fail_all_preserves_order() {
        let mut queue = CoalescingBufferQueue::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut observers = Vec::new();
        for index in 0..3 {
            let buf = ByteBuf::copy_from_slice(&[index]);
            observers.push(buf.duplicate());
            let promise = ChannelPromise::new();
            let order = Arc::clone(&order);
            promise.future().add_listener(move |_| order.lock().push(index));
            queue.add(buf, promise);
        }
        queue.release_and_fail_all(CoreError::channel_closed());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert!(observers.iter().all(|buf| buf.ref_count() == 0));
        assert!(queue.is_empty());
    }
}
