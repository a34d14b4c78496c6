//! 出站缓冲：每个 Channel 一份的流控写队列。
//!
//! # 模块定位（Why）
//! - Pipeline 的写入先进入缓冲，`flush` 划定可发送边界，传输层的写循环再从队首取走条目；
//!   期间累计的挂起字节决定 Channel 的可写性，形成对上游的背压。
//!
//! # 结构概要（How）
//! - [`OutboundBuffer`]：条目队列 + 挂起字节计数 + 可写性位图；
//! - [`CoalescingBufferQueue`]：把连续的小缓冲合并为更大的块再交给下游。

mod coalescing;

pub use coalescing::CoalescingBufferQueue;

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::Mutex;
use spark_core::{
    ByteBuf, ChannelFuture, ChannelPromise, CoreError, PipelineMessage, Result, error::codes,
    future::combine,
};

use crate::config::{ChannelConfig, WriteBufferWaterMark};

/// 可写性翻转时的回调，参数为翻转后的可写性。
pub type WritabilityListener = Arc<dyn Fn(bool) + Send + Sync + 'static>;

const WATER_MARK_BIT: u32 = 1;

struct Entry {
    msg: PipelineMessage,
    pending_size: usize,
    promise: ChannelPromise,
    progress: u64,
    cancelled: bool,
}

#[derive(Default)]
struct Queue {
    entries: VecDeque<Entry>,
    flushed: usize,
    closed: bool,
}

impl Queue {
    fn pop_flushed(&mut self) -> Option<Entry> {
        if self.flushed == 0 {
            return None;
        }
        let entry = self.entries.pop_front()?;
        self.flushed -= 1;
        Some(entry)
    }

    fn pop_any(&mut self) -> Option<Entry> {
        let entry = self.entries.pop_front()?;
        self.flushed = self.flushed.saturating_sub(1);
        Some(entry)
    }
}

/// 出站写队列。
///
/// # 教案式说明
/// - **意图（Why）**：把“写入”与“真正发送”解耦，同时以高低水位线对挂起字节实施滞回式背压。
/// - **逻辑（How）**：
///   - 条目按写入顺序排队，`add_flush` 把所有未冲刷条目推进到可发送区；
///   - 每个条目计入 `大小 + 簿记开销` 字节；挂起字节**超过**高水位线时置不可写，
///     **低于**低水位线时恢复可写；
///   - 可写性由一个 `u32` 位图表达：第 0 位代表水位线，第 1..=31 位为用户自定义标志，
///     任一位被置起即不可写；位图以 CAS 更新，只有真正发生 0↔非 0 翻转的那次更新触发回调；
///   - 所有 Promise 回调、消息释放与可写性回调都在队列锁之外执行，条目在此之前已完全脱离队列。
/// - **契约（What）**：
///   - 每个条目的消息恰好释放一次：成功移除、失败移除或在冲刷时发现 Promise 已取消；
///   - 失败按入队顺序通知；
///   - 排空类操作每次都重新读取队首，回调中追加的条目会被同一轮排空看到。
/// - **风险与权衡（Trade-offs）**：`for_each_flushed_message` 在持锁状态下调用访问器，
///   访问器不得再操作同一个缓冲。
pub struct OutboundBuffer {
    queue: Mutex<Queue>,
    total_pending: AtomicUsize,
    unwritable: AtomicU32,
    water_mark: WriteBufferWaterMark,
    entry_overhead: usize,
    in_fail: AtomicBool,
    listener: Option<WritabilityListener>,
}

impl OutboundBuffer {
    /// 以给定水位线与条目开销构造。
    pub fn new(water_mark: WriteBufferWaterMark, entry_overhead: usize) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            total_pending: AtomicUsize::new(0),
            unwritable: AtomicU32::new(0),
            water_mark,
            entry_overhead,
            in_fail: AtomicBool::new(false),
            listener: None,
        }
    }

    /// 按 Channel 配置构造。
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.write_buffer_water_mark, config.outbound_entry_overhead)
    }

    /// 设置可写性翻转回调。
    pub fn with_listener(mut self, listener: WritabilityListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// 追加一条未冲刷的消息，转移一次引用。
    pub fn add_message(&self, msg: PipelineMessage, size: usize, promise: ChannelPromise) {
        let pending_size = size + self.entry_overhead;
        {
            let mut queue = self.queue.lock();
            if !queue.closed {
                queue.entries.push_back(Entry {
                    msg,
                    pending_size,
                    promise,
                    progress: 0,
                    cancelled: false,
                });
                drop(queue);
                self.increment_pending(pending_size, true);
                return;
            }
        }
        msg.release_quietly();
        promise.try_failure(CoreError::channel_closed());
    }

    /// 把全部未冲刷条目推进到可发送区；Promise 已取消的条目在此释放消息并不再计入挂起字节。
    pub fn add_flush(&self) {
        let mut cancelled_bytes = 0;
        {
            let mut queue = self.queue.lock();
            let start = queue.flushed;
            for entry in queue.entries.iter_mut().skip(start) {
                if !entry.cancelled && !entry.promise.set_uncancellable() {
                    entry.msg.release_quietly();
                    entry.msg = PipelineMessage::Buffer(ByteBuf::empty());
                    entry.cancelled = true;
                    cancelled_bytes += std::mem::take(&mut entry.pending_size);
                }
            }
            queue.flushed = queue.entries.len();
        }
        self.decrement_pending(cancelled_bytes, true);
    }

    /// 以可发送区队首的消息调用 `f`；可发送区为空时返回 `None`。
    pub fn current<R>(&self, f: impl FnOnce(&PipelineMessage) -> R) -> Option<R> {
        let queue = self.queue.lock();
        if queue.flushed == 0 {
            return None;
        }
        queue.entries.front().map(|entry| f(&entry.msg))
    }

    /// 队首条目可读字节数。
    pub fn current_size(&self) -> Option<usize> {
        self.current(|msg| msg.estimate_size(0))
    }

    /// 记录队首条目已写出 `amount` 字节。
    pub fn progress(&self, amount: u64) {
        let mut queue = self.queue.lock();
        if queue.flushed == 0 {
            return;
        }
        if let Some(entry) = queue.entries.front_mut() {
            entry.progress += amount;
        }
    }

    /// 队首条目累计已写出的字节数。
    pub fn current_progress(&self) -> Option<u64> {
        let queue = self.queue.lock();
        if queue.flushed == 0 {
            return None;
        }
        queue.entries.front().map(|entry| entry.progress)
    }

    /// 以成功移除可发送区队首条目；可发送区为空时返回 `false`。
    pub fn remove(&self) -> bool {
        let Some(entry) = self.queue.lock().pop_flushed() else {
            return false;
        };
        if !entry.cancelled {
            entry.msg.release_quietly();
            safe_success(&entry.promise);
            self.decrement_pending(entry.pending_size, true);
        }
        true
    }

    /// 以失败移除可发送区队首条目。
    pub fn remove_with_error(&self, cause: CoreError) -> bool {
        self.remove_with_error_inner(cause, true)
    }

    fn remove_with_error_inner(&self, cause: CoreError, notify: bool) -> bool {
        let Some(entry) = self.queue.lock().pop_flushed() else {
            return false;
        };
        self.fail_entry(entry, cause, notify);
        true
    }

    fn fail_entry(&self, entry: Entry, cause: CoreError, notify: bool) {
        if entry.cancelled {
            return;
        }
        entry.msg.release_quietly();
        safe_fail(&entry.promise, cause);
        self.decrement_pending(entry.pending_size, notify);
    }

    /// 传输层写出了 `written` 字节：完整写出的条目被移除，部分写出的缓冲前移读指针。
    pub fn remove_bytes(&self, mut written: usize) {
        loop {
            let step = {
                let mut queue = self.queue.lock();
                if queue.flushed == 0 {
                    return;
                }
                let Some(entry) = queue.entries.front_mut() else {
                    return;
                };
                let Some(readable) = entry.msg.as_buffer().map(ByteBuf::readable_bytes) else {
                    return;
                };
                if readable <= written {
                    entry.progress += readable as u64;
                    written -= readable;
                    true
                } else {
                    if written > 0 {
                        if let PipelineMessage::Buffer(buf) = &mut entry.msg {
                            if let Err(err) = buf.skip_bytes(written) {
                                tracing::warn!(error.code = err.code(), "前移写出位置失败");
                            }
                        }
                        entry.progress += written as u64;
                    }
                    false
                }
            };
            if !step {
                return;
            }
            self.remove();
        }
    }

    /// 可发送区开头连续的字节缓冲视图，遇到非缓冲消息即停止。
    ///
    /// 最多取 `max_count` 段，累计字节超过 `max_bytes` 时停止（至少返回一段）。
    pub fn flushed_buffers(&self, max_count: usize, max_bytes: usize) -> Vec<Bytes> {
        let queue = self.queue.lock();
        let mut out = Vec::new();
        let mut total = 0usize;
        for entry in queue.entries.iter().take(queue.flushed) {
            if entry.cancelled {
                continue;
            }
            let Some(buf) = entry.msg.as_buffer() else {
                break;
            };
            let readable = buf.readable_bytes();
            if readable == 0 {
                continue;
            }
            if !out.is_empty() && (out.len() >= max_count || total + readable > max_bytes) {
                break;
            }
            total += readable;
            out.push(buf.bytes().clone());
        }
        out
    }

    /// 依次访问可发送区中未取消的消息，访问器返回 `false` 时停止。
    pub fn for_each_flushed_message(&self, mut visitor: impl FnMut(&PipelineMessage) -> bool) {
        let queue = self.queue.lock();
        for entry in queue.entries.iter().take(queue.flushed) {
            if entry.cancelled {
                continue;
            }
            if !visitor(&entry.msg) {
                break;
            }
        }
    }

    /// 依入队顺序把可发送区的条目逐个交给 `sink`，返回全部转交条目的聚合 Future。
    ///
    /// `sink` 接收消息与原 Promise 的所有权，负责完成写出并完成 Promise。
    /// 每轮重新读取队首，因此 `sink` 或 Promise 回调中追加并冲刷的条目也会在本轮被排空。
    pub fn remove_and_write_all(
        &self,
        mut sink: impl FnMut(PipelineMessage, ChannelPromise),
    ) -> ChannelFuture {
        let mut futures = Vec::new();
        while let Some(future) = self.remove_and_write_inner(&mut sink) {
            if let Some(future) = future {
                futures.push(future);
            }
        }
        combine(futures)
    }

    /// 只转交一个条目；可发送区为空时返回 `None`。
    pub fn remove_and_write(
        &self,
        mut sink: impl FnMut(PipelineMessage, ChannelPromise),
    ) -> Option<ChannelFuture> {
        loop {
            match self.remove_and_write_inner(&mut sink)? {
                Some(future) => return Some(future),
                None => continue,
            }
        }
    }

    // 外层 None：可发送区已空；内层 None：条目已取消或 Promise 为 void。
    fn remove_and_write_inner(
        &self,
        sink: &mut impl FnMut(PipelineMessage, ChannelPromise),
    ) -> Option<Option<ChannelFuture>> {
        let entry = self.queue.lock().pop_flushed()?;
        if entry.cancelled {
            return Some(None);
        }
        self.decrement_pending(entry.pending_size, true);
        let future = (!entry.promise.is_void()).then(|| entry.promise.future());
        sink(entry.msg, entry.promise);
        Some(future)
    }

    /// 以 `cause` 按入队顺序失败并释放全部条目（含未冲刷的）。
    pub fn remove_and_fail_all(&self, cause: CoreError) {
        while self.remove_and_fail(cause.clone()) {}
    }

    /// 以 `cause` 失败并释放队首条目（不论是否已冲刷）；队列为空时返回 `false`。
    pub fn remove_and_fail(&self, cause: CoreError) -> bool {
        let Some(entry) = self.queue.lock().pop_any() else {
            return false;
        };
        self.fail_entry(entry, cause, true);
        true
    }

    /// 以 `cause` 失败可发送区的全部条目。
    ///
    /// 重入调用（例如某个 Promise 回调再次触发失败）被忽略，由外层循环继续排空。
    pub fn fail_flushed(&self, cause: CoreError, notify: bool) {
        if self.in_fail.swap(true, Ordering::AcqRel) {
            return;
        }
        while self.remove_with_error_inner(cause.clone(), notify) {}
        self.in_fail.store(false, Ordering::Release);
    }

    /// 关闭缓冲：此后追加的消息立即失败，现存条目以 `cause` 按顺序失败，且不再触发可写性回调。
    pub fn close(&self, cause: CoreError) {
        self.queue.lock().closed = true;
        loop {
            let Some(entry) = self.queue.lock().pop_any() else {
                break;
            };
            self.fail_entry(entry, cause.clone(), false);
        }
    }

    /// 设置第 `index`（1..=31）个用户自定义可写性标志。
    pub fn set_user_defined_writability(&self, index: u32, writable: bool) -> Result<()> {
        let mask = user_mask(index)?;
        if writable {
            self.clear_bits(mask, true);
        } else {
            self.set_bits(mask, true);
        }
        Ok(())
    }

    /// 第 `index` 个用户自定义标志是否为可写。
    pub fn user_defined_writability(&self, index: u32) -> Result<bool> {
        let mask = user_mask(index)?;
        Ok(self.unwritable.load(Ordering::Acquire) & mask == 0)
    }

    /// 水位线与全部用户标志是否都表示可写。
    pub fn is_writable(&self) -> bool {
        self.unwritable.load(Ordering::Acquire) == 0
    }

    /// 当前挂起字节数（含条目开销）。
    pub fn total_pending_write_bytes(&self) -> usize {
        self.total_pending.load(Ordering::Acquire)
    }

    /// 距离变为不可写还能写入的字节数；已不可写时为 0。
    pub fn bytes_before_unwritable(&self) -> usize {
        let total = self.total_pending_write_bytes();
        let high = self.water_mark.high();
        if total <= high && self.is_writable() {
            high - total + 1
        } else {
            0
        }
    }

    /// 距离恢复可写还需排空的字节数；已可写时为 0。
    pub fn bytes_before_writable(&self) -> usize {
        let total = self.total_pending_write_bytes();
        let low = self.water_mark.low();
        if total >= low && !self.is_writable() {
            total - low + 1
        } else {
            0
        }
    }

    /// 计入缓冲之外、即将到达的挂起字节（例如跨执行器投递中的写入）。
    pub fn increment_pending_outbound_bytes(&self, size: usize) {
        self.increment_pending(size, true);
    }

    /// 撤销 [`increment_pending_outbound_bytes`](Self::increment_pending_outbound_bytes) 计入的字节。
    pub fn decrement_pending_outbound_bytes(&self, size: usize) {
        self.decrement_pending(size, true);
    }

    /// 可发送区条目数。
    pub fn size(&self) -> usize {
        self.queue.lock().flushed
    }

    /// 可发送区是否为空。
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// 全部条目数（含未冲刷的）。
    pub fn pending_entries(&self) -> usize {
        self.queue.lock().entries.len()
    }

    fn increment_pending(&self, size: usize, notify: bool) {
        if size == 0 {
            return;
        }
        let total = self.total_pending.fetch_add(size, Ordering::AcqRel) + size;
        if total > self.water_mark.high() {
            self.set_bits(WATER_MARK_BIT, notify);
        }
    }

    fn decrement_pending(&self, size: usize, notify: bool) {
        if size == 0 {
            return;
        }
        let previous = self.total_pending.fetch_sub(size, Ordering::AcqRel);
        let total = previous.saturating_sub(size);
        if total < self.water_mark.low() {
            self.clear_bits(WATER_MARK_BIT, notify);
        }
    }

    fn set_bits(&self, mask: u32, notify: bool) {
        let previous = self.unwritable.fetch_or(mask, Ordering::AcqRel);
        if previous == 0 && notify {
            self.notify(false);
        }
    }

    fn clear_bits(&self, mask: u32, notify: bool) {
        let previous = self.unwritable.fetch_and(!mask, Ordering::AcqRel);
        if previous != 0 && previous & !mask == 0 && notify {
            self.notify(true);
        }
    }

    fn notify(&self, writable: bool) {
        tracing::trace!(writable, "出站缓冲可写性翻转");
        if let Some(listener) = &self.listener {
            listener(writable);
        }
    }
}

fn user_mask(index: u32) -> Result<u32> {
    if !(1..=31).contains(&index) {
        return Err(CoreError::new(
            codes::OUTBOUND_INVALID_WRITABILITY_INDEX,
            format!("user defined writability index {index} is out of range 1..=31"),
        ));
    }
    Ok(1 << index)
}

fn safe_success(promise: &ChannelPromise) {
    if !promise.is_void() && !promise.try_success() {
        tracing::debug!("写入 Promise 已完成，忽略成功通知");
    }
}

fn safe_fail(promise: &ChannelPromise, cause: CoreError) {
    if !promise.is_void() && !promise.try_failure(cause) {
        tracing::debug!("写入 Promise 已完成，忽略失败通知");
    }
}

impl fmt::Debug for OutboundBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("OutboundBuffer")
            .field("entries", &queue.entries.len())
            .field("flushed", &queue.flushed)
            .field("total_pending", &self.total_pending_write_bytes())
            .field("writable", &self.is_writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use spark_core::ReferenceCounted;

    use super::*;

    fn recorded() -> (WritabilityListener, Arc<StdMutex<Vec<bool>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let listener: WritabilityListener = Arc::new(move |writable| {
            sink.lock().unwrap().push(writable);
        });
        (listener, events)
    }

    fn buffer(low: usize, high: usize) -> (OutboundBuffer, Arc<StdMutex<Vec<bool>>>) {
        let (listener, events) = recorded();
        let water_mark = WriteBufferWaterMark::new(low, high).unwrap();
        (OutboundBuffer::new(water_mark, 0).with_listener(listener), events)
    }

    fn msg(data: &[u8]) -> PipelineMessage {
        PipelineMessage::Buffer(ByteBuf::copy_from_slice(data))
    }

    #[test]
    fn user_flag_forces_unwritable_and_clears_once() {
        let (buffer, events) = buffer(3, 4);
        buffer.set_user_defined_writability(1, false).unwrap();
        buffer.set_user_defined_writability(2, false).unwrap();
        assert!(!buffer.is_writable());
        buffer.set_user_defined_writability(1, true).unwrap();
        assert!(!buffer.is_writable(), "仍有标志为不可写");
        buffer.set_user_defined_writability(2, true).unwrap();
        assert!(buffer.is_writable());
        assert_eq!(*events.lock().unwrap(), vec![false, true], "每次真实翻转只通知一次");
    }

    #[test]
    fn rejects_out_of_range_index() {
        let (buffer, _) = buffer(3, 4);
        for index in [0, 32] {
            let err = buffer.set_user_defined_writability(index, false).unwrap_err();
            assert_eq!(err.code(), codes::OUTBOUND_INVALID_WRITABILITY_INDEX);
        }
    }

    #[test]
    fn cancelled_before_flush_is_released_and_skipped() {
        let (buffer, _) = buffer(64, 128);
        let payload = ByteBuf::copy_from_slice(b"abc");
        let observer = payload.duplicate();
        let promise = ChannelPromise::new();
        buffer.add_message(PipelineMessage::Buffer(payload), 3, promise.clone());
        assert!(promise.cancel());
        buffer.add_flush();

        assert_eq!(observer.ref_count(), 0, "取消的条目在冲刷时释放消息");
        assert_eq!(buffer.total_pending_write_bytes(), 0);
        let mut forwarded = 0;
        buffer.remove_and_write_all(|_, _| forwarded += 1);
        assert_eq!(forwarded, 0, "取消的条目不得交给传输层");
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_write_advances_reader() {
        let (buffer, _) = buffer(64, 128);
        let first = ChannelPromise::new();
        let second = ChannelPromise::new();
        buffer.add_message(msg(b"hello"), 5, first.clone());
        buffer.add_message(msg(b"world"), 5, second.clone());
        buffer.add_flush();

        buffer.remove_bytes(7);
        assert!(first.is_success());
        assert!(!second.is_done());
        assert_eq!(buffer.current(|m| m.as_buffer().unwrap().to_vec()), Some(b"rld".to_vec()));
        assert_eq!(buffer.current_progress(), Some(2));

        let views = buffer.flushed_buffers(16, usize::MAX);
        assert_eq!(views.len(), 1);
        assert_eq!(&views[0][..], b"rld");
    }

    #[test]
    fn close_fails_everything_without_writability_events() {
        let (buffer, events) = buffer(1, 2);
        let flushed = ChannelPromise::new();
        let unflushed = ChannelPromise::new();
        buffer.add_message(msg(b"abc"), 3, flushed.clone());
        buffer.add_flush();
        buffer.add_message(msg(b"def"), 3, unflushed.clone());
        events.lock().unwrap().clear();

        buffer.close(CoreError::channel_closed());
        assert!(flushed.future().cause().is_some_and(|c| c.is(codes::CHANNEL_CLOSED)));
        assert!(unflushed.future().cause().is_some_and(|c| c.is(codes::CHANNEL_CLOSED)));
        assert!(events.lock().unwrap().is_empty(), "关闭路径不触发可写性回调");

        let late = ChannelPromise::new();
        buffer.add_message(msg(b"late"), 4, late.clone());
        assert!(late.future().cause().is_some(), "关闭后的写入立即失败");
        assert_eq!(buffer.pending_entries(), 0);
    }
}
