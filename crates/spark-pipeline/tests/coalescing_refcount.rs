//! 合并队列的引用计数与 Promise 聚合。
//!
//! 每个加入队列的缓冲恰好被消费一次引用：整段取走时转交给组合缓冲，
//! 部分取走时以切片增加一次引用、余下部分留在队列。

mod support;

use std::sync::Arc;

use parking_lot::Mutex;
use spark_core::{
    ByteBuf, ChannelPromise, CoreError, PipelineMessage, ReferenceCounted, Result,
    UnpooledAllocator, error::codes,
};
use spark_pipeline::{
    ChannelHandler, ChannelHandlerContext, CoalescingBufferQueue, EmbeddedChannel, OutboundBuffer,
    WriteBufferWaterMark,
};

fn tracked(data: &[u8]) -> (ByteBuf, ByteBuf) {
    let buf = ByteBuf::copy_from_slice(data);
    let observer = buf.duplicate();
    (buf, observer)
}

#[test]
fn composite_owns_components_until_released() {
    let mut queue = CoalescingBufferQueue::new();
    let mut observers = Vec::new();
    let mut promises = Vec::new();
    for data in [&b"abc"[..], b"defg", b"hi"] {
        let (buf, observer) = tracked(data);
        let promise = ChannelPromise::new();
        queue.add(buf, promise.clone());
        observers.push(observer);
        promises.push(promise);
    }

    let aggregate = ChannelPromise::new();
    let composite = queue
        .remove(&UnpooledAllocator, usize::MAX, &aggregate)
        .expect("组合成功");
    assert!(composite.is_composite());
    assert_eq!(composite.component_count(), 3);
    assert_eq!(composite.as_slice(), b"abcdefghi");
    assert!(queue.is_empty());
    assert!(
        observers.iter().all(|buf| buf.ref_count() == 1),
        "组合缓冲接管各分量的引用"
    );

    assert!(composite.release().expect("释放成功"), "组合缓冲归零");
    assert!(
        observers.iter().all(|buf| buf.ref_count() == 0),
        "组合缓冲归零时各分量随之归零"
    );

    aggregate.try_success();
    assert!(promises.iter().all(ChannelPromise::is_success), "原始 Promise 随聚合完成");
}

#[test]
fn partial_remove_retains_the_split_buffer() {
    let mut queue = CoalescingBufferQueue::new();
    let (buf, observer) = tracked(b"abcdef");
    let promise = ChannelPromise::new();
    queue.add(buf, promise.clone());

    let first = ChannelPromise::new();
    let head = queue
        .remove(&UnpooledAllocator, 4, &first)
        .expect("切分成功");
    assert_eq!(head.as_slice(), b"abcd");
    assert_eq!(observer.ref_count(), 2, "切片与余下部分各持一次引用");
    assert_eq!(queue.readable_bytes(), 2);

    head.release().expect("释放切片");
    first.try_success();
    assert!(!promise.is_done(), "写入尚未整段取走");

    let second = ChannelPromise::new();
    let rest = queue
        .remove(&UnpooledAllocator, usize::MAX, &second)
        .expect("取出余下部分");
    assert_eq!(rest.as_slice(), b"ef");
    rest.release().expect("释放余下部分");
    assert_eq!(observer.ref_count(), 0);

    second.try_failure(CoreError::new("test.downstream", "downstream failed"));
    assert_eq!(
        promise.future().cause().map(|err| err.code()),
        Some("test.downstream"),
        "聚合失败同样传递给原始 Promise"
    );
}

#[test]
fn copy_to_retains_every_buffer() {
    let mut source = CoalescingBufferQueue::new();
    let (buf, observer) = tracked(b"shared");
    source.add(buf, ChannelPromise::new());

    let mut copy = CoalescingBufferQueue::new();
    source.copy_to(&mut copy).expect("复制成功");
    assert_eq!(observer.ref_count(), 2);
    assert_eq!(copy.readable_bytes(), 6);

    source.release_and_fail_all(CoreError::channel_closed());
    copy.release_and_fail_all(CoreError::channel_closed());
    assert_eq!(observer.ref_count(), 0);
}

#[test]
fn tracked_queue_drives_channel_writability() {
    let water_mark = WriteBufferWaterMark::new(3, 4).expect("合法水位线");
    let tracker = Arc::new(OutboundBuffer::new(water_mark, 0));
    let mut queue = CoalescingBufferQueue::with_writability_tracking(Arc::clone(&tracker));

    queue.add(ByteBuf::copy_from_slice(b"hello"), ChannelPromise::void());
    assert_eq!(tracker.total_pending_write_bytes(), 5);
    assert!(!tracker.is_writable(), "合并队列中的字节计入挂起字节");

    let aggregate = ChannelPromise::new();
    let chunk = queue
        .remove(&UnpooledAllocator, 3, &aggregate)
        .expect("取出成功");
    assert_eq!(tracker.total_pending_write_bytes(), 2);
    assert!(tracker.is_writable());
    chunk.release().expect("释放");
    queue.release_and_fail_all(CoreError::channel_closed());
    assert_eq!(tracker.total_pending_write_bytes(), 0);
}

/// 把写入攒在合并队列里，冲刷时按固定块大小写出。
struct Chunker {
    queue: Mutex<CoalescingBufferQueue>,
    chunk: usize,
}

impl ChannelHandler for Chunker {
    fn write(
        &self,
        ctx: &ChannelHandlerContext,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<()> {
        match msg {
            PipelineMessage::Buffer(buf) => self.queue.lock().add(buf, promise),
            other => {
                ctx.write(other, promise);
            }
        }
        Ok(())
    }

    fn flush(&self, ctx: &ChannelHandlerContext) -> Result<()> {
        loop {
            let (chunk, aggregate) = {
                let mut queue = self.queue.lock();
                if queue.is_empty() {
                    break;
                }
                let aggregate = ctx.new_promise();
                (queue.remove(&UnpooledAllocator, self.chunk, &aggregate)?, aggregate)
            };
            ctx.write(PipelineMessage::Buffer(chunk), aggregate);
        }
        ctx.flush();
        Ok(())
    }

    fn handler_removed(&self, _ctx: &ChannelHandlerContext) -> Result<()> {
        self.queue
            .lock()
            .release_and_fail_all(CoreError::channel_closed());
        Ok(())
    }
}

#[test]
fn chunking_handler_reframes_writes() {
    let channel = EmbeddedChannel::new(vec![Arc::new(Chunker {
        queue: Mutex::new(CoalescingBufferQueue::new()),
        chunk: 4,
    })])
    .expect("构造成功");

    let mut observers = Vec::new();
    let mut futures = Vec::new();
    for data in [&b"ab"[..], b"cdef", b"g"] {
        let (buf, observer) = tracked(data);
        observers.push(observer);
        futures.push(channel.channel().write(PipelineMessage::Buffer(buf)));
    }
    channel.channel().flush();
    channel.run_pending_tasks();

    let mut chunks = Vec::new();
    while let Some(msg) = channel.read_outbound() {
        chunks.push(msg.as_buffer().map(ByteBuf::to_vec).unwrap_or_default());
        msg.release_quietly();
    }
    assert_eq!(chunks, vec![b"abcd".to_vec(), b"efg".to_vec()], "按块大小重新分帧");
    assert!(futures.iter().all(|future| future.is_success()), "原始写入随块写出完成");
    assert!(observers.iter().all(|buf| buf.ref_count() == 0), "所有原始缓冲归零");
}

#[test]
fn pending_chunks_fail_when_handler_is_removed() {
    let channel = EmbeddedChannel::new(vec![Arc::new(Chunker {
        queue: Mutex::new(CoalescingBufferQueue::new()),
        chunk: 4,
    })])
    .expect("构造成功");
    let (buf, observer) = tracked(b"queued");
    let future = channel.channel().write(PipelineMessage::Buffer(buf));

    channel.pipeline().remove_first().expect("移除成功");
    assert_eq!(future.cause().map(|err| err.code()), Some(codes::CHANNEL_CLOSED));
    assert_eq!(observer.ref_count(), 0);
}
