//! 内存中的 Channel，用于在不接触网络的情况下驱动 Handler。
//!
//! # 教案式说明
//! - **意图（Why）**：Handler 的单元测试需要确定性地“喂入入站消息、取出出站消息”，
//!   并在同一线程上控制任务与定时器的执行时机。
//! - **逻辑（How）**：
//!   - 传输层把冲刷出的消息收进出站队列并立即成功其 Promise；
//!   - 落到 tail 的入站消息收进入站队列，落到 tail 的异常被记录，供 [`check_exception`](EmbeddedChannel::check_exception) 取出；
//!   - 事件循环为 [`EmbeddedEventLoop`]，`in_event_loop` 恒为真，分发全部内联，
//!     排队任务由 [`run_pending_tasks`](EmbeddedChannel::run_pending_tasks) 驱动。
//! - **契约（What）**：构造完成时 Channel 已注册且处于激活状态；`finish` 关闭 Channel 并报告是否仍有未读消息。

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use spark_core::{
    ChannelFuture, CoreError, EventExecutor, PipelineMessage, Result, runtime::EmbeddedEventLoop,
};

use crate::{
    channel::{Channel, ChannelTransport},
    config::ChannelConfig,
    handler::{ChannelHandler, UserEvent},
    outbound::OutboundBuffer,
    pipeline::{ChannelPipeline, UnhandledEventPolicy},
};

const STATE_ACTIVE: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Default)]
struct Queues {
    inbound: Mutex<VecDeque<PipelineMessage>>,
    outbound: Mutex<VecDeque<PipelineMessage>>,
    exceptions: Mutex<VecDeque<CoreError>>,
}

struct EmbeddedTransport {
    state: AtomicU8,
    queues: Arc<Queues>,
}

impl ChannelTransport for EmbeddedTransport {
    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_CLOSED
    }

    fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_ACTIVE
    }

    fn local_address(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    fn do_bind(&self, _local: SocketAddr) -> Result<()> {
        Ok(())
    }

    fn do_connect(&self, _remote: SocketAddr, _local: Option<SocketAddr>) -> Result<()> {
        let _ = self
            .state
            .compare_exchange(STATE_OPEN, STATE_ACTIVE, Ordering::AcqRel, Ordering::Acquire);
        Ok(())
    }

    fn do_disconnect(&self) -> Result<()> {
        self.do_close()
    }

    fn do_close(&self) -> Result<()> {
        self.state.store(STATE_CLOSED, Ordering::Release);
        Ok(())
    }

    fn do_begin_read(&self) -> Result<()> {
        Ok(())
    }

    fn do_write(&self, buffer: &OutboundBuffer) -> Result<()> {
        let _ = buffer.remove_and_write_all(|msg, promise| {
            self.queues.outbound.lock().push_back(msg);
            promise.try_success();
        });
        Ok(())
    }
}

struct EmbeddedPolicy {
    queues: Arc<Queues>,
}

impl UnhandledEventPolicy for EmbeddedPolicy {
    fn unhandled_message(&self, _channel: Option<&Channel>, msg: PipelineMessage) {
        self.queues.inbound.lock().push_back(msg);
    }

    fn unhandled_exception(&self, _channel: Option<&Channel>, cause: &CoreError) {
        self.queues.exceptions.lock().push_back(cause.clone());
    }

    fn unhandled_user_event(&self, _channel: Option<&Channel>, _event: UserEvent) {}
}

/// 基于内存队列的 Channel。
pub struct EmbeddedChannel {
    channel: Channel,
    event_loop: Arc<EmbeddedEventLoop>,
    queues: Arc<Queues>,
}

impl EmbeddedChannel {
    /// 以默认配置构造，并按顺序追加 `handlers`。
    pub fn new(handlers: Vec<Arc<dyn ChannelHandler>>) -> Result<Self> {
        Self::with_config(ChannelConfig::default(), handlers)
    }

    /// 以指定配置构造。
    pub fn with_config(
        config: ChannelConfig,
        handlers: Vec<Arc<dyn ChannelHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        let queues = Arc::new(Queues::default());
        let transport = Arc::new(EmbeddedTransport {
            state: AtomicU8::new(STATE_ACTIVE),
            queues: Arc::clone(&queues),
        });
        let policy = Arc::new(EmbeddedPolicy {
            queues: Arc::clone(&queues),
        });
        let channel = Channel::with_unhandled_policy(transport, config, policy);
        for handler in handlers {
            channel.pipeline().add_last(None, handler)?;
        }
        let event_loop = Arc::new(EmbeddedEventLoop::new());
        let executor: Arc<dyn EventExecutor> = Arc::clone(&event_loop) as Arc<dyn EventExecutor>;
        let registered = channel.register(executor);
        event_loop.run_pending_tasks();
        if let Some(Err(err)) = registered.result() {
            return Err(err);
        }
        let embedded = Self {
            channel,
            event_loop,
            queues,
        };
        embedded.check_exception()?;
        Ok(embedded)
    }

    /// 底层 Channel。
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Handler 链。
    pub fn pipeline(&self) -> &ChannelPipeline {
        self.channel.pipeline()
    }

    /// 依次作为 `channel_read` 喂入，随后触发一次 `channel_read_complete`。
    ///
    /// 返回入站队列是否非空；途中到达 tail 的异常以 `Err` 返回。
    pub fn write_inbound(&self, msgs: impl IntoIterator<Item = PipelineMessage>) -> Result<bool> {
        if !self.channel.is_open() {
            for msg in msgs {
                msg.release_quietly();
            }
            return Err(CoreError::channel_closed());
        }
        let pipeline = self.pipeline();
        for msg in msgs {
            pipeline.fire_channel_read(msg);
        }
        pipeline.fire_channel_read_complete();
        self.run_pending_tasks();
        self.check_exception()?;
        Ok(!self.queues.inbound.lock().is_empty())
    }

    /// 依次写入并冲刷。
    ///
    /// 返回出站队列是否非空；任一写入失败以该错误返回。
    pub fn write_outbound(&self, msgs: impl IntoIterator<Item = PipelineMessage>) -> Result<bool> {
        let futures: Vec<ChannelFuture> = msgs
            .into_iter()
            .map(|msg| self.channel.write(msg))
            .collect();
        self.channel.flush();
        self.run_pending_tasks();
        self.check_exception()?;
        for future in &futures {
            if let Some(cause) = future.cause() {
                return Err(cause);
            }
        }
        Ok(!self.queues.outbound.lock().is_empty())
    }

    /// 取出一条到达 tail 的入站消息。
    pub fn read_inbound(&self) -> Option<PipelineMessage> {
        self.queues.inbound.lock().pop_front()
    }

    /// 取出一条写出的出站消息。
    pub fn read_outbound(&self) -> Option<PipelineMessage> {
        self.queues.outbound.lock().pop_front()
    }

    /// 运行排队任务与到期定时任务。
    pub fn run_pending_tasks(&self) -> usize {
        self.event_loop.run_pending_tasks()
    }

    /// 推进虚拟时钟并运行到期任务。
    pub fn advance_time_by(&self, delta: Duration) -> usize {
        self.event_loop.advance_time_by(delta)
    }

    /// 取出最早记录的、到达 tail 的异常；其余记录一并清空。
    pub fn check_exception(&self) -> Result<()> {
        let mut exceptions = self.queues.exceptions.lock();
        let first = exceptions.pop_front();
        if !exceptions.is_empty() {
            tracing::debug!(dropped = exceptions.len(), "丢弃后续记录的异常");
            exceptions.clear();
        }
        match first {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// 关闭 Channel 并运行后续任务。
    pub fn close(&self) -> ChannelFuture {
        let future = self.channel.close();
        self.run_pending_tasks();
        future
    }

    /// 关闭 Channel，返回入站或出站队列中是否还有未读消息。
    pub fn finish(&self) -> Result<bool> {
        self.close();
        self.check_exception()?;
        Ok(!self.queues.inbound.lock().is_empty() || !self.queues.outbound.lock().is_empty())
    }

    /// 关闭 Channel 并释放全部未读消息，返回是否释放过任何消息。
    pub fn finish_and_release_all(&self) -> Result<bool> {
        let leftovers = self.finish()?;
        self.release_inbound();
        self.release_outbound();
        Ok(leftovers)
    }

    /// 释放入站队列中的全部消息。
    pub fn release_inbound(&self) -> bool {
        release_all(&self.queues.inbound)
    }

    /// 释放出站队列中的全部消息。
    pub fn release_outbound(&self) -> bool {
        release_all(&self.queues.outbound)
    }
}

fn release_all(queue: &Mutex<VecDeque<PipelineMessage>>) -> bool {
    let drained: Vec<_> = queue.lock().drain(..).collect();
    let released = !drained.is_empty();
    for msg in drained {
        msg.release_quietly();
    }
    released
}
