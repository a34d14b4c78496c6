//! Channel：一条连接（或一个监听端点）的句柄。
//!
//! # 模块定位（Why）
//! - Channel 把传输层资源（[`ChannelTransport`]）、Handler 链（[`ChannelPipeline`]）、
//!   出站缓冲（[`OutboundBuffer`]）与所属事件循环绑定在一起；
//! - 对外的 `bind`/`write`/`close` 等操作都经 Pipeline 自 tail 传播，最终由头哨兵调用本模块中
//!   带 `0` 后缀的底层操作，底层操作只在 Channel 的事件循环上执行。
//!
//! # 结构概要（How）
//! - [`ChannelId`]：进程内唯一标识；
//! - [`ChannelTransport`]：传输层契约；
//! - [`Channel`]：共享句柄，内部为 `Arc`，克隆廉价。

mod id;
mod transport;

pub use id::ChannelId;
pub use transport::ChannelTransport;

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, OnceLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use spark_core::{
    ChannelFuture, ChannelPromise, CoreError, EventExecutor, PipelineMessage, error::codes,
};

use crate::{
    config::ChannelConfig,
    outbound::OutboundBuffer,
    pipeline::{
        ChannelPipeline, InboundEvent, LoggingUnhandledPolicy, PipelineShared,
        UnhandledEventPolicy,
    },
};

pub(crate) struct ChannelInner {
    id: ChannelId,
    transport: Arc<dyn ChannelTransport>,
    config: ChannelConfig,
    pipeline: ChannelPipeline,
    outbound: ArcSwapOption<OutboundBuffer>,
    close_promise: ChannelPromise,
    event_loop: OnceLock<Arc<dyn EventExecutor>>,
    registered: AtomicBool,
    closing: AtomicBool,
    in_flush0: AtomicBool,
}

impl ChannelInner {
    pub(crate) fn event_loop(&self) -> Option<Arc<dyn EventExecutor>> {
        self.event_loop.get().cloned()
    }

    pub(crate) fn outbound_buffer(&self) -> Option<Arc<OutboundBuffer>> {
        self.outbound.load_full()
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

/// Channel 句柄。
///
/// # 教案式说明
/// - **意图（Why）**：为上层提供与具体传输无关的连接抽象，所有 I/O 操作非阻塞并返回 [`ChannelFuture`]。
/// - **逻辑（How）**：
///   - 构造时创建 Pipeline 与出站缓冲，出站缓冲的可写性翻转经 Pipeline 以
///     `channel_writability_changed` 通知各 Handler；
///   - [`register`](Self::register) 把 Channel 绑定到一个事件循环，补发排队的 `handler_added`，
///     随后传播 `channel_registered`，若传输层已激活再传播 `channel_active`；
///   - 关闭时先摘下出站缓冲（此后的写入立即以 `channel.closed` 失败），再按入队顺序失败全部挂起写入，
///     完成 [`close_future`](Self::close_future)，随后在事件循环上传播 `channel_inactive` 与
///     `channel_unregistered`，最终拆除 Pipeline。
/// - **契约（What）**：
///   - 一个 Channel 只能注册一次，重复注册以 `channel.already_registered` 失败；
///   - `close` 幂等，重复调用的 Promise 在首次关闭完成后成功；
///   - 冲刷时传输层写出失败，剩余可发送条目以 `channel.write_failed` 失败；
///     若 `auto_close` 开启，随后关闭 Channel。
/// - **风险与权衡（Trade-offs）**：Handler 持有 `Channel` 克隆会延长 Channel 生命周期，
///   需要长期保存时请使用 [`WeakChannel`]。
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// Channel 的弱引用。
#[derive(Clone)]
pub struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    /// 尝试取回强引用。
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(Channel::from_inner)
    }
}

impl Channel {
    /// 以默认的未处理事件策略构造。
    pub fn new(transport: Arc<dyn ChannelTransport>, config: ChannelConfig) -> Self {
        Self::with_unhandled_policy(transport, config, Arc::new(LoggingUnhandledPolicy))
    }

    /// 指定落到 tail 的事件的兜底策略。
    pub fn with_unhandled_policy(
        transport: Arc<dyn ChannelTransport>,
        config: ChannelConfig,
        policy: Arc<dyn UnhandledEventPolicy>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let shared = PipelineShared::new(weak.clone(), policy);
            let target = Arc::downgrade(&shared);
            let outbound = OutboundBuffer::from_config(&config).with_listener(Arc::new(
                move |_writable| {
                    if let Some(shared) = target.upgrade() {
                        shared.fire_inbound_from_head(InboundEvent::WritabilityChanged);
                    }
                },
            ));
            ChannelInner {
                id: ChannelId::next(),
                transport,
                config,
                pipeline: ChannelPipeline::from_shared(shared),
                outbound: ArcSwapOption::new(Some(Arc::new(outbound))),
                close_promise: ChannelPromise::new(),
                event_loop: OnceLock::new(),
                registered: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                in_flush0: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    /// 标识。
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// 是否为服务端 Channel。
    pub fn is_server(&self) -> bool {
        self.inner.transport.is_server()
    }

    /// 底层资源是否仍然打开。
    pub fn is_open(&self) -> bool {
        self.inner.transport.is_open()
    }

    /// 是否已激活。
    pub fn is_active(&self) -> bool {
        self.inner.transport.is_active()
    }

    /// 是否已注册到事件循环。
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::Acquire)
    }

    /// 出站缓冲是否可写；关闭后恒为 `false`。
    pub fn is_writable(&self) -> bool {
        self.inner
            .outbound
            .load()
            .as_ref()
            .is_some_and(|buffer| buffer.is_writable())
    }

    /// 距离变为不可写还能写入的字节数。
    pub fn bytes_before_unwritable(&self) -> usize {
        self.inner
            .outbound
            .load()
            .as_ref()
            .map_or(0, |buffer| buffer.bytes_before_unwritable())
    }

    /// 距离恢复可写还需排空的字节数。
    pub fn bytes_before_writable(&self) -> usize {
        self.inner
            .outbound
            .load()
            .as_ref()
            .map_or(0, |buffer| buffer.bytes_before_writable())
    }

    /// 本地地址。
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.transport.local_address()
    }

    /// 远端地址。
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.transport.remote_address()
    }

    /// 配置快照。
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Handler 链。
    pub fn pipeline(&self) -> &ChannelPipeline {
        &self.inner.pipeline
    }

    /// 关闭完成时成功的 Future。
    pub fn close_future(&self) -> ChannelFuture {
        self.inner.close_promise.future()
    }

    /// 出站缓冲；关闭后为 `None`。
    pub fn outbound_buffer(&self) -> Option<Arc<OutboundBuffer>> {
        self.inner.outbound_buffer()
    }

    /// 所属事件循环；尚未注册时为 `None`。
    pub fn event_loop(&self) -> Option<Arc<dyn EventExecutor>> {
        self.inner.event_loop()
    }

    /// 弱引用。
    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// 两个句柄是否指向同一个 Channel。
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 新建 Promise。
    pub fn new_promise(&self) -> ChannelPromise {
        ChannelPromise::new()
    }

    /// 注册到事件循环。
    pub fn register(&self, event_loop: Arc<dyn EventExecutor>) -> ChannelFuture {
        let promise = ChannelPromise::new();
        let future = promise.future();
        if self.inner.event_loop.set(Arc::clone(&event_loop)).is_err() {
            promise.try_failure(CoreError::new(
                codes::CHANNEL_ALREADY_REGISTERED,
                format!("channel {} is already registered", self.id()),
            ));
            return future;
        }
        if event_loop.in_event_loop() {
            self.register0(promise);
            return future;
        }
        let channel = self.clone();
        let task_promise = promise.clone();
        if let Err(err) = event_loop.execute(Box::new(move || channel.register0(task_promise))) {
            tracing::warn!(
                channel.id = %self.id(),
                executor = event_loop.name(),
                "事件循环拒绝注册任务，Channel 被强制关闭"
            );
            self.close_forcibly();
            promise.try_failure(err);
        }
        future
    }

    // ---- 出站快捷方式 ----

    /// 绑定本地地址。
    pub fn bind(&self, local: SocketAddr) -> ChannelFuture {
        self.pipeline().bind(local, ChannelPromise::new())
    }

    /// 连接远端。
    pub fn connect(&self, remote: SocketAddr) -> ChannelFuture {
        self.pipeline().connect(remote, None, ChannelPromise::new())
    }

    /// 断开连接。
    pub fn disconnect(&self) -> ChannelFuture {
        self.pipeline().disconnect(ChannelPromise::new())
    }

    /// 关闭。
    pub fn close(&self) -> ChannelFuture {
        self.pipeline().close(ChannelPromise::new())
    }

    /// 从事件循环注销。
    pub fn deregister(&self) -> ChannelFuture {
        self.pipeline().deregister(ChannelPromise::new())
    }

    /// 请求读取。
    pub fn read(&self) -> &Self {
        self.pipeline().read();
        self
    }

    /// 写入消息（不冲刷）。
    pub fn write(&self, msg: PipelineMessage) -> ChannelFuture {
        self.pipeline().write(msg, ChannelPromise::new())
    }

    /// 冲刷。
    pub fn flush(&self) -> &Self {
        self.pipeline().flush();
        self
    }

    /// 写入并冲刷。
    pub fn write_and_flush(&self, msg: PipelineMessage) -> ChannelFuture {
        self.pipeline().write_and_flush(msg, ChannelPromise::new())
    }

    // ---- 底层操作：只经头哨兵到达 ----

    fn ensure_open(&self, promise: &ChannelPromise) -> bool {
        if self.is_open() {
            return true;
        }
        promise.try_failure(CoreError::channel_closed());
        false
    }

    fn invoke_later(&self, task: impl FnOnce(&Channel) + Send + 'static) {
        let Some(event_loop) = self.inner.event_loop() else {
            task(self);
            return;
        };
        let channel = self.clone();
        if let Err(err) = event_loop.execute(Box::new(move || task(&channel))) {
            tracing::warn!(
                channel.id = %self.id(),
                error.code = err.code(),
                "事件循环拒绝后续任务"
            );
        }
    }

    fn close_if_closed(&self) {
        if !self.is_open() {
            self.pipeline().close(ChannelPromise::void());
        }
    }

    fn close_forcibly(&self) {
        if let Err(err) = self.inner.transport.do_close() {
            tracing::warn!(channel.id = %self.id(), error.code = err.code(), "强制关闭失败");
        }
        self.inner.closing.store(true, Ordering::Release);
        if let Some(buffer) = self.inner.outbound.swap(None) {
            buffer.close(CoreError::channel_closed());
        }
        self.inner.close_promise.try_success();
    }

    fn register0(&self, promise: ChannelPromise) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        if let Err(err) = self.inner.transport.do_register() {
            tracing::warn!(channel.id = %self.id(), error.code = err.code(), "注册失败");
            self.close_forcibly();
            promise.try_failure(err);
            return;
        }
        self.inner.registered.store(true, Ordering::Release);
        self.pipeline().shared().run_pending_callbacks();
        promise.try_success();
        tracing::debug!(channel.id = %self.id(), "Channel 已注册");
        self.pipeline().fire_channel_registered();
        if self.is_active() {
            self.pipeline().fire_channel_active();
        }
    }

    pub(crate) fn bind0(&self, local: SocketAddr, promise: ChannelPromise) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let was_active = self.is_active();
        if let Err(err) = self.inner.transport.do_bind(local) {
            promise.try_failure(err);
            self.close_if_closed();
            return;
        }
        if !was_active && self.is_active() {
            self.invoke_later(|channel| {
                channel.pipeline().fire_channel_active();
            });
        }
        promise.try_success();
    }

    pub(crate) fn connect0(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: ChannelPromise,
    ) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let was_active = self.is_active();
        match self.inner.transport.do_connect(remote, local) {
            Ok(()) => {
                promise.try_success();
                if !was_active && self.is_active() {
                    self.pipeline().fire_channel_active();
                }
            }
            Err(err) => {
                promise.try_failure(err);
                self.close_if_closed();
            }
        }
    }

    pub(crate) fn disconnect0(&self, promise: ChannelPromise) {
        if !promise.set_uncancellable() {
            return;
        }
        let was_active = self.is_active();
        if let Err(err) = self.inner.transport.do_disconnect() {
            promise.try_failure(err);
            self.close_if_closed();
            return;
        }
        if was_active && !self.is_active() {
            self.invoke_later(|channel| {
                channel.pipeline().fire_channel_inactive();
            });
        }
        promise.try_success();
        self.close_if_closed();
    }

    pub(crate) fn close0(&self, promise: ChannelPromise) {
        if !promise.set_uncancellable() {
            return;
        }
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            let close_future = self.close_future();
            close_future.add_listener(move |_| {
                promise.try_success();
            });
            return;
        }
        let was_active = self.is_active();
        let buffer = self.inner.outbound.swap(None);
        let result = self.inner.transport.do_close();
        if let Some(buffer) = buffer {
            buffer.fail_flushed(CoreError::channel_closed(), false);
            buffer.close(CoreError::channel_closed());
        }
        self.inner.close_promise.try_success();
        match result {
            Ok(()) => {
                promise.try_success();
            }
            Err(err) => {
                tracing::warn!(channel.id = %self.id(), error.code = err.code(), "关闭底层资源失败");
                promise.try_failure(err);
            }
        }
        tracing::debug!(channel.id = %self.id(), "Channel 已关闭");
        let fire_inactive = was_active && !self.is_active();
        self.invoke_later(move |channel| {
            if fire_inactive {
                channel.pipeline().fire_channel_inactive();
            }
            channel.deregister0(ChannelPromise::void());
        });
    }

    pub(crate) fn deregister0(&self, promise: ChannelPromise) {
        if !promise.set_uncancellable() {
            return;
        }
        if !self.is_registered() {
            promise.try_success();
            return;
        }
        if let Err(err) = self.inner.transport.do_deregister() {
            tracing::warn!(channel.id = %self.id(), error.code = err.code(), "注销失败");
        }
        self.invoke_later(move |channel| {
            if channel.inner.registered.swap(false, Ordering::AcqRel) {
                channel.pipeline().fire_channel_unregistered();
            }
            promise.try_success();
        });
    }

    pub(crate) fn begin_read0(&self) {
        if !self.is_active() {
            return;
        }
        if let Err(err) = self.inner.transport.do_begin_read() {
            self.invoke_later(move |channel| {
                channel.pipeline().fire_exception_caught(err);
            });
            self.pipeline().close(ChannelPromise::void());
        }
    }

    pub(crate) fn write0(&self, msg: PipelineMessage, promise: ChannelPromise) {
        let Some(buffer) = self.inner.outbound_buffer() else {
            msg.release_quietly();
            promise.try_failure(CoreError::channel_closed());
            return;
        };
        let size = msg.estimate_size(self.inner.config.unknown_message_size);
        buffer.add_message(msg, size, promise);
    }

    pub(crate) fn flush0(&self) {
        let Some(buffer) = self.inner.outbound_buffer() else {
            return;
        };
        buffer.add_flush();
        self.flush_now(&buffer);
    }

    fn flush_now(&self, buffer: &OutboundBuffer) {
        if buffer.is_empty() || self.inner.in_flush0.swap(true, Ordering::AcqRel) {
            return;
        }
        let outcome = if self.is_active() {
            self.inner.transport.do_write(buffer)
        } else {
            let open = self.is_open();
            let cause = if open {
                CoreError::new(codes::CHANNEL_NOT_CONNECTED, "channel is not connected")
            } else {
                CoreError::channel_closed()
            };
            buffer.fail_flushed(cause, open);
            Ok(())
        };
        self.inner.in_flush0.store(false, Ordering::Release);
        if let Err(err) = outcome {
            tracing::warn!(channel.id = %self.id(), error.code = err.code(), "写出失败");
            let cause = CoreError::new(codes::CHANNEL_WRITE_FAILED, "transport write failed")
                .with_cause(err);
            buffer.fail_flushed(cause, true);
            if self.inner.config.auto_close {
                self.pipeline().close(ChannelPromise::void());
            }
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .field("registered", &self.is_registered())
            .finish()
    }
}
