use bytes::Bytes;

use super::ByteBuf;
use crate::Result;

/// 缓冲分配策略的最小契约。
///
/// 传输内核只消费引用计数语义，不关心池化细节；合并队列在需要把多个缓冲拼成一个时调用
/// [`compose`](Self::compose)。
pub trait BufferAllocator: Send + Sync {
    /// 复制 `data` 构造新缓冲。
    fn buffer(&self, data: &[u8]) -> ByteBuf;

    /// 空缓冲。
    fn empty(&self) -> ByteBuf {
        self.buffer(&[])
    }

    /// 复制 `source` 的可读内容，结果拥有独立的引用计数；不消费 `source` 的引用。
    fn copied(&self, source: &ByteBuf) -> ByteBuf {
        self.buffer(source.as_slice())
    }

    /// 组合多个缓冲，消费每个分量的一次引用，语义同 [`ByteBuf::compose`]。
    fn compose(&self, components: Vec<ByteBuf>) -> Result<ByteBuf> {
        ByteBuf::compose(components)
    }
}

/// 非池化分配器：每次分配都新建 `Bytes`。
#[derive(Clone, Copy, Debug, Default)]
pub struct UnpooledAllocator;

impl BufferAllocator for UnpooledAllocator {
    fn buffer(&self, data: &[u8]) -> ByteBuf {
        ByteBuf::from_bytes(Bytes::copy_from_slice(data))
    }

    fn empty(&self) -> ByteBuf {
        ByteBuf::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReferenceCounted;

    #[test]
    fn copied_buffer_has_independent_count() {
        let source = ByteBuf::copy_from_slice(b"spark");
        let copy = UnpooledAllocator.copied(&source);
        assert_eq!(copy.as_slice(), b"spark");
        assert!(source.release().unwrap(), "原缓冲独立归零");
        assert_eq!(copy.ref_count(), 1, "副本计数不受原缓冲影响");
        assert!(copy.release().unwrap());
    }
}
