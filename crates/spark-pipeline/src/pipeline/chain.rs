//! Handler 链路的槽位竞技场。
//!
//! # 设计背景（Why）
//! - 双向链表若直接以 `Arc` 互相引用会形成引用环；这里改为以槽位下标 + 代数
//!   （[`Link`]）表达前驱/后继，哨兵 head/tail 固定在 0/1 号槽位。
//!
//! # 逻辑解析（How）
//! - 解除链接的节点成为“墓碑”：仍保留自己的前驱/后继，使正在其回调中传播的事件
//!   可以绕过它继续前进；
//! - 墓碑只在没有任何分发在途、且节点不再被分发路径持有时才回收，回收时代数加一，
//!   旧 [`Link`] 随即失效。

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use super::node::HandlerNode;

/// 指向槽位的稳定句柄：下标 + 代数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Link {
    index: u32,
    generation: u32,
}

/// 头哨兵。
pub(crate) const HEAD: Link = Link {
    index: 0,
    generation: 0,
};

/// 尾哨兵。
pub(crate) const TAIL: Link = Link {
    index: 1,
    generation: 0,
};

pub(crate) struct Entry {
    pub(crate) node: Arc<HandlerNode>,
    pub(crate) prev: Link,
    pub(crate) next: Link,
    pub(crate) linked: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// 等待注册完成后补发的生命周期回调。
pub(crate) enum PendingCallback {
    Added(Link, Arc<HandlerNode>),
    Removed(Link, Arc<HandlerNode>),
}

pub(crate) struct Chain {
    slots: Vec<Slot>,
    free: Vec<u32>,
    tombstones: Vec<u32>,
    names: HashMap<Arc<str>, Link>,
    pub(crate) registered: bool,
    pub(crate) pending: VecDeque<PendingCallback>,
}

impl Chain {
    pub(crate) fn new(head: Arc<HandlerNode>, tail: Arc<HandlerNode>) -> Self {
        let slots = vec![
            Slot {
                generation: 0,
                entry: Some(Entry {
                    node: head,
                    prev: HEAD,
                    next: TAIL,
                    linked: true,
                }),
            },
            Slot {
                generation: 0,
                entry: Some(Entry {
                    node: tail,
                    prev: HEAD,
                    next: TAIL,
                    linked: true,
                }),
            },
        ];
        Self {
            slots,
            free: Vec::new(),
            tombstones: Vec::new(),
            names: HashMap::new(),
            registered: false,
            pending: VecDeque::new(),
        }
    }

    /// 解析句柄；代数不符或槽位已回收时返回 `None`。
    pub(crate) fn entry(&self, link: Link) -> Option<&Entry> {
        let slot = self.slots.get(link.index as usize)?;
        if slot.generation != link.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, link: Link) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(link.index as usize)?;
        if slot.generation != link.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// 句柄是否指向仍在链上的节点。
    pub(crate) fn is_linked(&self, link: Link) -> bool {
        self.entry(link).is_some_and(|entry| entry.linked)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Link> {
        self.names.get(name).copied()
    }

    pub(crate) fn contains_name(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// 在 `prev` 之后链接新节点并登记名称。调用方保证 `prev` 在链上且不是尾哨兵。
    pub(crate) fn link_after(&mut self, prev: Link, node: Arc<HandlerNode>) -> Link {
        let next = self.entry(prev).map(|entry| entry.next).unwrap_or(TAIL);
        let name = Arc::clone(node.name());
        let link = self.allocate(Entry {
            node,
            prev,
            next,
            linked: true,
        });
        if let Some(entry) = self.entry_mut(prev) {
            entry.next = link;
        }
        if let Some(entry) = self.entry_mut(next) {
            entry.prev = link;
        }
        self.names.insert(name, link);
        link
    }

    /// 解除链接并转为墓碑，返回节点。
    pub(crate) fn unlink(&mut self, link: Link) -> Option<Arc<HandlerNode>> {
        let (prev, next, node) = {
            let entry = self.entry_mut(link)?;
            if !entry.linked {
                return None;
            }
            entry.linked = false;
            (entry.prev, entry.next, Arc::clone(&entry.node))
        };
        if let Some(entry) = self.entry_mut(prev) {
            entry.next = next;
        }
        if let Some(entry) = self.entry_mut(next) {
            entry.prev = prev;
        }
        self.names.remove(node.name().as_ref());
        self.tombstones.push(link.index);
        Some(node)
    }

    /// 用新节点原位替换 `old`：旧节点成为墓碑，其前驱/后继指向新节点。
    pub(crate) fn replace(&mut self, old: Link, node: Arc<HandlerNode>) -> Option<(Link, Arc<HandlerNode>)> {
        let prev = self.entry(old).filter(|entry| entry.linked)?.prev;
        let removed = self.unlink(old)?;
        let link = self.link_after(prev, node);
        if let Some(entry) = self.entry_mut(old) {
            entry.prev = link;
            entry.next = link;
        }
        Some((link, removed))
    }

    /// 自 `from` 起沿后继方向取下一个节点；墓碑按其保留的后继继续前进。
    pub(crate) fn next_of(&self, from: Link) -> Option<Link> {
        self.entry(from).map(|entry| entry.next)
    }

    pub(crate) fn prev_of(&self, from: Link) -> Option<Link> {
        self.entry(from).map(|entry| entry.prev)
    }

    /// 按链上顺序（head 之后到 tail 之前）遍历用户节点。
    pub(crate) fn user_links(&self) -> Vec<(Link, Arc<HandlerNode>)> {
        let mut out = Vec::new();
        let mut cursor = self.entry(HEAD).map(|entry| entry.next);
        while let Some(link) = cursor {
            if link == TAIL {
                break;
            }
            match self.entry(link) {
                Some(entry) => {
                    out.push((link, Arc::clone(&entry.node)));
                    cursor = Some(entry.next);
                }
                None => break,
            }
        }
        out
    }

    /// 回收不再被任何分发路径持有的墓碑。调用方保证此刻没有在途分发。
    pub(crate) fn reclaim(&mut self) {
        let mut kept = Vec::new();
        for index in std::mem::take(&mut self.tombstones) {
            let Some(slot) = self.slots.get_mut(index as usize) else {
                continue;
            };
            let releasable = slot
                .entry
                .as_ref()
                .is_some_and(|entry| Arc::strong_count(&entry.node) == 1);
            if releasable {
                slot.entry = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
            } else {
                kept.push(index);
            }
        }
        self.tombstones = kept;
    }

    fn allocate(&mut self, entry: Entry) -> Link {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return Link {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        Link {
            index,
            generation: 0,
        }
    }
}
