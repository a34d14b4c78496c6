use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};

use super::{ScheduledHandle, Task};

/// 定时堆中的一项，按 `(deadline, seq)` 升序出堆。
pub(super) struct ScheduledTask {
    deadline: Duration,
    seq: u64,
    handle: ScheduledHandle,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // BinaryHeap 是大顶堆，反转比较得到最早到期者。
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// 以相对时间刻度记录的最小堆定时队列，两种事件循环共用。
///
/// 队列只由单一所有者访问：嵌入式循环在自身锁内，单线程循环在循环线程本地。
#[derive(Default)]
pub(super) struct ScheduledQueue {
    heap: BinaryHeap<ScheduledTask>,
    seq: u64,
}

impl ScheduledQueue {
    /// 挂入一项定时任务；同一到期时间按挂入顺序出堆。
    pub(super) fn push(&mut self, deadline: Duration, handle: ScheduledHandle, task: Task) {
        self.seq += 1;
        self.heap.push(ScheduledTask {
            deadline,
            seq: self.seq,
            handle,
            task,
        });
    }

    /// 弹出一项已到期且未取消的任务；已取消的项在途中被丢弃。
    pub(super) fn pop_due(&mut self, now: Duration) -> Option<Task> {
        while let Some(head) = self.heap.peek() {
            if head.handle.is_cancelled() {
                self.heap.pop();
                continue;
            }
            if head.deadline > now {
                return None;
            }
            return self.heap.pop().map(|entry| entry.task);
        }
        None
    }

    /// 最近一项仍有效任务的到期时间。
    pub(super) fn next_deadline(&mut self) -> Option<Duration> {
        while let Some(head) = self.heap.peek() {
            if head.handle.is_cancelled() {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline);
        }
        None
    }

    pub(super) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(super) fn clear(&mut self) {
        self.heap.clear();
    }
}
