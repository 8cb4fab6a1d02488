//! Skip-indexed run queue.
//!
//! An intrusive FIFO of tasks with up to five index layers above it. Every
//! completed run of `SKIP_GAP` elements at one level is summarized by a
//! single node at the level above, so the queue can give away its oldest
//! half in O(log n) without walking the base list, while enqueue and dequeue
//! stay O(1).
//!
//! The queue owns one task reference per queued element: the head position
//! plus each task's intrusive link. Index nodes carry identities only and
//! are rebuilt lazily; a stale upper index costs performance, never
//! correctness. All access is serialized by the per-worker mutex around the
//! queue, including thieves.

use crate::task::{SlotPos, TaskRef};
use std::fmt;
use std::mem;
use std::ptr::NonNull;

pub(crate) const SKIP_GAP: u64 = 64;

/// 64^5 runs cover roughly 2^30 queued tasks, enough in practice.
pub(crate) const INDEX_LAYERS: usize = 5;

/// What an index node points at: a task for layer 0, a lower index node for
/// every layer above.
enum Down {
    Task(SlotPos),
    Node(NonNull<SkipNode>),
}

impl Down {
    fn is_task(&self, pos: &SlotPos) -> bool {
        matches!(self, Down::Task(p) if p == pos)
    }

    fn is_node(&self, ptr: NonNull<SkipNode>) -> bool {
        matches!(self, Down::Node(p) if *p == ptr)
    }

    fn as_node(&self) -> NonNull<SkipNode> {
        match self {
            Down::Node(p) => *p,
            Down::Task(_) => unreachable!("descended below layer 0"),
        }
    }

    fn as_task(&self) -> &SlotPos {
        match self {
            Down::Task(p) => p,
            Down::Node(_) => unreachable!("layer 0 node pointing at an index node"),
        }
    }
}

struct SkipNode {
    /// First covered element of the run below.
    down: Down,
    /// Last covered element of the run below; the structural anchor for
    /// discard and split.
    last_down: Down,
    next: Option<Box<SkipNode>>,
}

struct IndexLayer {
    head: Option<Box<SkipNode>>,
    tail: Option<NonNull<SkipNode>>,
    /// First node of the run currently being filled, if any.
    candidate: Option<NonNull<SkipNode>>,
    head_off: u64,
    tail_off: u64,
}

impl IndexLayer {
    fn new() -> Self {
        Self {
            head: None,
            tail: None,
            candidate: None,
            head_off: 0,
            tail_off: 0,
        }
    }

    fn len(&self) -> u64 {
        self.tail_off - self.head_off
    }

    fn push(&mut self, node: Box<SkipNode>) -> NonNull<SkipNode> {
        let mut node = node;
        let ptr = NonNull::from(&mut *node);
        match self.tail {
            Some(mut tail) => unsafe { tail.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
        self.tail = Some(ptr);
        ptr
    }

    fn pop_head(&mut self) {
        let mut head = self.head.take().expect("popping an empty index layer");
        self.head = head.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
    }

    /// Drops all nodes, keeping offsets consistent. Iterative so long chains
    /// cannot overflow the stack through recursive box drops.
    fn clear(&mut self) {
        let mut cur = self.head.take();
        while let Some(mut node) = cur {
            cur = node.next.take();
        }
        self.tail = None;
        self.candidate = None;
        self.head_off = self.tail_off;
    }
}

impl Drop for IndexLayer {
    fn drop(&mut self) {
        self.clear();
    }
}

pub(crate) struct SkipQueue {
    layers: [IndexLayer; INDEX_LAYERS],
    /// Owning position of the first task.
    head: Option<SlotPos>,
    tail: Option<SlotPos>,
    /// First task of the run currently being filled.
    candidate: Option<SlotPos>,
    head_off: u64,
    tail_off: u64,
}

// Safety: index nodes are only reached through `&mut self`; the external
// per-worker mutex serializes every access, including from stealing workers.
unsafe impl Send for SkipQueue {}

impl SkipQueue {
    pub(crate) fn new() -> Self {
        Self {
            layers: std::array::from_fn(|_| IndexLayer::new()),
            head: None,
            tail: None,
            candidate: None,
            head_off: 0,
            tail_off: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        (self.tail_off - self.head_off) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head_off == self.tail_off
    }

    /// Appends a task, taking over its owned reference.
    pub(crate) fn enqueue(&mut self, task: TaskRef) {
        let pos = task.into_pos();
        debug_assert!(unsafe { pos.task().link_clone() }.is_none());

        match &self.tail {
            Some(tail) => unsafe { tail.task().link_set(Some(pos.clone())) },
            None => {
                debug_assert!(self.head.is_none());
                self.head = Some(pos.clone());
            }
        }
        self.tail = Some(pos);
        self.tail_off += 1;
        self.index_after_enqueue();
    }

    fn index_after_enqueue(&mut self) {
        if self.candidate.is_some() && self.tail_off % SKIP_GAP == 0 {
            // A run just completed: promote it to layer 0, cascading upward
            // while promotions keep completing runs.
            let mut down = Down::Task(self.candidate.take().expect("checked above"));
            let mut last_down = Down::Task(self.tail.clone().expect("non-empty queue"));

            for layer in self.layers.iter_mut() {
                let node = layer.push(Box::new(SkipNode {
                    down,
                    last_down,
                    next: None,
                }));
                layer.tail_off += 1;

                if layer.candidate.is_some() && layer.tail_off % SKIP_GAP == 0 {
                    down = Down::Node(layer.candidate.take().expect("checked above"));
                    last_down = Down::Node(node);
                    // Promotions above the top layer fall off the end; the
                    // uppermost runs simply stay unindexed.
                } else {
                    if layer.tail_off % SKIP_GAP == 1 {
                        layer.candidate = Some(node);
                    }
                    break;
                }
            }
        } else if self.tail_off % SKIP_GAP == 1 {
            self.candidate = self.tail.clone();
        }
    }

    /// Pops the oldest task, if any.
    pub(crate) fn dequeue(&mut self) -> Option<TaskRef> {
        let pos = self.head.take()?;
        self.head = unsafe { pos.task().link_take() };
        if self.head.is_none() {
            self.tail = None;
        }
        if self.candidate.as_ref() == Some(&pos) {
            self.candidate = None;
        }
        self.head_off += 1;
        if self.head_off % SKIP_GAP == 0 {
            self.discard_index_after_dequeue(&pos);
        }
        Some(unsafe { TaskRef::from_owned_pos(pos) })
    }

    /// The base head just crossed a run boundary: drop the layer 0 node that
    /// summarized the consumed run, cascading upward while each discarded
    /// node sits exactly at its own layer's boundary.
    fn discard_index_after_dequeue(&mut self, consumed: &SlotPos) {
        let mut removed: Option<NonNull<SkipNode>> = None;

        for (i, layer) in self.layers.iter_mut().enumerate() {
            let matches = match &layer.head {
                None => false,
                Some(head) => {
                    if i == 0 {
                        head.last_down.is_task(consumed)
                    } else {
                        // `removed` is dangling here; compared by identity
                        // only, never dereferenced.
                        removed.is_some_and(|prev| head.last_down.is_node(prev))
                    }
                }
            };
            if !matches {
                break;
            }

            let head_ptr = NonNull::from(&**layer.head.as_ref().expect("matched above"));
            if layer.candidate == Some(head_ptr) {
                layer.candidate = None;
            }
            layer.pop_head();
            layer.head_off += 1;

            if layer.head_off % SKIP_GAP != 0 {
                break;
            }
            removed = Some(head_ptr);
        }
    }

    /// Detaches the oldest ~half of the queue in original order. Returns
    /// `None` when fewer than two tasks are queued.
    pub(crate) fn split_half(&mut self) -> Option<SkipQueue> {
        if self.len() < 2 {
            return None;
        }

        // Highest layer able to anchor a split. Layers holding one node
        // cannot, and would go stale once the lower prefixes move, so they
        // are cleared on the way down.
        let mut split_layer = None;
        for i in (0..INDEX_LAYERS).rev() {
            match self.layers[i].len() {
                0 => {}
                1 => self.layers[i].clear(),
                _ => {
                    split_layer = Some(i);
                    break;
                }
            }
        }

        Some(match split_layer {
            Some(layer) => self.split_indexed(layer),
            None => self.split_base(),
        })
    }

    /// Walks the base list directly; only reached when no index layer holds
    /// two nodes, so the walk is bounded by ~2 runs.
    fn split_base(&mut self) -> SkipQueue {
        let total = self.tail_off - self.head_off;
        let give = total.div_ceil(2);
        debug_assert!(give >= 1 && give < total);

        let mut last = self.head.clone().expect("non-empty queue");
        let mut candidate_given = self.candidate.as_ref() == Some(&last);
        for _ in 1..give {
            last = unsafe { last.task().link_clone() }.expect("base list shorter than offsets");
            if self.candidate.as_ref() == Some(&last) {
                candidate_given = true;
            }
        }

        let mut other = SkipQueue::new();
        other.head = self.head.take();
        self.head = unsafe { last.task().link_take() };
        debug_assert!(self.head.is_some());
        other.tail = Some(last);
        other.head_off = self.head_off;
        other.tail_off = self.head_off + give;
        self.head_off += give;
        if candidate_given {
            other.candidate = self.candidate.take();
        }
        other
    }

    /// Splits at `top`, the highest layer with at least two index nodes,
    /// detaching the matching prefix of every layer below in one descent.
    fn split_indexed(&mut self, top: usize) -> SkipQueue {
        let mut other = SkipQueue::new();
        let mut give = self.layers[top].len().div_ceil(2);

        // Only the top layer's cut is not run-aligned, so its candidate can
        // fall inside the moved prefix; every lower cut ends exactly at a run
        // boundary, below which candidates always sit.
        {
            let layer = &mut self.layers[top];
            let run_start = layer.tail_off - layer.tail_off % SKIP_GAP;
            if layer.candidate.is_some() && run_start < layer.head_off + give {
                other.layers[top].candidate = layer.candidate.take();
            }
        }

        // Boundary node: the last index node moving to the detached queue.
        let mut cur = NonNull::from(&mut **self.layers[top].head.as_mut().expect("len >= 2"));
        for _ in 1..give {
            cur = NonNull::from(&mut **unsafe {
                cur.as_mut()
                    .next
                    .as_mut()
                    .expect("index layer shorter than offsets")
            });
        }

        for i in (0..=top).rev() {
            let layer = &mut self.layers[i];
            let remainder = unsafe { cur.as_mut() }.next.take();

            other.layers[i].head = layer.head.take();
            other.layers[i].tail = Some(cur);
            other.layers[i].head_off = layer.head_off;
            other.layers[i].tail_off = layer.head_off + give;
            // The retained candidate sits in the tail run, which never moves.

            layer.head = remainder;
            debug_assert!(layer.head.is_some(), "split gave away a whole layer");
            layer.head_off += give;

            if i > 0 {
                // Below, the first `head_off % gap` elements of the oldest
                // run were already consumed.
                let lower_partial = self.layers[i - 1].head_off % SKIP_GAP;
                give = give * SKIP_GAP - lower_partial;
                cur = unsafe { cur.as_ref() }.last_down.as_node();
            } else {
                let base_partial = self.head_off % SKIP_GAP;
                let base_give = give * SKIP_GAP - base_partial;
                let last = unsafe { cur.as_ref() }.last_down.as_task().clone();

                other.head = self.head.take();
                self.head = unsafe { last.task().link_take() };
                debug_assert!(self.head.is_some(), "split gave away the whole base list");
                other.tail = Some(last);
                other.head_off = self.head_off;
                other.tail_off = self.head_off + base_give;
                self.head_off += base_give;
            }
        }
        other
    }

    /// Adopts `other`'s entire contents in O(1). The receiver must be empty.
    pub(crate) fn replace(&mut self, other: &mut SkipQueue) {
        debug_assert!(self.is_empty(), "replacing a non-empty queue");
        mem::swap(self, other);
    }
}

impl Default for SkipQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SkipQueue {
    fn drop(&mut self) {
        let mut cur = self.head.take();
        while let Some(pos) = cur {
            let task = unsafe { TaskRef::from_owned_pos(pos) };
            cur = unsafe { task.link_take() };
            drop(task);
        }
        self.tail = None;
        self.candidate = None;
    }
}

impl fmt::Debug for SkipQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipQueue")
            .field("len", &self.len())
            .field("head_off", &self.head_off)
            .field("tail_off", &self.tail_off)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{ArenaConfig, TaskAllocator};
    use crate::task::{Id, Task, TaskRef};
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;

    assert_impl_all!(SkipQueue: Send);

    struct Fixture {
        allocator: Arc<TaskAllocator>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                allocator: TaskAllocator::new(1, ArenaConfig::default()),
            }
        }

        fn task(&self) -> TaskRef {
            TaskRef::allocate(self.allocator.pool(0), Task::new(Box::new(|| {}), true))
        }

        fn fill(&self, queue: &mut SkipQueue, n: usize) -> Vec<Id> {
            (0..n)
                .map(|_| {
                    let task = self.task();
                    let id = task.id();
                    queue.enqueue(task);
                    id
                })
                .collect()
        }
    }

    fn drain(queue: &mut SkipQueue) -> Vec<Id> {
        let mut ids = Vec::with_capacity(queue.len());
        while let Some(task) = queue.dequeue() {
            ids.push(task.id());
        }
        assert!(queue.is_empty());
        ids
    }

    #[rstest]
    #[case::tiny(3)]
    #[case::one_run(64)]
    #[case::run_plus_one(65)]
    #[case::many_runs(10_000)]
    fn fifo_round_trip(#[case] n: usize) {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();

        let expected = fx.fill(&mut queue, n);
        assert_eq!(queue.len(), n);
        assert_eq!(drain(&mut queue), expected);
    }

    #[test]
    fn dequeue_empty_returns_none() {
        let mut queue = SkipQueue::new();
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn interleaved_enqueue_dequeue_crosses_boundaries() {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();
        let mut expected = std::collections::VecDeque::new();

        for round in 0..5 {
            for id in fx.fill(&mut queue, 100 + round) {
                expected.push_back(id);
            }
            for _ in 0..70 {
                let task = queue.dequeue().expect("queue holds tasks");
                assert_eq!(Some(task.id()), expected.pop_front());
            }
        }

        assert_eq!(drain(&mut queue), Vec::from(expected));
    }

    #[test]
    fn regrows_after_full_drain() {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();

        fx.fill(&mut queue, 10);
        drain(&mut queue);

        // Offsets keep counting; runs stay aligned after the restart.
        let expected = fx.fill(&mut queue, 500);
        assert_eq!(drain(&mut queue), expected);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::single(1)]
    fn split_needs_two_tasks(#[case] n: usize) {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();
        fx.fill(&mut queue, n);
        assert!(queue.split_half().is_none());
        assert_eq!(queue.len(), n);
    }

    #[rstest]
    #[case::two(2)]
    #[case::odd(7)]
    #[case::sub_run(63)]
    #[case::past_one_run(100)]
    fn raw_split_gives_away_oldest_half_exactly(#[case] n: usize) {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();
        let expected = fx.fill(&mut queue, n);

        let mut stolen = queue.split_half().expect("splittable");
        let give = n.div_ceil(2);
        assert_eq!(stolen.len(), give);
        assert_eq!(queue.len(), n - give);

        assert_eq!(drain(&mut stolen), &expected[..give]);
        assert_eq!(drain(&mut queue), &expected[give..]);
    }

    #[rstest]
    #[case::layer0_split(1_000)]
    #[case::layer1_split(10_000)]
    #[case::uneven(69_819)]
    fn indexed_split_partitions_in_order(#[case] n: usize) {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();
        let expected = fx.fill(&mut queue, n);

        let mut stolen = queue.split_half().expect("splittable");
        let give = stolen.len();
        assert_eq!(give + queue.len(), n);
        // An indexed split lands close to half; the tail run and the layer
        // rounding bound the skew.
        assert!(give >= n / 4 && give <= 3 * n / 4, "skewed split: {give}/{n}");

        assert_eq!(drain(&mut stolen), &expected[..give]);
        assert_eq!(drain(&mut queue), &expected[give..]);
    }

    #[test]
    fn split_after_partial_drain() {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();
        let expected = fx.fill(&mut queue, 1_000);

        for id in &expected[..333] {
            assert_eq!(queue.dequeue().expect("non-empty").id(), *id);
        }

        let mut stolen = queue.split_half().expect("splittable");
        let give = stolen.len();
        assert_eq!(give + queue.len(), 667);

        assert_eq!(drain(&mut stolen), &expected[333..333 + give]);
        assert_eq!(drain(&mut queue), &expected[333 + give..]);
    }

    #[test]
    fn repeated_splits_preserve_global_order() {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();
        let expected = fx.fill(&mut queue, 69_819);

        let mut first = queue.split_half().expect("splittable");
        let mut second = queue.split_half().expect("splittable");
        let mut third = queue.split_half().expect("splittable");

        let mut all = drain(&mut first);
        all.extend(drain(&mut second));
        all.extend(drain(&mut third));
        all.extend(drain(&mut queue));
        assert_eq!(all, expected);
    }

    #[test]
    fn replace_adopts_stolen_queue() {
        let fx = Fixture::new();
        let mut victim = SkipQueue::new();
        let expected = fx.fill(&mut victim, 100);

        let mut stolen = victim.split_half().expect("splittable");
        let mut local = SkipQueue::new();
        local.replace(&mut stolen);
        assert!(stolen.is_empty());
        assert_eq!(local.len(), 50);

        // The adopted queue keeps working as a normal run queue.
        let extra = fx.fill(&mut local, 200);

        let mut got = drain(&mut local);
        let mut want: Vec<Id> = expected[..50].to_vec();
        want.extend(extra);
        assert_eq!(got, want);

        got = drain(&mut victim);
        assert_eq!(got, &expected[50..]);
    }

    #[test]
    fn split_usable_after_steal_both_sides() {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();
        fx.fill(&mut queue, 5_000);

        let mut stolen = queue.split_half().expect("splittable");

        // Both halves must keep full queue semantics: grow, index, split
        // again.
        fx.fill(&mut stolen, 3_000);
        fx.fill(&mut queue, 3_000);
        let total = stolen.len() + queue.len();

        let mut restolen = stolen.split_half().expect("splittable");
        assert_eq!(restolen.len() + stolen.len() + queue.len(), total);

        drain(&mut restolen);
        drain(&mut stolen);
        drain(&mut queue);
    }

    #[test]
    fn drop_releases_queued_tasks() {
        let fx = Fixture::new();
        let mut queue = SkipQueue::new();
        fx.fill(&mut queue, 300);
        drop(queue);

        fx.allocator.flush_all();
        assert_eq!(fx.allocator.pool(0).live(), 0);
    }
}
