//! Multithreaded octree construction
//!
//! Each worker owns a work-stealing queue of subdivision tasks, an octree
//! fragment, and a thread-local [`Evaluator`].  A task subdivides one cell
//! into a cluster of eight children; children that must recurse become new
//! tasks (which other workers may steal), and completed clusters flow back
//! to the worker owning the parent cell over MPSC channels.  Collapsed leaf
//! payloads travel inside the completion message, so leaf data always lands
//! in the arena of the worker that owns the enclosing cluster.
use std::sync::{mpsc::TryRecvError, Arc};

use super::{
    cell::{Cell, CellData, CellIndex},
    octree::{BranchResult, CellResult, DcLeaf, Octree, OctreeBuilder},
    pool::{ObjectPool, QueuePool, ThreadContext, ThreadPool},
    types::Corner,
    Settings,
};
use crate::{eval::Evaluator, tape::Tape};

/// A chunk of work: subdivide `parent` and evaluate its eight children
///
/// Tasks form a chain through `next`, mirroring the path from the root;
/// completion walks back along this chain.
#[derive(Clone)]
struct Task {
    data: Arc<TaskData>,
}

impl std::ops::Deref for Task {
    type Target = TaskData;
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl Task {
    /// Builds the root task (always owned by worker 0)
    fn new(tape: Tape, parent: CellIndex) -> Self {
        Self {
            data: Arc::new(TaskData {
                tape,
                parent,
                source: 0,
                next: None,
            }),
        }
    }

    fn next(&self, tape: Tape, parent: CellIndex, source: usize) -> Self {
        Self {
            data: Arc::new(TaskData {
                tape,
                parent,
                source,
                next: Some(self.data.clone()),
            }),
        }
    }

    /// Recycles tape storage along the task chain, where we are the last
    /// owner
    fn release(self, eval: &mut Evaluator) {
        if let Ok(mut t) = Arc::try_unwrap(self.data) {
            loop {
                eval.recycle_tape(t.tape);
                if let Some(next) =
                    t.next.and_then(|n| Arc::try_unwrap(n).ok())
                {
                    t = next;
                } else {
                    break;
                }
            }
        }
    }
}

struct TaskData {
    /// Region-shortened tape for this subtree
    tape: Tape,

    /// Parent cell, whose children are being evaluated
    parent: CellIndex,

    /// Worker in whose octree the parent cell lives
    source: usize,

    next: Option<Arc<TaskData>>,
}

/// Payload of a completed cluster, sent back to the parent cell's owner
enum DoneCell {
    /// Terminal or branch cell, recorded as-is
    Cell(CellData),

    /// The cluster collapsed into a leaf; the receiver stores the payload
    /// in its own arena
    Leaf(Box<DcLeaf>),
}

struct Done {
    /// The task whose cluster has finished
    task: Task,

    /// The resulting cell
    cell: DoneCell,
}

pub(crate) struct OctreeWorker {
    /// Global index of this worker thread
    thread_index: usize,

    /// Octree fragment under construction
    ///
    /// Worker 0 owns the root; other workers hold branches that reference
    /// each other through thread-tagged branch cells until the final merge.
    octree: OctreeBuilder,

    /// Thread-local evaluator bundle
    eval: Evaluator,

    /// Incoming completed clusters from other threads
    done: std::sync::mpsc::Receiver<Done>,

    /// Queues for returning completed clusters, one per worker
    friend_done: Vec<std::sync::mpsc::Sender<Done>>,

    /// Our queue of tasks, with stealers for the other workers
    queue: QueuePool<Task>,
}

impl OctreeWorker {
    pub(crate) fn scheduler(tape: &Tape, settings: &Settings) -> Octree {
        let threads = settings.threads as usize;
        let task_queues = QueuePool::new(threads);
        let done_queues = std::iter::repeat_with(std::sync::mpsc::channel)
            .take(threads)
            .collect::<Vec<_>>();
        let friend_done =
            done_queues.iter().map(|t| t.0.clone()).collect::<Vec<_>>();
        let leaf_pools = ObjectPool::new_group(threads);

        let mut workers = task_queues
            .into_iter()
            .zip(done_queues.into_iter().map(|t| t.1))
            .zip(leaf_pools)
            .enumerate()
            .map(|(thread_index, ((queue, done), pool))| {
                let mut eval = Evaluator::new(tape);
                eval.apply_vars(&settings.vars);
                OctreeWorker {
                    thread_index,
                    octree: if thread_index == 0 {
                        OctreeBuilder::new(pool)
                    } else {
                        OctreeBuilder::empty(pool)
                    },
                    eval,
                    queue,
                    done,
                    friend_done: friend_done.clone(),
                }
            })
            .collect::<Vec<_>>();

        // Evaluate the root by hand; if it's resolved immediately, then
        // there's no multithreaded work to do.
        let root = CellIndex::root(settings.bounds);
        let w0 = &mut workers[0];
        match w0.octree.eval_cell(&mut w0.eval, tape, root, settings) {
            CellResult::Done(c) => {
                w0.octree.record(0, c.into());
                let w0 = workers.swap_remove(0);
                return Octree::merge(vec![w0.octree]);
            }
            CellResult::Recurse(sub) => {
                w0.queue.push(Task::new(sub, root));
            }
        }

        let pool = &ThreadPool::new(threads);
        let out: Vec<OctreeBuilder> = std::thread::scope(|s| {
            let mut handles = vec![];
            for w in workers {
                handles.push(s.spawn(move || w.run(pool, settings)));
            }
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        Octree::merge(out)
    }

    /// Runs a single worker to completion as part of a worker group
    fn run(
        mut self,
        threads: &ThreadPool,
        settings: &Settings,
    ) -> OctreeBuilder {
        let mut ctx = threads.start(self.thread_index);

        loop {
            // First, check whether anyone has finished a cluster and sent
            // back the result
            match self.done.try_recv() {
                Ok(v) => {
                    ctx.popped();
                    if !settings.cancel.is_cancelled() {
                        let cell = match v.cell {
                            DoneCell::Cell(c) => c,
                            DoneCell::Leaf(leaf) => {
                                self.octree.store_leaf(*leaf).into()
                            }
                        };
                        self.record(
                            v.task.parent.index,
                            cell,
                            v.task.next.as_ref(),
                            settings,
                            &mut ctx,
                        );
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => panic!(),
                Err(TryRecvError::Empty) => {
                    // nothing to do here
                }
            }

            if let Some(task) = self.queue.pop() {
                // Cancellation is polled at task granularity; a cancelled
                // run drains its queues without doing any work.
                if !settings.cancel.is_cancelled() {
                    // Each task represents 8 cells, allocated locally
                    let index = self.octree.cells.len();
                    for _ in Corner::iter() {
                        self.octree.cells.push(Cell::Invalid.into());
                    }

                    for i in Corner::iter() {
                        let sub_cell = task.parent.child(index, i);
                        match self.octree.eval_cell(
                            &mut self.eval,
                            &task.tape,
                            sub_cell,
                            settings,
                        ) {
                            CellResult::Done(c) => self.record(
                                sub_cell.index,
                                c.into(),
                                Some(&task.data),
                                settings,
                                &mut ctx,
                            ),
                            CellResult::Recurse(sub) => {
                                self.queue.push(task.next(
                                    sub,
                                    sub_cell,
                                    self.thread_index,
                                ));
                            }
                        }
                    }
                }

                // If we pushed anything to our queue, then let other
                // threads wake up to try stealing tasks; otherwise, try to
                // recycle tape storage.
                if self.queue.changed() {
                    ctx.wake();
                } else {
                    task.release(&mut self.eval);
                }
                continue;
            }

            if !ctx.sleep() {
                break;
            }
        }

        // At this point, the `done` queue should be flushed
        assert_eq!(self.done.try_recv().err(), Some(TryRecvError::Empty));

        self.octree
    }

    /// Records a cell and recursively collects finished clusters
    ///
    /// `task` is the task whose cluster contains the recorded cell (absent
    /// only for the root).  Results for clusters whose parent lives on
    /// another thread are sent back over the wire.
    fn record(
        &mut self,
        index: usize,
        cell: CellData,
        task: Option<&Arc<TaskData>>,
        settings: &Settings,
        ctx: &mut ThreadContext,
    ) {
        self.octree.record(index, cell);
        let Some(task) = task else {
            // The root has no enclosing cluster
            return;
        };

        let cluster = index & !7;
        let Some(r) = self.octree.collect_children(
            task.parent,
            cluster,
            settings.max_err,
        ) else {
            return;
        };

        if task.source == self.thread_index {
            // Store the result locally, recursing up
            let c = self.octree.apply_branch_result(
                r,
                cluster,
                self.thread_index as u8,
            );
            self.record(
                task.parent.index,
                c.into(),
                task.next.as_ref(),
                settings,
                ctx,
            );
        } else {
            // Send the result back to the cluster's owner
            let cell = match r {
                BranchResult::Leaf(leaf) => {
                    self.octree.free_cluster(cluster);
                    DoneCell::Leaf(Box::new(leaf))
                }
                r => DoneCell::Cell(
                    self.octree
                        .apply_branch_result(
                            r,
                            cluster,
                            self.thread_index as u8,
                        )
                        .into(),
                ),
            };
            ctx.pushed();
            self.friend_done[task.source]
                .send(Done {
                    task: Task {
                        data: task.clone(),
                    },
                    cell,
                })
                .unwrap();
            ctx.wake_one(task.source);
        }
    }
}
