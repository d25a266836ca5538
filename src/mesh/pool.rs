//! Thread-pool synchronization, work-stealing queues, and object recycling
use crossbeam_queue::SegQueue;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Stores data used to synchronize a group of worker threads
///
/// The shared counter is split into three fields:
/// - bits 16+ count in-flight cross-thread messages
/// - bits 8-15 count sleeping workers
/// - bits 0-7 count workers that have registered at startup
pub struct ThreadPool {
    threads: std::sync::RwLock<Vec<std::thread::Thread>>,
    counter: AtomicUsize,
}

impl ThreadPool {
    /// Builds thread pool storage for `n` threads
    pub fn new(n: usize) -> Self {
        Self {
            threads: std::sync::RwLock::new(vec![std::thread::current(); n]),
            counter: AtomicUsize::new(0),
        }
    }

    /// Builds a [`ThreadContext`] for the given thread
    ///
    /// This must be called from the worker thread itself, which must be
    /// different from the thread that constructed the pool.
    ///
    /// # Panics
    /// If `index` exceeds the `n` used in the constructor, or if this is
    /// called from the thread that built the pool.
    pub fn start(&self, index: usize) -> ThreadContext {
        let mut w = self.threads.write().unwrap();
        let thread_count = w.len();
        assert!(index < thread_count);

        let my_thread = std::thread::current();
        assert_ne!(my_thread.id(), w[index].id());

        w[index] = my_thread;
        self.counter.fetch_add(1, Ordering::Release);

        // Wake all of the other workers; if everyone has registered
        // themselves, then the startup count is at thread_count and everyone
        // will continue.
        for (i, t) in w.iter().enumerate() {
            if i != index {
                t.unpark();
            }
        }
        drop(w);

        // Wait until every thread has installed itself into the array
        while self.counter.load(Ordering::Acquire) & 0xFF < thread_count {
            std::thread::park();
        }

        let threads = self.threads.read().unwrap();
        ThreadContext {
            threads,
            counter: &self.counter,
            index,
        }
    }
}

/// Local context for a thread operating within a pool
pub struct ThreadContext<'a> {
    threads: std::sync::RwLockReadGuard<'a, Vec<std::thread::Thread>>,
    counter: &'a AtomicUsize,
    index: usize,
}

impl ThreadContext<'_> {
    fn done(&self, c: usize) -> bool {
        (c >> 16) == 0 && (c >> 8) & 0xFF == self.threads.len()
    }

    /// If some threads in the pool are sleeping, wakes them up
    ///
    /// This function should be called when work is available.
    pub fn wake(&self) {
        if (self.counter.load(Ordering::Acquire) >> 8) & 0xFF != 0 {
            for (i, t) in self.threads.iter().enumerate() {
                if i != self.index {
                    t.unpark();
                }
            }
        }
    }

    /// Wakes a single thread from the pool
    ///
    /// # Panics
    /// If this is called by a thread to wake itself
    pub fn wake_one(&self, i: usize) {
        assert_ne!(i, self.index);
        self.threads[i].unpark();
    }

    /// Records that a piece of data has been sent to another thread
    ///
    /// Cross-thread messages go over MPSC queues, which the pool cannot see;
    /// without this accounting, the sender could observe every thread asleep
    /// and exit while the receiver still has data to process.
    pub fn pushed(&self) {
        self.counter.fetch_add(1 << 16, Ordering::Release);
    }

    /// Records that a piece of data recorded with [`Self::pushed`] has been
    /// received
    pub fn popped(&self) {
        self.counter.fetch_sub(1 << 16, Ordering::Release);
    }

    /// Sends the given thread to sleep
    ///
    /// Returns `true` if the thread should continue running; `false` if all
    /// threads in the pool are asleep with no messages in flight, indicating
    /// that all work is done.
    pub fn sleep(&mut self) -> bool {
        let c = self.counter.fetch_add(1 << 8, Ordering::Release) + (1 << 8);

        let mut done = self.done(c);
        if done {
            // Wake up the other threads, so they notice that we're done
            for (i, t) in self.threads.iter().enumerate() {
                if i != self.index {
                    t.unpark();
                }
            }
        } else {
            // There are other active threads, so park ourselves and wait for
            // someone else to wake us up.
            std::thread::park();
            done = self.done(self.counter.load(Ordering::Acquire));
        }

        if !done {
            // Back to the grind
            self.counter.fetch_sub(1 << 8, Ordering::Release);
        }
        !done
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Work-stealing queue for use in a thread pool
///
/// This queue contains a local queue plus references to other threads'
/// queues, so that we can steal items if our queue runs dry.
pub struct QueuePool<T> {
    /// Our personal queue of tasks to complete
    ///
    /// Other threads may steal from this queue!
    queue: crossbeam_deque::Worker<T>,

    /// Queues from which we can steal other workers' tasks
    ///
    /// Our own queue is at index `self.index` in this list and is skipped
    /// when attempting to steal an item.
    friend_queue: Vec<crossbeam_deque::Stealer<T>>,

    /// Marks whether the queue has received new items since the last `pop`
    changed: bool,

    /// Index of this queue within the pool
    index: usize,
}

impl<T> QueuePool<T> {
    /// Builds a new set of queues for `n` threads
    pub fn new(n: usize) -> Vec<Self> {
        let task_queues = (0..n)
            .map(|_| crossbeam_deque::Worker::<T>::new_lifo())
            .collect::<Vec<_>>();

        let stealers =
            task_queues.iter().map(|t| t.stealer()).collect::<Vec<_>>();

        task_queues
            .into_iter()
            .enumerate()
            .map(|(index, queue)| Self {
                queue,
                friend_queue: stealers.clone(),
                changed: false,
                index,
            })
            .collect()
    }

    /// Pops an item from this queue or steals from another
    pub fn pop(&mut self) -> Option<T> {
        self.changed = false;
        self.queue.pop().or_else(|| {
            use crossbeam_deque::Steal;
            for i in 1..self.friend_queue.len() {
                let i = (i + self.index) % self.friend_queue.len();
                let q = &self.friend_queue[i];
                loop {
                    match q.steal() {
                        Steal::Success(v) => return Some(v),
                        Steal::Empty => break,
                        Steal::Retry => continue,
                    }
                }
            }
            None
        })
    }

    /// Pushes an item to this queue, setting `self.changed` to true
    pub fn push(&mut self, t: T) {
        self.queue.push(t);
        self.changed = true;
    }

    /// Returns whether items have been pushed since the last call to `pop`
    pub fn changed(&self) -> bool {
        self.changed
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Values which can be recycled through an [`ObjectPool`]
pub trait Reclaim {
    /// Resets the value for reuse, retaining its allocations
    fn reclaim(&mut self);
}

/// Lock-free recycling of costly allocations across worker threads
///
/// Each worker owns one pool from a group.  Gets and puts go through a
/// per-thread bucket (plain `Vec` operations, wait-free); the bucket spills
/// into a free-list shared by the whole group, so allocations released by one
/// worker (e.g. leaves freed during a collapse) can be claimed by another.
pub struct ObjectPool<T> {
    local: Vec<T>,
    shared: Arc<SegQueue<T>>,
}

/// Maximum number of objects kept in a per-thread bucket
const BUCKET_SIZE: usize = 64;

impl<T: Default + Reclaim> ObjectPool<T> {
    /// Builds a group of `n` pools backed by one shared free-list
    pub fn new_group(n: usize) -> Vec<Self> {
        let shared = Arc::new(SegQueue::new());
        (0..n)
            .map(|_| Self {
                local: vec![],
                shared: shared.clone(),
            })
            .collect()
    }

    /// Claims an object, allocating a fresh one only if every free-list is
    /// empty
    pub fn get(&mut self) -> T {
        self.local
            .pop()
            .or_else(|| self.shared.pop())
            .unwrap_or_default()
    }

    /// Releases an object back to the pool
    pub fn put(&mut self, mut t: T) {
        t.reclaim();
        if self.local.len() < BUCKET_SIZE {
            self.local.push(t);
        } else {
            self.shared.push(t);
        }
    }
}

impl<T: Default + Reclaim> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new_group(1).pop().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn queue_pool() {
        let mut queues = QueuePool::new(2);
        let mut counters = [0i32; 2];
        const DEPTH: usize = 5;
        queues[0].push(DEPTH);

        // Confirm that stealing leads to shared work between two threads
        std::thread::scope(|s| {
            for (q, c) in queues.iter_mut().zip(counters.iter_mut()) {
                s.spawn(|| {
                    while let Some(i) = q.pop() {
                        *c += 1;
                        if i != 0 {
                            q.push(i - 1);
                            q.push(i - 1);
                        }
                        std::thread::sleep(std::time::Duration::from_millis(
                            1,
                        ));
                    }
                });
            }
        });
        assert_eq!(
            counters[0] + counters[1],
            (1 << (DEPTH + 1)) - 1,
            "threads did not complete all work"
        );
    }

    #[test]
    fn thread_ctx() {
        const N: usize = 8;
        let pool = &ThreadPool::new(N);
        let done = &AtomicUsize::new(0);

        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(std::time::Duration::from_millis(500));
                if done.load(Ordering::Acquire) != N {
                    panic!("deadlock in `thread_ctx` test; aborting");
                }
            });
            for i in 0..N {
                s.spawn(move || {
                    let mut ctx = pool.start(i);
                    let t = std::time::Duration::from_millis(1);
                    for _ in 0..i {
                        std::thread::sleep(t);
                        ctx.wake();
                    }
                    while ctx.sleep() {
                        // Loop until everyone is done
                    }
                    done.fetch_add(1, Ordering::Release);
                });
            }
        });
        assert_eq!(done.load(Ordering::Acquire), N);
    }

    #[derive(Default)]
    struct Buffer(Vec<u8>);
    impl Reclaim for Buffer {
        fn reclaim(&mut self) {
            self.0.clear();
        }
    }

    #[test]
    fn object_pool() {
        let mut pools = ObjectPool::<Buffer>::new_group(2);
        let mut b = pools[0].get();
        b.0.extend_from_slice(&[1, 2, 3]);
        let capacity = b.0.capacity();
        pools[0].put(b);

        // The recycled buffer comes back cleared, with storage intact
        let b = pools[0].get();
        assert!(b.0.is_empty());
        assert_eq!(b.0.capacity(), capacity);

        // Fill the local bucket, then spill one marked object; the other
        // pool in the group should be able to claim it
        for _ in 0..BUCKET_SIZE {
            pools[0].put(Buffer::default());
        }
        let mut spilled = Buffer::default();
        spilled.0.reserve(128);
        pools[0].put(spilled);
        assert!(pools[1].get().0.capacity() >= 128);
    }
}
