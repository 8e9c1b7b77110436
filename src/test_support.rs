//! Общие проверки контракта `ConcurrentStack`, которые гоняются для обеих реализаций.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use crate::ConcurrentStack;

const LIVE: u64 = 0x5AFE_5AFE_5AFE_5AFE;
const DEAD: u64 = 0xDEAD_DEAD_DEAD_DEAD;

struct Counters {
    created: AtomicUsize,
    dropped: AtomicUsize,
    dropped_ids: Vec<AtomicBool>,
}

/// Считает созданные и уничтоженные `Tracked` и ловит повторный drop одного и того же id.
#[derive(Clone)]
pub struct DropTracker {
    counters: Arc<Counters>,
}

impl DropTracker {
    /// `capacity` — сколько разных id можно выдать (0..capacity).
    pub fn new(capacity: usize) -> Self {
        DropTracker {
            counters: Arc::new(Counters {
                created: AtomicUsize::new(0),
                dropped: AtomicUsize::new(0),
                dropped_ids: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            }),
        }
    }

    pub fn track(&self, id: usize) -> Tracked {
        assert!(id < self.counters.dropped_ids.len(), "id {} out of range", id);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        Tracked {
            id,
            canary: LIVE,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> usize {
        self.counters.dropped.load(Ordering::Acquire)
    }
}

/// Значение-«датчик»: деструктор должен сработать ровно один раз,
/// а после него к значению нельзя обращаться.
pub struct Tracked {
    id: usize,
    canary: u64,
    counters: Arc<Counters>,
}

impl Tracked {
    pub fn id(&self) -> usize {
        assert_eq!(self.canary, LIVE, "use after drop of id {}", self.id);
        self.id
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        assert_eq!(self.canary, LIVE, "double drop of id {}", self.id);
        self.canary = DEAD;
        let already = self.counters.dropped_ids[self.id].swap(true, Ordering::AcqRel);
        assert!(!already, "id {} dropped twice", self.id);
        self.counters.dropped.fetch_add(1, Ordering::Release);
    }
}

/// Однопоточный контракт: пустой стек, LIFO-порядок, `is_empty`.
pub fn check_contract<S, F>(make: F)
where
    S: ConcurrentStack<i32>,
    F: Fn() -> S,
{
    let stack = make();
    assert!(stack.is_empty());
    assert_eq!(stack.pop(), None);

    stack.push(1);
    assert!(!stack.is_empty());
    assert_eq!(stack.pop(), Some(1));
    assert!(stack.is_empty());

    for i in 0..100 {
        stack.push(i);
    }
    for i in (0..100).rev() {
        assert_eq!(stack.pop(), Some(i));
    }
    assert_eq!(stack.pop(), None);

    // Чередование push/pop сохраняет LIFO
    stack.push(1);
    stack.push(2);
    assert_eq!(stack.pop(), Some(2));
    stack.push(3);
    assert_eq!(stack.pop(), Some(3));
    assert_eq!(stack.pop(), Some(1));
    assert_eq!(stack.pop(), None);
}

/// M потоков кладут непересекающиеся наборы по K значений, затем все вместе вычерпывают стек.
/// Мультимножество снятых значений должно совпасть с положенным.
pub fn check_no_lost_values<S, F>(make: F, threads: usize, per_thread: usize)
where
    S: ConcurrentStack<usize> + 'static,
    F: Fn() -> S,
{
    let stack = Arc::new(make());
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let stack = Arc::clone(&stack);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                for i in 0..per_thread {
                    stack.push(t * per_thread + i);
                }
                // Вычерпываем только после того, как все закончили писать
                barrier.wait();
                let mut popped = Vec::new();
                while let Some(value) = stack.pop() {
                    popped.push(value);
                }
                popped
            })
        })
        .collect();

    let mut all = Vec::with_capacity(threads * per_thread);
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    all.sort_unstable();

    assert_eq!(all.len(), threads * per_thread);
    assert!(all.iter().copied().eq(0..threads * per_thread));
    assert!(stack.is_empty());
}

/// Смесь push / pop / pop на пустом стеке из нескольких потоков.
/// Каждое значение должно быть уничтожено ровно один раз и никогда не читаться после drop.
pub fn check_drops_exactly_once<S, F>(make: F, threads: usize, ops_per_thread: usize)
where
    S: ConcurrentStack<Tracked> + 'static,
    F: Fn() -> S,
{
    let stack = Arc::new(make());
    let tracker = DropTracker::new(threads * ops_per_thread);
    let pushed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let stack = Arc::clone(&stack);
            let tracker = tracker.clone();
            let pushed = Arc::clone(&pushed);
            thread::spawn(move || {
                let base = t * ops_per_thread;
                // На каждые 2 push приходится 3 pop, так что стек часто пустеет
                for i in 0..ops_per_thread {
                    if i % 5 < 2 {
                        stack.push(tracker.track(base + i));
                        pushed.fetch_add(1, Ordering::Relaxed);
                    } else if let Some(value) = stack.pop() {
                        assert!(value.id() < tracker.counters.dropped_ids.len());
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    while let Some(value) = stack.pop() {
        let _ = value.id();
    }

    let pushed = pushed.load(Ordering::Relaxed);
    assert_eq!(tracker.created(), pushed);
    assert_eq!(tracker.dropped(), pushed);
}

/// Асинхронные производители и потребители поверх tokio.
pub async fn check_async_producers_consumers<S>(stack: Arc<S>)
where
    S: ConcurrentStack<usize> + 'static,
{
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 250;
    const TOTAL: usize = PRODUCERS * PER_PRODUCER;

    let barrier = Arc::new(tokio::sync::Barrier::new(PRODUCERS + 1));
    let mut producers = vec![];

    for p in 0..PRODUCERS {
        let stack = Arc::clone(&stack);
        let barrier = Arc::clone(&barrier);
        producers.push(tokio::spawn(async move {
            barrier.wait().await; // Все задачи стартуют одновременно
            for i in 0..PER_PRODUCER {
                stack.push(p * PER_PRODUCER + i);
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let reader_stack = Arc::clone(&stack);
    let reader_barrier = Arc::clone(&barrier);
    let reader = tokio::spawn(async move {
        reader_barrier.wait().await;
        let mut results = Vec::with_capacity(TOTAL);
        while results.len() < TOTAL {
            match reader_stack.pop() {
                Some(value) => results.push(value),
                // Стек пуст: уступаем выполнение писателям
                None => tokio::task::yield_now().await,
            }
        }
        results
    });

    for producer in producers {
        producer.await.unwrap();
    }
    let mut results = reader.await.unwrap();
    results.sort_unstable();

    assert_eq!(results, (0..TOTAL).collect::<Vec<_>>());
    assert!(stack.is_empty());
}
