use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{ConcurrentStack, HazardPointerStack, RefCountedStack};

/// Параметры нагрузки для сравнения стеков.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workload {
    pub threads: usize,
    /// Сколько пар push + pop делает каждый поток.
    pub operations_per_thread: usize,
}

impl Default for Workload {
    fn default() -> Self {
        Workload {
            threads: 4,
            operations_per_thread: 100_000,
        }
    }
}

/// Время выполнения одной и той же нагрузки на каждой реализации.
#[derive(Debug, Clone, Copy)]
pub struct ComparisonReport {
    pub mutex: Duration,
    pub ref_counted: Duration,
    pub hazard_pointer: Duration,
}

impl ComparisonReport {
    pub fn print(&self) {
        println!("\n########################################################");
        println!("Mutex<Vec>:          {:?}", self.mutex);
        println!("Split ref counting:  {:?}", self.ref_counted);
        println!("Hazard pointers:     {:?}", self.hazard_pointer);
        println!("########################################################");
    }
}

/// Стек под мьютексом — точка отсчёта для lock-free реализаций.
struct MutexStack<T> {
    items: Mutex<Vec<T>>,
}

impl<T: Send> ConcurrentStack<T> for MutexStack<T> {
    fn push(&self, value: T) {
        self.items.lock().push(value);
    }

    fn pop(&self) -> Option<T> {
        self.items.lock().pop()
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Гоняет одну нагрузку на стеке и возвращает затраченное время.
/// После нагрузки стек вычерпывается; число снятых значений должно совпасть с числом положенных.
pub fn run_workload<S>(stack: Arc<S>, workload: &Workload) -> Duration
where
    S: ConcurrentStack<usize> + 'static,
{
    let start = Instant::now();
    let handles: Vec<_> = (0..workload.threads)
        .map(|t| {
            let stack = Arc::clone(&stack);
            let operations = workload.operations_per_thread;
            thread::spawn(move || {
                let mut popped = 0usize;
                for i in 0..operations {
                    stack.push(t * operations + i);
                    if stack.pop().is_some() {
                        popped += 1;
                    }
                }
                popped
            })
        })
        .collect();

    let mut popped: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap_or_else(|err| std::panic::resume_unwind(err)))
        .sum();
    let elapsed = start.elapsed();

    while stack.pop().is_some() {
        popped += 1;
    }
    assert_eq!(popped, workload.threads * workload.operations_per_thread);

    elapsed
}

/// Сравнивает обе lock-free реализации с мьютексом на одной нагрузке и печатает итог.
pub fn compare_stacks(workload: &Workload) -> ComparisonReport {
    let mutex = run_workload(
        Arc::new(MutexStack {
            items: Mutex::new(Vec::new()),
        }),
        workload,
    );
    let ref_counted = run_workload(Arc::new(RefCountedStack::new()), workload);
    let hazard_pointer = run_workload(Arc::new(HazardPointerStack::new()), workload);

    let report = ComparisonReport {
        mutex,
        ref_counted,
        hazard_pointer,
    };
    report.print();
    report
}
