use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{fence, AtomicI64, Ordering};

use portable_atomic::AtomicU128;

use crate::counted_ptr::CountedPtr;
use crate::ConcurrentStack;

/// Узел стека с раздельным подсчётом ссылок.
///
/// Значение забирается ровно один раз — потоком, который отцепил узел от вершины.
/// `internal_count` копит освобождённые «заявки» потоков, которые читали узел,
/// но проиграли гонку за его отцепление.
struct Node<T> {
    value: ManuallyDrop<T>,
    internal_count: AtomicI64,
    next: CountedPtr<Node<T>>, // Копия вершины на момент push (вместе с внешним счётчиком)
}

/// Lock-free стек с раздельным подсчётом ссылок (split reference counting).
///
/// Вершина — это пара (указатель, внешний счётчик), упакованная в одно 128-битное атомарное слово.
/// Внешний счётчик = 1 (сама вершина) + число потоков, которые сейчас разыменовывают узел.
/// Узел освобождается ровно в тот момент, когда сумма внешнего и внутреннего счётчиков
/// становится нулём.
pub struct RefCountedStack<T> {
    head: AtomicU128, // Упакованный CountedPtr<Node<T>>
    _marker: PhantomData<Box<Node<T>>>,
}

unsafe impl<T: Send> Send for RefCountedStack<T> {}
unsafe impl<T: Send> Sync for RefCountedStack<T> {}

impl<T> RefCountedStack<T> {
    /// Создаёт новый пустой стек
    pub fn new() -> Self {
        RefCountedStack {
            head: AtomicU128::new(CountedPtr::<Node<T>>::null().encode()),
            _marker: PhantomData,
        }
    }

    /// Кладёт значение на вершину стека (lock-free push)
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value: ManuallyDrop::new(value),
            internal_count: AtomicI64::new(0),
            next: CountedPtr::null(),
        }));
        let new_head = CountedPtr::new(node, 1).encode();

        // Relaxed достаточно: CAS ниже всё равно перепроверит значение
        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = CountedPtr::decode(current) };

            // Release публикует полностью инициализированный узел
            match self.head.compare_exchange_weak(
                current,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Снимает значение с вершины стека (lock-free pop)
    pub fn pop(&self) -> Option<T> {
        let mut old_head = CountedPtr::decode(self.head.load(Ordering::Relaxed));
        loop {
            // Объявляем, что разыменовываем текущую вершину
            old_head = self.claim_head(old_head)?;
            let node = old_head.node;

            match self.try_unlink(old_head) {
                Ok(()) => {
                    // Узел отцеплен нами: значение принадлежит только этому потоку
                    let value = unsafe { ManuallyDrop::into_inner(ptr::read(&(*node).value)) };
                    unsafe { Self::settle_unlinked(node, old_head.external_count) };
                    return Some(value);
                }
                Err(current) => {
                    // Другой поток успел раньше: отдаём свою заявку и пробуем заново
                    unsafe { Self::release_claim(node) };
                    old_head = current;
                }
            }
        }
    }

    /// Грубая проверка на пустоту. Под конкурентной нагрузкой ответ устаревает сразу.
    pub fn is_empty(&self) -> bool {
        CountedPtr::<Node<T>>::decode(self.head.load(Ordering::Acquire)).is_null()
    }

    /// Увеличивает внешний счётчик вершины на 1.
    ///
    /// Возвращает вершину с учётом нашей заявки или `None`, если стек пуст.
    /// Пустую вершину не трогаем: разыменовывать там нечего.
    fn claim_head(&self, mut old_head: CountedPtr<Node<T>>) -> Option<CountedPtr<Node<T>>> {
        loop {
            if old_head.is_null() {
                return None;
            }

            let new_head = old_head.claimed();
            match self.head.compare_exchange_weak(
                old_head.encode(),
                new_head.encode(),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(new_head),
                Err(actual) => old_head = CountedPtr::decode(actual),
            }
        }
    }

    /// Пытается заменить вершину на `next` заявленного узла.
    ///
    /// Вызывать только с заявкой на `claimed.node`: иначе узел мог быть уже освобождён.
    fn try_unlink(&self, claimed: CountedPtr<Node<T>>) -> Result<(), CountedPtr<Node<T>>> {
        let next = unsafe { (*claimed.node).next };
        self.head
            .compare_exchange(
                claimed.encode(),
                next.encode(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(CountedPtr::decode)
    }

    /// Переносит внешний счётчик отцепленного узла во внутренний.
    ///
    /// Из наблюдённого внешнего счётчика вычитаем 2: одну ссылку держала вершина,
    /// которой больше нет, вторую — наша собственная заявка. Если сумма стала нулём,
    /// других читателей нет и узел освобождается. Возвращает `true`, если освободили.
    ///
    /// # Safety
    /// `node` отцеплен вызывающим потоком, значение из него уже забрано.
    unsafe fn settle_unlinked(node: *mut Node<T>, external_count: u64) -> bool {
        let delta = external_count as i64 - 2;
        // Release: забор значения должен произойти до возможного освобождения
        if (*node).internal_count.fetch_add(delta, Ordering::Release) == -delta {
            drop(Box::from_raw(node));
            return true;
        }
        false
    }

    /// Снимает заявку потока, проигравшего гонку за отцепление.
    /// Возвращает `true`, если этот поток был последним и освободил узел.
    ///
    /// # Safety
    /// У вызывающего потока есть заявка на `node`, и она снимается ровно один раз.
    unsafe fn release_claim(node: *mut Node<T>) -> bool {
        if (*node).internal_count.fetch_sub(1, Ordering::Relaxed) == 1 {
            fence(Ordering::Acquire);
            drop(Box::from_raw(node));
            return true;
        }
        false
    }
}

impl<T> Default for RefCountedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for RefCountedStack<T> {
    /// Освобождает все оставшиеся узлы и значения
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T: Send> ConcurrentStack<T> for RefCountedStack<T> {
    fn push(&self, value: T) {
        RefCountedStack::push(self, value)
    }

    fn pop(&self) -> Option<T> {
        RefCountedStack::pop(self)
    }

    fn is_empty(&self) -> bool {
        RefCountedStack::is_empty(self)
    }
}
