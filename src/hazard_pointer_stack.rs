use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::hazard::{self, HazardRegistry, HazardSlot, HAZARD_POINTERS, MAX_HAZARD_POINTERS};
use crate::retire::drop_boxed;
use crate::ConcurrentStack;

/// Узел стека (односвязный список).
/// Временем жизни узла управляет реестр указателей опасности, а не сам узел.
struct Node<T> {
    value: ManuallyDrop<T>,
    next: *mut Node<T>, // Указатель на следующий узел
}

/// Lock-free стек с указателями опасности (hazard pointers).
///
/// Перед разыменованием вершины поток публикует её адрес в своём слоте реестра.
/// Отцепленный узел освобождается, только если его адрес не опубликован ни в одном слоте;
/// иначе он уходит в список отложенного удаления реестра.
pub struct HazardPointerStack<T, const N: usize = MAX_HAZARD_POINTERS> {
    head: AtomicPtr<Node<T>>, // Атомарный указатель на верхний элемент стека
    registry: &'static HazardRegistry<N>,
    _marker: PhantomData<Box<Node<T>>>,
}

unsafe impl<T: Send, const N: usize> Send for HazardPointerStack<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for HazardPointerStack<T, N> {}

impl<T> HazardPointerStack<T> {
    /// Создаёт новый пустой стек поверх глобального реестра
    pub fn new() -> Self {
        Self::with_registry(&HAZARD_POINTERS)
    }

    /// Удаляет и возвращает верхний элемент, используя слот текущего потока.
    ///
    /// При первом вызове поток занимает слот глобального реестра и держит его до своего
    /// завершения (или до `unregister_thread`). Если свободных слотов нет — паника.
    pub fn pop(&self) -> Option<T> {
        hazard::with_thread_slot(|slot| self.pop_with(slot))
    }
}

impl<T, const N: usize> HazardPointerStack<T, N> {
    /// Создаёт новый пустой стек поверх указанного реестра
    pub fn with_registry(registry: &'static HazardRegistry<N>) -> Self {
        HazardPointerStack {
            head: AtomicPtr::new(ptr::null_mut()),
            registry,
            _marker: PhantomData,
        }
    }

    pub fn registry(&self) -> &'static HazardRegistry<N> {
        self.registry
    }

    /// Добавляет элемент в стек (lock-free push)
    pub fn push(&self, value: T) {
        let new_node = Box::into_raw(Box::new(Node {
            value: ManuallyDrop::new(value),
            next: ptr::null_mut(),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*new_node).next = head }; // Новый узел указывает на увиденную вершину

            match self
                .head
                .compare_exchange_weak(head, new_node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }

    /// Удаляет и возвращает верхний элемент, защищая вершину явно занятым слотом.
    ///
    /// Слот должен принадлежать реестру этого стека.
    pub fn pop_with(&self, slot: &HazardSlot<'_, N>) -> Option<T> {
        assert!(
            ptr::eq(slot.registry(), self.registry),
            "hazard slot belongs to another registry"
        );

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Публикуем кандидата и перечитываем вершину, пока они не совпадут:
            // после этого узел не может быть освобождён, пока мы его держим
            loop {
                let candidate = head;
                slot.protect(candidate);
                head = self.head.load(Ordering::SeqCst);
                if head == candidate {
                    break;
                }
            }

            if head.is_null() {
                slot.clear();
                return None; // Стек пуст
            }

            let next = unsafe { (*head).next };
            match self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }

        // Узел отцеплен нами: снимаем свою защиту и забираем значение
        slot.clear();
        let value = unsafe { ManuallyDrop::into_inner(ptr::read(&(*head).value)) };

        unsafe { self.registry.retire(head as *mut (), drop_boxed::<Node<T>>) };
        self.registry.reclaim();

        Some(value)
    }

    /// Грубая проверка на пустоту. Под конкурентной нагрузкой ответ устаревает сразу.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for HazardPointerStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Drop for HazardPointerStack<T, N> {
    /// Освобождает всю память при уничтожении стека.
    /// `&mut self` гарантирует, что ни один pop этого стека не выполняется,
    /// поэтому оставшиеся узлы никем не защищены.
    fn drop(&mut self) {
        let mut current = *self.head.get_mut();
        while !current.is_null() {
            let mut node = unsafe { Box::from_raw(current) };
            current = node.next;
            unsafe { ManuallyDrop::drop(&mut node.value) };
        }
    }
}

impl<T: Send> ConcurrentStack<T> for HazardPointerStack<T> {
    fn push(&self, value: T) {
        HazardPointerStack::push(self, value)
    }

    fn pop(&self) -> Option<T> {
        HazardPointerStack::pop(self)
    }

    fn is_empty(&self) -> bool {
        HazardPointerStack::is_empty(self)
    }
}
