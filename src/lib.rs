//! Lock-free LIFO стеки с безопасным освобождением памяти.
//!
//! Две взаимозаменяемые реализации одного контракта:
//! - [`RefCountedStack`] — раздельный подсчёт ссылок: вершина хранит пару
//!   (указатель, внешний счётчик), узел — внутренний счётчик;
//! - [`HazardPointerStack`] — указатели опасности: поток публикует адрес узла,
//!   который разыменовывает, а отцепленные узлы освобождаются, только когда их никто не держит.
//!
//! ```
//! use rust_lockfree_smr::{HazardPointerStack, RefCountedStack};
//!
//! let stack = RefCountedStack::new();
//! stack.push(1);
//! stack.push(2);
//! assert_eq!(stack.pop(), Some(2));
//!
//! let stack = HazardPointerStack::new();
//! stack.push("a");
//! assert_eq!(stack.pop(), Some("a"));
//! assert_eq!(stack.pop(), None);
//! ```

pub mod comparison;
mod counted_ptr;
pub mod hazard;
mod hazard_pointer_stack;
mod ref_counted_stack;
mod retire;

#[cfg(test)]
mod test_support;

pub use hazard::{
    unregister_thread, HazardRegistry, HazardSlot, RegistryError, HAZARD_POINTERS,
    MAX_HAZARD_POINTERS,
};
pub use hazard_pointer_stack::HazardPointerStack;
pub use ref_counted_stack::RefCountedStack;

/// Общий контракт конкурентного стека.
pub trait ConcurrentStack<T>: Send + Sync {
    /// Кладёт значение на вершину. Не падает (кроме исчерпания памяти).
    fn push(&self, value: T);

    /// Снимает последнее положенное значение или возвращает `None`, если стек пуст.
    fn pop(&self) -> Option<T>;

    /// Грубая проверка на пустоту, не линеаризуема относительно конкурентных push/pop.
    fn is_empty(&self) -> bool;
}
