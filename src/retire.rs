use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Удаляет объект, ранее выделенный через `Box<T>`.
///
/// # Safety
/// `ptr` получен из `Box::<T>::into_raw` и больше никем не используется.
pub(crate) unsafe fn drop_boxed<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut T));
}

/// Запись об отложенном удалении:
/// - ptr: адрес отцепленного объекта,
/// - deleter: функция, которая умеет его освободить (тип стёрт),
/// - next: следующая запись в списке.
pub(crate) struct Retired {
    ptr: *mut (),
    deleter: unsafe fn(*mut ()),
    next: *mut Retired,
}

impl Retired {
    pub fn new(ptr: *mut (), deleter: unsafe fn(*mut ())) -> Box<Self> {
        Box::new(Retired {
            ptr,
            deleter,
            next: ptr::null_mut(),
        })
    }

    pub fn address(&self) -> *mut () {
        self.ptr
    }

    /// # Safety
    /// На `ptr` больше не ссылается ни один указатель опасности.
    pub unsafe fn free(self: Box<Self>) {
        (self.deleter)(self.ptr);
    }
}

/// Глобальный список отложенного удаления (LIFO, один атомарный указатель на голову).
pub(crate) struct RetiredList {
    head: AtomicPtr<Retired>,
    pending: AtomicUsize, // Сколько объектов ждёт освобождения (приблизительно)
}

impl RetiredList {
    pub fn new() -> Self {
        RetiredList {
            head: AtomicPtr::new(ptr::null_mut()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Паркует новую запись.
    pub fn push(&self, entry: Box<Retired>) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.link(entry);
    }

    /// Возвращает в список запись, которую не удалось освободить при разборе.
    pub fn restore(&self, entry: Box<Retired>) {
        self.link(entry);
    }

    /// Атомарно забирает весь список целиком.
    pub fn take_all(&self) -> Drain {
        Drain {
            current: self.head.swap(ptr::null_mut(), Ordering::Acquire),
        }
    }

    /// Отмечает, что одна из запаркованных записей освобождена.
    pub fn note_freed(&self) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    fn link(&self, entry: Box<Retired>) {
        let entry = Box::into_raw(entry);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*entry).next = head };
            match self
                .head
                .compare_exchange_weak(head, entry, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
    }
}

impl Drop for RetiredList {
    fn drop(&mut self) {
        // Реестр уничтожается: слотов, которые могли бы защищать объекты, уже нет
        for entry in self.take_all() {
            unsafe { entry.free() };
        }
    }
}

/// Цепочка записей, снятая со списка через `take_all`.
/// Её нужно выбрать до конца: брошенный остаток не освобождается.
pub(crate) struct Drain {
    current: *mut Retired,
}

impl Iterator for Drain {
    type Item = Box<Retired>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        let mut entry = unsafe { Box::from_raw(self.current) };
        self.current = entry.next;
        entry.next = ptr::null_mut();
        Some(entry)
    }
}
