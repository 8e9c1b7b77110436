use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::thread::LocalKey;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::retire::{Retired, RetiredList};

/// Ёмкость глобального реестра указателей опасности.
/// Каждый поток, который делает `pop`, занимает один слот на всё время жизни.
pub const MAX_HAZARD_POINTERS: usize = 100;

/// Значение `owner`, означающее, что слот никем не занят.
const UNCLAIMED: u64 = 0;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no free hazard pointer slot (registry capacity is {capacity})")]
    Exhausted { capacity: usize },
}

/// Один слот реестра:
/// - owner — идентификатор потока-владельца (`UNCLAIMED`, если свободен),
/// - protected — адрес, который владелец сейчас разыменовывает.
struct HazardPointer {
    owner: AtomicU64,
    protected: AtomicPtr<()>,
}

/// Реестр указателей опасности фиксированной ёмкости `N`
/// вместе со списком отложенного удаления.
pub struct HazardRegistry<const N: usize> {
    slots: [HazardPointer; N],
    retired: RetiredList,
}

/// Глобальный реестр с ленивой (Lazy) инициализацией.
/// При первом обращении инициализируется массивом из `MAX_HAZARD_POINTERS` слотов.
pub static HAZARD_POINTERS: Lazy<HazardRegistry<MAX_HAZARD_POINTERS>> =
    Lazy::new(HazardRegistry::new);

/// Источник идентификаторов потоков; 0 зарезервирован под `UNCLAIMED`.
static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);

    // Слот глобального реестра, занятый текущим потоком.
    // Освобождается при завершении потока.
    static LOCAL_SLOT: LocalSlot<MAX_HAZARD_POINTERS> = RefCell::new(None);
}

fn current_thread_id() -> u64 {
    THREAD_ID
        .try_with(|id| *id)
        .unwrap_or_else(|_| NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
}

impl<const N: usize> HazardRegistry<N> {
    pub fn new() -> Self {
        HazardRegistry {
            slots: array_init::array_init(|_| HazardPointer {
                owner: AtomicU64::new(UNCLAIMED),
                protected: AtomicPtr::new(ptr::null_mut()),
            }),
            retired: RetiredList::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        N
    }

    /// Ищет свободный слот и занимает его одним CAS `owner: UNCLAIMED -> id потока`.
    pub fn try_claim(&self) -> Result<HazardSlot<'_, N>, RegistryError> {
        let id = current_thread_id();
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .owner
                .compare_exchange(UNCLAIMED, id, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(HazardSlot {
                    registry: self,
                    index,
                    _not_send: PhantomData,
                });
            }
        }
        Err(RegistryError::Exhausted { capacity: N })
    }

    /// Как `try_claim`, но без свободного слота поток участвовать не может: паникуем.
    pub fn claim(&self) -> HazardSlot<'_, N> {
        match self.try_claim() {
            Ok(slot) => slot,
            Err(err) => panic!("{}", err),
        }
    }

    /// Сколько слотов сейчас занято.
    pub fn claimed(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.owner.load(Ordering::Relaxed) != UNCLAIMED)
            .count()
    }

    /// Защищён ли адрес хотя бы одним указателем опасности (линейный проход по слотам).
    pub fn is_protected(&self, addr: *mut ()) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.protected.load(Ordering::SeqCst) == addr)
    }

    /// Сколько отцепленных объектов ждёт в списке отложенного удаления.
    pub fn pending(&self) -> usize {
        self.retired.pending()
    }

    /// Освобождает отцепленный объект сразу или паркует его, если он ещё защищён.
    ///
    /// # Safety
    /// `ptr` ненулевой, уже недостижим из структуры данных, и `deleter` умеет его освободить.
    pub(crate) unsafe fn retire(&self, ptr: *mut (), deleter: unsafe fn(*mut ())) {
        debug_assert!(!ptr.is_null());
        if self.is_protected(ptr) {
            self.retired.push(Retired::new(ptr, deleter));
        } else {
            deleter(ptr);
        }
    }

    /// Забирает весь список отложенного удаления, освобождает всё, что больше
    /// никто не защищает, а остальное возвращает обратно.
    /// Возвращает число освобождённых объектов.
    pub fn reclaim(&self) -> usize {
        let mut freed = 0;
        for entry in self.retired.take_all() {
            if self.is_protected(entry.address()) {
                self.retired.restore(entry);
            } else {
                unsafe { entry.free() };
                self.retired.note_freed();
                freed += 1;
            }
        }
        freed
    }

    fn slot(&self, index: usize) -> &HazardPointer {
        &self.slots[index]
    }
}

impl<const N: usize> Default for HazardRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Занятый слот реестра. Пока он жив, слот принадлежит этому потоку;
/// при drop адрес и владелец сбрасываются.
pub struct HazardSlot<'r, const N: usize = MAX_HAZARD_POINTERS> {
    registry: &'r HazardRegistry<N>,
    index: usize,
    _not_send: PhantomData<*mut ()>, // Слот привязан к потоку, который его занял
}

impl<'r, const N: usize> HazardSlot<'r, N> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Идентификатор потока-владельца.
    pub fn owner(&self) -> u64 {
        self.registry.slot(self.index).owner.load(Ordering::Relaxed)
    }

    /// Публикует адрес, который поток собирается разыменовать.
    pub fn protect<T>(&self, ptr: *mut T) {
        self.registry
            .slot(self.index)
            .protected
            .store(ptr as *mut (), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.registry
            .slot(self.index)
            .protected
            .store(ptr::null_mut(), Ordering::Release);
    }

    pub(crate) fn registry(&self) -> &'r HazardRegistry<N> {
        self.registry
    }
}

impl<const N: usize> Drop for HazardSlot<'_, N> {
    fn drop(&mut self) {
        let slot = self.registry.slot(self.index);
        slot.protected.store(ptr::null_mut(), Ordering::Release);
        slot.owner.store(UNCLAIMED, Ordering::Release);
    }
}

/// Слот, который поток держит в своём thread_local (None — ещё не занят).
pub(crate) type LocalSlot<const N: usize> = RefCell<Option<HazardSlot<'static, N>>>;

/// Выполняет `f` со слотом текущего потока в глобальном реестре.
/// Если поток ещё не зарегистрирован, занимает слот (паника, если свободных нет).
pub(crate) fn with_thread_slot<R>(f: impl FnOnce(&HazardSlot<'static>) -> R) -> R {
    with_local_slot(&LOCAL_SLOT, &*HAZARD_POINTERS, f)
}

/// Выполняет `f` со слотом, который поток хранит в `local`;
/// при первом вызове занимает его в `registry` и держит до завершения потока.
pub(crate) fn with_local_slot<const N: usize, R>(
    local: &'static LocalKey<LocalSlot<N>>,
    registry: &'static HazardRegistry<N>,
    f: impl FnOnce(&HazardSlot<'static, N>) -> R,
) -> R {
    let registered = local.try_with(|cell| {
        cell.borrow_mut().get_or_insert_with(|| registry.claim());
    });

    match registered {
        Ok(()) => local.with(|cell| match &*cell.borrow() {
            Some(slot) => f(slot),
            None => f(&registry.claim()),
        }),
        // thread_local уже уничтожен (вызов из деструктора другого TLS): берём слот на время вызова
        Err(_) => f(&registry.claim()),
    }
}

/// Явно освобождает слот текущего потока в глобальном реестре.
///
/// Без этого вызова слот освободится при завершении потока.
/// Следующий `pop` из этого потока займёт слот заново.
pub fn unregister_thread() {
    let _ = LOCAL_SLOT.try_with(|local| local.borrow_mut().take());
}
