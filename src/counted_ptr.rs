use std::fmt;

/// Пара (указатель на узел, внешний счётчик).
///
/// Вся пара упаковывается в один `u128`, чтобы её можно было менять одним CAS:
/// - младшие 64 бита — адрес узла как есть (без предположений о выравнивании и ширине адреса),
/// - старшие 64 бита — внешний счётчик.
///
/// Внешний счётчик долгоживущего узла растёт на 1 за каждую проигранную гонку за отцепление
/// и не убывает, пока узел в стеке, поэтому под него отдано целое машинное слово.
pub(crate) struct CountedPtr<N> {
    pub node: *mut N,
    pub external_count: u64,
}

impl<N> CountedPtr<N> {
    pub fn new(node: *mut N, external_count: u64) -> Self {
        CountedPtr {
            node,
            external_count,
        }
    }

    /// Пустая ссылка: нулевой указатель, нулевой счётчик.
    pub fn null() -> Self {
        Self::new(std::ptr::null_mut(), 0)
    }

    pub fn is_null(&self) -> bool {
        self.node.is_null()
    }

    /// Та же ссылка, но с внешним счётчиком, увеличенным на 1.
    pub fn claimed(&self) -> Self {
        Self::new(self.node, self.external_count + 1)
    }

    pub fn encode(&self) -> u128 {
        let addr = self.node as usize as u64;
        (addr as u128) | ((self.external_count as u128) << 64)
    }

    pub fn decode(bits: u128) -> Self {
        let node = (bits as u64) as usize as *mut N;
        let external_count = (bits >> 64) as u64;
        Self::new(node, external_count)
    }
}

impl<N> Clone for CountedPtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for CountedPtr<N> {}

impl<N> PartialEq for CountedPtr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.external_count == other.external_count
    }
}

impl<N> Eq for CountedPtr<N> {}

impl<N> fmt::Debug for CountedPtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedPtr")
            .field("node", &self.node)
            .field("external_count", &self.external_count)
            .finish()
    }
}
