use super::macros::impl_ops;

impl_ops!(Va, u64, "Virtual Address");

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Rounds the address down to a multiple of `page_size`.
    ///
    /// `page_size` must be a power of two.
    pub fn align_down(self, page_size: u64) -> Self {
        Self(self.0 & !(page_size - 1))
    }

    /// Checks if the address is a multiple of `page_size`.
    pub fn is_aligned(self, page_size: u64) -> bool {
        self.0 & (page_size - 1) == 0
    }
}

impl<T> From<*const T> for Va {
    fn from(value: *const T) -> Self {
        Self(value as u64)
    }
}

impl<T> From<*mut T> for Va {
    fn from(value: *mut T) -> Self {
        Self(value as u64)
    }
}
