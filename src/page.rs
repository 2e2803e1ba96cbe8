use core::ops::{Deref, DerefMut};

use crate::vm::PGSIZE;

/// Page type.
#[repr(align(4096))]
pub struct Page {
    inner: [u8; PGSIZE],
}

impl Page {
    pub const DEFAULT: Self = Self { inner: [0; PGSIZE] };

    pub fn write_bytes(&mut self, value: u8) {
        for b in self.inner.iter_mut() {
            *b = value;
        }
    }

    pub fn as_usize(&self) -> usize {
        self as *const Self as usize
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
