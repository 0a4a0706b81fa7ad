use core::{
    cmp::PartialEq,
    ops::{BitAnd, BitOr, Not},
    ptr,
};

/// IO abstraction
pub trait Io {
    /// Value type for IO, usually some unsigned number
    type Value: Copy
        + PartialEq
        + BitAnd<Output = Self::Value>
        + BitOr<Output = Self::Value>
        + Not<Output = Self::Value>;

    /// Read the underlying value
    fn read(&self) -> Self::Value;
    /// Write the underlying value
    fn write(&mut self, value: Self::Value);

    /// Check whether the underlying value contains bit flags
    #[inline(always)]
    fn readf(&self, flags: Self::Value) -> bool {
        (self.read() & flags) as Self::Value == flags
    }

    /// Enable or disable specific bit flags
    #[inline(always)]
    fn writef(&mut self, flags: Self::Value, value: bool) {
        let tmp: Self::Value = match value {
            true => self.read() | flags,
            false => self.read() & !flags,
        };
        self.write(tmp);
    }
}

/// A memory cell shared with a device. Every access is volatile, so the compiler can neither
/// elide nor merge reads and writes the device may observe.
#[repr(transparent)]
pub struct Mmio<T> {
    value: T,
}

impl<T> Mmio<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> Io for Mmio<T>
where
    T: Copy + PartialEq + BitAnd<Output = T> + BitOr<Output = T> + Not<Output = T>,
{
    type Value = T;

    #[inline(always)]
    fn read(&self) -> T {
        unsafe { ptr::read_volatile(&self.value) }
    }

    #[inline(always)]
    fn write(&mut self, value: T) {
        unsafe { ptr::write_volatile(&mut self.value, value) }
    }
}

impl<T: Default> Default for Mmio<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
