/// A device register window mapped into the guest physical address space.
///
/// `offset` is relative to the start of the window. `size` is the access width in bytes (1, 2, 4
/// or 8); values are zero-extended into the `u64`.
pub trait MmioHandler {
    fn read(&mut self, offset: u64, size: usize) -> u64;
    fn write(&mut self, offset: u64, size: usize, value: u64);
}

impl<T: MmioHandler + ?Sized> MmioHandler for Box<T> {
    fn read(&mut self, offset: u64, size: usize) -> u64 {
        (**self).read(offset, size)
    }

    fn write(&mut self, offset: u64, size: usize, value: u64) {
        (**self).write(offset, size, value)
    }
}
