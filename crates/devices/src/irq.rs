//! Level-triggered interrupt lines between devices and the platform interrupt controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A level-triggered interrupt input.
pub trait IrqLine {
    fn set_level(&self, level: bool);
}

/// An unconnected line.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIrq;

impl IrqLine for NoIrq {
    fn set_level(&self, _level: bool) {}
}

/// A line whose level can be observed by other holders of the same handle.
#[derive(Debug, Clone, Default)]
pub struct SharedIrqLine {
    level: Arc<AtomicBool>,
}

impl SharedIrqLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

impl IrqLine for SharedIrqLine {
    fn set_level(&self, level: bool) {
        self.level.store(level, Ordering::SeqCst);
    }
}
