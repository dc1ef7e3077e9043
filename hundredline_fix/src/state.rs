use std::sync::atomic::{AtomicI32, Ordering};

use crate::config::Settings;

/// Resolution most recently seen by the resolution hook. Written from whichever game thread
/// runs the hook, so a reader may see width and height from different updates.
#[derive(Debug, Default)]
pub struct CurrentResolution {
    width: AtomicI32,
    height: AtomicI32,
}

impl CurrentResolution {
    pub fn get(&self) -> (i32, i32) {
        (
            self.width.load(Ordering::Relaxed),
            self.height.load(Ordering::Relaxed),
        )
    }
    /// Store a new resolution, returning whether it differs from the previous one
    pub fn update(&self, width: i32, height: i32) -> bool {
        if self.get() == (width, height) {
            return false;
        }
        self.width.store(width, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
        true
    }
}

/// Everything the hook callbacks share
#[derive(Debug)]
pub struct FixState {
    pub settings: Settings,
    pub current: CurrentResolution,
}

impl FixState {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            current: CurrentResolution::default(),
        }
    }
}
