use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};

/// What the processing loop does with each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Display the camera image and keep the tone silent.
    #[default]
    PassThrough,
    /// Run the image analysis and drive the tone from its distance.
    Analyze,
}

/// Process-wide mode flag. Written by the UI layer, read once per frame by the
/// processing loop.
#[derive(Debug, Default)]
pub struct ModeSwitch {
    current: AtomicCell<Mode>,
}

impl ModeSwitch {
    pub fn new(initial: Mode) -> Self {
        Self {
            current: AtomicCell::new(initial),
        }
    }

    pub fn get(&self) -> Mode {
        self.current.load()
    }

    /// Stores `mode` and returns the previous value.
    pub fn set(&self, mode: Mode) -> Mode {
        let previous = self.current.swap(mode);
        if previous != mode {
            tracing::info!(?previous, ?mode, "mode changed");
        }
        previous
    }

    pub fn toggle(&self) -> Mode {
        let next = match self.get() {
            Mode::PassThrough => Mode::Analyze,
            Mode::Analyze => Mode::PassThrough,
        };
        self.set(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_requested_mode_and_toggles() {
        let switch = ModeSwitch::new(Mode::PassThrough);
        assert_eq!(switch.get(), Mode::PassThrough);
        assert_eq!(switch.toggle(), Mode::Analyze);
        assert_eq!(switch.set(Mode::PassThrough), Mode::Analyze);
        assert_eq!(switch.get(), Mode::PassThrough);
    }
}
