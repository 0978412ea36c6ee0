use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

// Serial input device wired to `$4016`.
pub trait Controller {
    // Shifts the next button bit out and returns it on bit 0 with the
    // open-bus pattern of the port in the upper bits.
    fn strobe(&mut self) -> u8;

    // Re-latches the live button state into the shift register.
    fn output(&mut self);
}

// Packed button byte shared between the host's input thread and the core.
#[derive(Debug, Clone, Default)]
pub struct ButtonState(Arc<AtomicU8>);

impl ButtonState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, state: u8) {
        self.0.store(state, Ordering::Relaxed);
    }

    pub fn get(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct StandardController {
    buttons: ButtonState,
    latch: u8,
}

impl StandardController {
    pub fn new(buttons: ButtonState) -> Self {
        Self { buttons, latch: 0 }
    }
}

impl Controller for StandardController {
    fn strobe(&mut self) -> u8 {
        let bit = self.latch & 0x01;
        // Once all eight buttons are out the port keeps returning 1.
        self.latch = (self.latch >> 1) | 0x80;
        log::trace!("controller read bit={bit}");
        0x40 | bit
    }

    fn output(&mut self) {
        self.latch = self.buttons.get();
        log::trace!("controller latched ${:02X}", self.latch);
    }
}
