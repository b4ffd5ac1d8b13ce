use crate::device::types::{PinNo, PinState};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Capability to drive one actuator.
///
/// Callers must read the state back after every write and treat a mismatch as a
/// fault. Handles never retry on their own.
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    /// Drive the pin to `state`. `Undefined` is not a commandable level and is ignored.
    fn set_state(&mut self, state: PinState);

    /// Current level, or `Undefined` before the first write or after a fault.
    fn get_state(&self) -> PinState;

    /// Release the underlying line, driving it LOW first if it was active. Idempotent.
    fn destroy(&mut self);

    fn pin_no(&self) -> PinNo;
}

/// Errors raised by a pin driver
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Pin {pin} is not exported")]
    NotExported { pin: PinNo },
    #[error("Unexpected value '{value}' read from pin {pin}")]
    InvalidValue { pin: PinNo, value: String },
    #[error("IO error on pin {pin}: {source}")]
    Io {
        pin: PinNo,
        #[source]
        source: std::io::Error,
    },
}

/// Raw electrical primitive for a family of pins
pub trait PinDriver: Send + Sync {
    /// Claim the pin as an output
    fn export(&self, pin: PinNo) -> Result<(), DeviceError>;
    fn write(&self, pin: PinNo, level: bool) -> Result<(), DeviceError>;
    fn read(&self, pin: PinNo) -> Result<bool, DeviceError>;
    fn unexport(&self, pin: PinNo) -> Result<(), DeviceError>;
}

/// Handle for a physical GPIO line, materialized lazily on first write
pub struct GpioPin {
    pin: PinNo,
    driver: Arc<dyn PinDriver>,
    active: bool,
    released: bool,
    faulted: AtomicBool,
}

impl GpioPin {
    pub fn new(pin: PinNo, driver: Arc<dyn PinDriver>) -> Self {
        Self {
            pin,
            driver,
            active: false,
            released: false,
            faulted: AtomicBool::new(false),
        }
    }

    fn ensure_materialized(&mut self) -> bool {
        if self.active {
            return true;
        }

        let created = self
            .driver
            .export(self.pin)
            .and_then(|_| self.driver.write(self.pin, false));

        match created {
            Ok(()) => {
                self.active = true;
                info!(pin = self.pin, "Pin activated");
                true
            }
            Err(e) => {
                error!(pin = self.pin, "GPIO initialization failed: {}", e);
                self.faulted.store(true, Ordering::SeqCst);
                false
            }
        }
    }
}

impl fmt::Debug for GpioPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioPin")
            .field("pin", &self.pin)
            .field("active", &self.active)
            .field("released", &self.released)
            .field("faulted", &self.faulted.load(Ordering::SeqCst))
            .finish()
    }
}

impl DeviceHandle for GpioPin {
    fn set_state(&mut self, state: PinState) {
        if self.released {
            warn!(pin = self.pin, "Write to released pin ignored");
            return;
        }
        let Some(level) = state.level() else {
            warn!(pin = self.pin, "Refusing to drive pin to {}", state);
            return;
        };
        if !self.ensure_materialized() {
            return;
        }

        match self.driver.write(self.pin, level) {
            Ok(()) => {
                self.faulted.store(false, Ordering::SeqCst);
                debug!(pin = self.pin, "Pin state changed to {}", state);
            }
            Err(e) => {
                error!(pin = self.pin, "Pin write failed: {}", e);
                self.faulted.store(true, Ordering::SeqCst);
            }
        }
    }

    fn get_state(&self) -> PinState {
        if !self.active || self.released || self.faulted.load(Ordering::SeqCst) {
            return PinState::Undefined;
        }

        match self.driver.read(self.pin) {
            Ok(level) => PinState::from_level(level),
            Err(e) => {
                error!(pin = self.pin, "Pin read failed: {}", e);
                self.faulted.store(true, Ordering::SeqCst);
                PinState::Undefined
            }
        }
    }

    fn destroy(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if !self.active {
            return;
        }
        self.active = false;

        if let Err(e) = self.driver.write(self.pin, false) {
            warn!(pin = self.pin, "Could not drive pin LOW before release: {}", e);
        }
        if let Err(e) = self.driver.unexport(self.pin) {
            warn!(pin = self.pin, "Could not release pin: {}", e);
        }
        info!(pin = self.pin, "Pin deactivated");
    }

    fn pin_no(&self) -> PinNo {
        self.pin
    }
}

/// One commanded write recorded by the simulated board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinWrite {
    pub pin: PinNo,
    pub state: PinState,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct BoardState {
    levels: HashMap<PinNo, bool>,
    stuck: HashMap<PinNo, bool>,
    claimed: HashSet<PinNo>,
    journal: Vec<PinWrite>,
}

/// In-memory stand-in for the electrical side of the rig.
///
/// Keeps per-pin levels and a journal of every commanded write. A pin can be
/// stuck at a level to simulate a welded relay or a dead coil.
#[derive(Debug, Default)]
pub struct SimulatedBoard {
    state: Mutex<BoardState>,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force `pin` to read back `state` regardless of what is written to it
    pub fn stick(&self, pin: PinNo, state: PinState) {
        let mut board = self.lock();
        match state.level() {
            Some(level) => {
                board.stuck.insert(pin, level);
                board.levels.insert(pin, level);
            }
            None => {
                board.stuck.remove(&pin);
            }
        }
    }

    pub fn unstick(&self, pin: PinNo) {
        self.lock().stuck.remove(&pin);
    }

    /// Every write commanded so far, in order
    pub fn journal(&self) -> Vec<PinWrite> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Current electrical level of `pin`, if it was ever driven
    pub fn level(&self, pin: PinNo) -> Option<bool> {
        self.lock().levels.get(&pin).copied()
    }

    pub fn is_claimed(&self, pin: PinNo) -> bool {
        self.lock().claimed.contains(&pin)
    }

    fn claim(&self, pin: PinNo) {
        let mut board = self.lock();
        board.claimed.insert(pin);
        let level = board.stuck.get(&pin).copied().unwrap_or(false);
        board.levels.insert(pin, level);
    }

    fn release(&self, pin: PinNo) {
        self.lock().claimed.remove(&pin);
    }

    fn write(&self, pin: PinNo, state: PinState, level: bool) {
        let mut board = self.lock();
        board.journal.push(PinWrite {
            pin,
            state,
            at: Instant::now(),
        });
        let effective = board.stuck.get(&pin).copied().unwrap_or(level);
        board.levels.insert(pin, effective);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardState> {
        // A poisoned board only means a test panicked mid-write; the data is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle backed by a [`SimulatedBoard`]
#[derive(Debug)]
pub struct SimulatedPin {
    pin: PinNo,
    board: Arc<SimulatedBoard>,
    active: bool,
    released: bool,
}

impl SimulatedPin {
    pub fn new(pin: PinNo, board: Arc<SimulatedBoard>) -> Self {
        Self {
            pin,
            board,
            active: false,
            released: false,
        }
    }
}

impl DeviceHandle for SimulatedPin {
    fn set_state(&mut self, state: PinState) {
        if self.released {
            warn!(pin = self.pin, "Write to released pin ignored");
            return;
        }
        let Some(level) = state.level() else {
            warn!(pin = self.pin, "Refusing to drive pin to {}", state);
            return;
        };
        if !self.active {
            self.board.claim(self.pin);
            self.active = true;
            debug!(pin = self.pin, "Simulated pin activated");
        }
        self.board.write(self.pin, state, level);
        debug!(pin = self.pin, "Simulated pin state changed to {}", state);
    }

    fn get_state(&self) -> PinState {
        if !self.active || self.released {
            return PinState::Undefined;
        }
        self.board
            .level(self.pin)
            .map(PinState::from_level)
            .unwrap_or(PinState::Undefined)
    }

    fn destroy(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.active {
            self.board.write(self.pin, PinState::Low, false);
            self.board.release(self.pin);
            self.active = false;
            debug!(pin = self.pin, "Simulated pin deactivated");
        }
    }

    fn pin_no(&self) -> PinNo {
        self.pin
    }
}

/// Creates device handles for pins, live or simulated depending on configuration
#[derive(Clone)]
pub enum HandleFactory {
    Gpio(Arc<dyn PinDriver>),
    Simulated(Arc<SimulatedBoard>),
}

impl HandleFactory {
    pub fn gpio(driver: Arc<dyn PinDriver>) -> Self {
        HandleFactory::Gpio(driver)
    }

    pub fn simulated(board: Arc<SimulatedBoard>) -> Self {
        HandleFactory::Simulated(board)
    }

    pub fn create(&self, pin: PinNo) -> Box<dyn DeviceHandle> {
        match self {
            HandleFactory::Gpio(driver) => Box::new(GpioPin::new(pin, Arc::clone(driver))),
            HandleFactory::Simulated(board) => Box::new(SimulatedPin::new(pin, Arc::clone(board))),
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, HandleFactory::Simulated(_))
    }
}

impl fmt::Debug for HandleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleFactory::Gpio(_) => write!(f, "HandleFactory::Gpio"),
            HandleFactory::Simulated(_) => write!(f, "HandleFactory::Simulated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FlakyDriver {
        levels: Mutex<HashMap<PinNo, bool>>,
        fail_writes: AtomicBool,
        unexported: Mutex<Vec<PinNo>>,
    }

    impl PinDriver for FlakyDriver {
        fn export(&self, _pin: PinNo) -> Result<(), DeviceError> {
            Ok(())
        }

        fn write(&self, pin: PinNo, level: bool) -> Result<(), DeviceError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DeviceError::Io {
                    pin,
                    source: std::io::Error::other("bus error"),
                });
            }
            self.levels.lock().unwrap().insert(pin, level);
            Ok(())
        }

        fn read(&self, pin: PinNo) -> Result<bool, DeviceError> {
            self.levels
                .lock()
                .unwrap()
                .get(&pin)
                .copied()
                .ok_or(DeviceError::NotExported { pin })
        }

        fn unexport(&self, pin: PinNo) -> Result<(), DeviceError> {
            self.unexported.lock().unwrap().push(pin);
            Ok(())
        }
    }

    #[test]
    fn test_gpio_pin_is_undefined_until_first_write() {
        let driver = Arc::new(FlakyDriver::default());
        let mut pin = GpioPin::new(17, driver.clone());

        assert_eq!(pin.get_state(), PinState::Undefined);
        pin.set_state(PinState::High);
        assert_eq!(pin.get_state(), PinState::High);
        pin.set_state(PinState::Low);
        assert_eq!(pin.get_state(), PinState::Low);
    }

    #[test]
    fn test_gpio_pin_write_failure_reads_back_undefined() {
        let driver = Arc::new(FlakyDriver::default());
        let mut pin = GpioPin::new(17, driver.clone());
        pin.set_state(PinState::Low);

        driver.fail_writes.store(true, Ordering::SeqCst);
        pin.set_state(PinState::High);
        assert_eq!(pin.get_state(), PinState::Undefined);

        driver.fail_writes.store(false, Ordering::SeqCst);
        pin.set_state(PinState::High);
        assert_eq!(pin.get_state(), PinState::High);
    }

    #[test]
    fn test_gpio_pin_destroy_is_idempotent_and_drives_low() {
        let driver = Arc::new(FlakyDriver::default());
        let mut pin = GpioPin::new(22, driver.clone());
        pin.set_state(PinState::High);

        pin.destroy();
        pin.destroy();

        assert_eq!(driver.levels.lock().unwrap().get(&22), Some(&false));
        assert_eq!(*driver.unexported.lock().unwrap(), vec![22]);
        assert_eq!(pin.get_state(), PinState::Undefined);
    }

    #[test]
    fn test_destroy_never_materialized_pin_touches_nothing() {
        let driver = Arc::new(FlakyDriver::default());
        let mut pin = GpioPin::new(5, driver.clone());
        pin.destroy();

        assert!(driver.levels.lock().unwrap().is_empty());
        assert!(driver.unexported.lock().unwrap().is_empty());
    }

    #[test]
    fn test_simulated_pin_journal_and_stuck_relay() {
        let board = Arc::new(SimulatedBoard::new());
        let mut pin = SimulatedPin::new(27, board.clone());

        pin.set_state(PinState::High);
        assert_eq!(pin.get_state(), PinState::High);

        board.stick(27, PinState::High);
        pin.set_state(PinState::Low);
        assert_eq!(pin.get_state(), PinState::High);

        board.unstick(27);
        pin.set_state(PinState::Low);
        assert_eq!(pin.get_state(), PinState::Low);

        let states: Vec<PinState> = board.journal().iter().map(|w| w.state).collect();
        assert_eq!(states, vec![PinState::High, PinState::Low, PinState::Low]);
    }

    #[test]
    fn test_factory_builds_requested_variant() {
        let board = Arc::new(SimulatedBoard::new());
        let factory = HandleFactory::simulated(board.clone());
        let mut handle = factory.create(13);

        assert!(factory.is_simulated());
        assert_eq!(handle.pin_no(), 13);
        handle.set_state(PinState::High);
        assert!(board.is_claimed(13));
        handle.destroy();
        assert!(!board.is_claimed(13));
        assert_eq!(board.level(13), Some(false));
    }
}
