//! Capture driver seam.
//!
//! The engine talks to the microphone through this trait so the same code
//! runs against an embedded I2S peripheral, the host microphone driver, or a
//! scripted test double. The surface mirrors a DMA-backed receive-only
//! driver: install, bounded-wait read into 32-bit frames, DMA zeroing,
//! uninstall.

use std::time::Duration;

/// Driver status codes for failed operations.
///
/// The capture engine classifies these into transient/permanent/fatal; the
/// driver itself only reports what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverFault {
    NoMemory,
    InvalidState,
    Timeout,
    InvalidArg,
    NotFound,
    GenericFail,
    /// Any other vendor code, carried through for the log line.
    Other(i32),
}

/// Bit-clock, word-select and data-in pins for the microphone wiring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinTriple {
    pub bclk: u8,
    pub ws: u8,
    pub data_in: u8,
}

impl Default for PinTriple {
    fn default() -> Self {
        Self {
            bclk: 26,
            ws: 25,
            data_in: 33,
        }
    }
}

/// Install-time driver geometry.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub sample_rate: u32,
    pub dma_buf_count: u32,
    pub dma_buf_len: u32,
    /// Audio PLL for the bit clock; the engine retries without it when the
    /// first install fails.
    pub use_apll: bool,
    pub pins: PinTriple,
}

impl DriverConfig {
    pub fn from_capture(cfg: &crate::config::CaptureConfig) -> Self {
        Self {
            sample_rate: cfg.sample_rate,
            dma_buf_count: cfg.dma_buf_count,
            dma_buf_len: cfg.dma_buf_len,
            use_apll: true,
            pins: PinTriple::default(),
        }
    }
}

/// Receive-only, master-clock, 32-bit-frame, left-channel capture driver.
pub trait CaptureDriver {
    fn install(&mut self, cfg: &DriverConfig) -> Result<(), DriverFault>;

    /// Clear staged DMA contents (removes installation noise).
    fn zero_dma(&mut self);

    /// Blocking read of up to `dest.len()` 32-bit frames, bounded by
    /// `timeout`. Returns the number of **bytes** staged into `dest`.
    fn read(&mut self, dest: &mut [i32], timeout: Duration) -> Result<usize, DriverFault>;

    fn uninstall(&mut self);
}
