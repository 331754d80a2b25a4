//! Capture engine.
//!
//! DMA-driven ingest path: stages 24-in-32-bit microphone frames in a
//! fixed scratch buffer, narrows them to little-endian 16-bit samples,
//! classifies driver failures, and survives driver-state corruption by
//! reinstalling the driver in place. The scratch buffer is allocated once
//! at construction and never grows.

pub mod cpal_driver;
mod driver;

pub use cpal_driver::CpalDriver;
pub use driver::{CaptureDriver, DriverConfig, DriverFault, PinTriple};

use std::time::Duration;

use crate::config::SCRATCH_WORDS;
use crate::stats::Stats;

/// Consecutive-failure budget before the engine reinstalls the driver.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

const READ_TIMEOUT: Duration = Duration::from_millis(1000);
const RETRY_PAUSE: Duration = Duration::from_millis(10);
const REINIT_PAUSE: Duration = Duration::from_millis(100);

/// How a capture failure is recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// May succeed on retry.
    Transient,
    /// Needs driver reinitialization.
    Permanent,
    /// No local recovery; surfaced to the orchestrator.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture driver not installed")]
    NotInstalled,

    #[error("rejected capture configuration: {0}")]
    BadConfig(&'static str),

    #[error("requested {requested} samples exceeds scratch capacity {capacity}")]
    Oversize { requested: usize, capacity: usize },

    #[error("capture driver fault: {0:?}")]
    Driver(DriverFault),

    #[error("capture read returned no data")]
    NoData,

    #[error("capture read returned {bytes} bytes, not a whole number of frames")]
    ShortFrame { bytes: usize },
}

impl CaptureError {
    pub fn class(&self) -> FailureClass {
        match self {
            CaptureError::NotInstalled => FailureClass::Permanent,
            CaptureError::BadConfig(_) => FailureClass::Permanent,
            CaptureError::Oversize { .. } => FailureClass::Permanent,
            CaptureError::NoData => FailureClass::Transient,
            CaptureError::ShortFrame { .. } => FailureClass::Transient,
            CaptureError::Driver(fault) => match fault {
                DriverFault::NoMemory | DriverFault::InvalidState | DriverFault::Timeout => {
                    FailureClass::Transient
                }
                DriverFault::InvalidArg | DriverFault::NotFound | DriverFault::GenericFail => {
                    FailureClass::Permanent
                }
                DriverFault::Other(_) => FailureClass::Fatal,
            },
        }
    }
}

/// Microphone ingest with failure classification and in-place recovery.
pub struct CaptureEngine {
    driver: Box<dyn CaptureDriver>,
    cfg: DriverConfig,
    scratch: Box<[i32]>,
    installed: bool,
    consecutive_errors: u32,
    total_errors: u32,
    transient_errors: u32,
    permanent_errors: u32,
    reinit_count: u32,
    stats: Stats,
}

impl CaptureEngine {
    pub fn new(driver: Box<dyn CaptureDriver>, cfg: DriverConfig, stats: Stats) -> Self {
        Self {
            driver,
            cfg,
            scratch: vec![0i32; SCRATCH_WORDS].into_boxed_slice(),
            installed: false,
            consecutive_errors: 0,
            total_errors: 0,
            transient_errors: 0,
            permanent_errors: 0,
            reinit_count: 0,
            stats,
        }
    }

    /// Install the driver: audio PLL first, one retry without it.
    pub fn initialize(&mut self) -> Result<(), CaptureError> {
        if !(8000..=48_000).contains(&self.cfg.sample_rate) {
            return Err(CaptureError::BadConfig("sample rate outside 8000-48000 Hz"));
        }
        if self.cfg.dma_buf_len == 0 || !self.cfg.dma_buf_len.is_power_of_two() {
            return Err(CaptureError::BadConfig("DMA buffer length not a power of two"));
        }

        tracing::info!(
            sample_rate = self.cfg.sample_rate,
            dma_buf_count = self.cfg.dma_buf_count,
            dma_buf_len = self.cfg.dma_buf_len,
            "initializing capture driver"
        );

        let mut install_cfg = self.cfg.clone();
        install_cfg.use_apll = true;
        if let Err(fault) = self.driver.install(&install_cfg) {
            tracing::error!(?fault, "capture driver install failed with audio PLL");
            install_cfg.use_apll = false;
            match self.driver.install(&install_cfg) {
                Ok(()) => {
                    tracing::warn!("capture driver installed without audio PLL - clock stability reduced")
                }
                Err(fault) => {
                    tracing::error!(?fault, "capture driver install failed");
                    return Err(CaptureError::Driver(fault));
                }
            }
        }

        // Remove installation noise before the first read.
        self.driver.zero_dma();

        self.installed = true;
        self.consecutive_errors = 0;
        tracing::info!("capture driver initialized");
        Ok(())
    }

    pub fn cleanup(&mut self) {
        if !self.installed {
            return;
        }
        tracing::info!("uninstalling capture driver");
        self.driver.uninstall();
        self.installed = false;
    }

    /// Full recovery cycle: uninstall, settle, reinstall.
    pub fn reinitialize(&mut self) -> Result<(), CaptureError> {
        tracing::info!("reinitializing capture driver");
        self.cleanup();
        std::thread::sleep(REINIT_PAUSE);
        self.initialize()?;
        self.reinit_count += 1;
        self.stats.incr_capture_reinits();
        self.consecutive_errors = 0;
        Ok(())
    }

    /// Read one buffer of little-endian 16-bit samples.
    ///
    /// `out.len()` must be even and fit the scratch capacity. Returns the
    /// number of bytes produced, which is less than `out.len()` when the
    /// driver short-reads.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize, CaptureError> {
        if !self.installed {
            return Err(self.fail(CaptureError::NotInstalled));
        }
        if out.len() % 2 != 0 || out.len() / 2 > self.scratch.len() {
            let err = CaptureError::Oversize {
                requested: out.len() / 2,
                capacity: self.scratch.len(),
            };
            return Err(self.fail(err));
        }

        let words = out.len() / 2;
        let bytes = match self.driver.read(&mut self.scratch[..words], READ_TIMEOUT) {
            Ok(bytes) => bytes,
            Err(fault) => return Err(self.fail(CaptureError::Driver(fault))),
        };

        if bytes == 0 {
            return Err(self.fail(CaptureError::NoData));
        }
        if bytes % 4 != 0 {
            // A read must stage whole 32-bit frames; a torn frame is
            // skipped, not narrowed.
            return Err(self.fail(CaptureError::ShortFrame { bytes }));
        }

        // The 24-bit sample sits in the upper bits of each 32-bit frame;
        // keep the most significant 16.
        let words_read = bytes / 4;
        for (i, &word) in self.scratch[..words_read].iter().enumerate() {
            let sample = (word >> 16) as i16;
            out[2 * i..2 * i + 2].copy_from_slice(&sample.to_le_bytes());
        }

        self.consecutive_errors = 0;
        Ok(words_read * 2)
    }

    /// Read with bounded retries, reinstalling the driver once the
    /// consecutive-failure budget is blown.
    pub fn read_with_retry(&mut self, out: &mut [u8], max_attempts: u32) -> Result<usize, CaptureError> {
        let mut last_err = CaptureError::NoData;

        for attempt in 1..=max_attempts.max(1) {
            match self.read(out) {
                Ok(n) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "capture read succeeded after retries");
                    }
                    return Ok(n);
                }
                Err(err) => {
                    tracing::warn!(attempt, max_attempts, %err, "capture read attempt failed");
                    last_err = err;
                }
            }

            if self.consecutive_errors > MAX_CONSECUTIVE_FAILURES {
                tracing::error!(
                    consecutive = self.consecutive_errors,
                    "too many consecutive capture errors - reinitializing driver"
                );
                if self.reinitialize().is_ok() {
                    tracing::info!("capture driver reinitialized, retrying read");
                    if let Ok(n) = self.read(out) {
                        return Ok(n);
                    }
                }
            }

            std::thread::sleep(RETRY_PAUSE);
        }

        Err(last_err)
    }

    /// False when uninstalled, error-looping, or dominated by permanent
    /// failures.
    pub fn is_healthy(&self) -> bool {
        if !self.installed {
            return false;
        }
        if self.consecutive_errors > MAX_CONSECUTIVE_FAILURES / 2 {
            return false;
        }
        if self.total_errors > 100 && self.permanent_errors * 100 / self.total_errors > 20 {
            return false;
        }
        true
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn total_errors(&self) -> u32 {
        self.total_errors
    }

    pub fn transient_errors(&self) -> u32 {
        self.transient_errors
    }

    pub fn permanent_errors(&self) -> u32 {
        self.permanent_errors
    }

    pub fn reinit_count(&self) -> u32 {
        self.reinit_count
    }

    /// Account a failure and hand the error back for propagation.
    fn fail(&mut self, err: CaptureError) -> CaptureError {
        self.total_errors += 1;
        self.consecutive_errors += 1;
        match err.class() {
            FailureClass::Transient => {
                self.transient_errors += 1;
                self.stats.record_capture_transient();
                tracing::warn!(%err, "transient capture failure - retry may succeed");
            }
            FailureClass::Permanent => {
                self.permanent_errors += 1;
                self.stats.record_capture_permanent();
                tracing::error!(%err, "permanent capture failure - reinitialization recommended");
            }
            FailureClass::Fatal => {
                self.stats.record_capture_fatal();
                tracing::error!(%err, "fatal capture failure - recovery unlikely");
            }
        }
        err
    }
}
