//! Host microphone driver.
//!
//! Implements the capture seam on top of cpal so the node runs against a
//! workstation microphone. The cpal callback plays the role of the DMA
//! engine: it runs in a vendor context, folds the input to mono, widens
//! samples into the 24-in-32-bit staging format, and pushes frames into a
//! bounded channel sized like the DMA ring. A full ring drops frames, which
//! is a recoverable event, not a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::driver::{CaptureDriver, DriverConfig, DriverFault};

/// Cadence of the audio-level diagnostic in the callback.
const LEVEL_LOG_PERIOD: Duration = Duration::from_secs(15);

pub struct CpalDriver {
    stream: Option<cpal::Stream>,
    frames: Option<Receiver<i32>>,
    stop_flag: Arc<AtomicBool>,
}

impl CpalDriver {
    pub fn new() -> Self {
        Self {
            stream: None,
            frames: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_stream(
        &self,
        cfg: &DriverConfig,
        frame_tx: SyncSender<i32>,
    ) -> Result<cpal::Stream, DriverFault> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(DriverFault::NotFound)?;

        let device_config = device.default_input_config().map_err(|e| {
            tracing::error!("failed to query input config: {e}");
            DriverFault::GenericFail
        })?;

        if device_config.sample_format() != cpal::SampleFormat::F32 {
            tracing::error!(
                format = ?device_config.sample_format(),
                "input device does not produce f32 samples"
            );
            return Err(DriverFault::InvalidArg);
        }

        let device_rate = device_config.sample_rate().0;
        if device_rate != cfg.sample_rate {
            tracing::warn!(
                device_rate,
                configured_rate = cfg.sample_rate,
                "input device rate differs from configured capture rate"
            );
        }

        let stream_config: cpal::StreamConfig = device_config.into();
        let channels = stream_config.channels as usize;
        let stop_flag = self.stop_flag.clone();

        let mut last_level_log = Instant::now();
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if stop_flag.load(Ordering::Acquire) {
                        return;
                    }

                    let mut sum_squares = 0.0f32;
                    let mut frame_count = 0usize;

                    for frame in data.chunks(channels) {
                        let mono = frame.iter().sum::<f32>() / channels as f32;
                        sum_squares += mono * mono;
                        frame_count += 1;

                        // Same staging shape as the hardware path: the
                        // 16 significant bits ride in the upper half.
                        let sample = (mono.clamp(-1.0, 1.0) * 32767.0) as i16;
                        let word = (sample as i32) << 16;
                        match frame_tx.try_send(word) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => break, // ring overrun, drop the rest
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }

                    if last_level_log.elapsed() >= LEVEL_LOG_PERIOD && frame_count > 0 {
                        let rms = (sum_squares / frame_count as f32).sqrt();
                        if rms < 0.001 {
                            tracing::warn!("audio input is silent - check microphone selection and mute");
                        } else {
                            tracing::debug!(rms, "audio input level");
                        }
                        last_level_log = Instant::now();
                    }
                },
                move |err| {
                    tracing::error!("audio stream error: {err}");
                },
                None,
            )
            .map_err(|e| {
                tracing::error!("failed to build input stream: {e}");
                DriverFault::GenericFail
            })?;

        stream.play().map_err(|e| {
            tracing::error!("failed to start input stream: {e}");
            DriverFault::InvalidState
        })?;

        Ok(stream)
    }
}

impl Default for CpalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDriver for CpalDriver {
    fn install(&mut self, cfg: &DriverConfig) -> Result<(), DriverFault> {
        // Ring capacity matches the DMA geometry.
        let capacity = (cfg.dma_buf_count * cfg.dma_buf_len) as usize;
        let (frame_tx, frame_rx) = mpsc::sync_channel::<i32>(capacity.max(1));

        self.stop_flag.store(false, Ordering::Release);
        let stream = self.build_stream(cfg, frame_tx)?;

        self.stream = Some(stream);
        self.frames = Some(frame_rx);
        Ok(())
    }

    fn zero_dma(&mut self) {
        if let Some(frames) = &self.frames {
            while frames.try_recv().is_ok() {}
        }
    }

    fn read(&mut self, dest: &mut [i32], timeout: Duration) -> Result<usize, DriverFault> {
        let frames = self.frames.as_ref().ok_or(DriverFault::InvalidState)?;
        if dest.is_empty() {
            return Ok(0);
        }

        // Block for the first frame only; after that, drain what is ready.
        dest[0] = match frames.recv_timeout(timeout) {
            Ok(word) => word,
            Err(RecvTimeoutError::Timeout) => return Err(DriverFault::Timeout),
            Err(RecvTimeoutError::Disconnected) => return Err(DriverFault::InvalidState),
        };

        let mut staged = 1;
        while staged < dest.len() {
            match frames.try_recv() {
                Ok(word) => {
                    dest[staged] = word;
                    staged += 1;
                }
                Err(_) => break,
            }
        }

        Ok(staged * 4)
    }

    fn uninstall(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);
        }
        self.frames = None;
    }
}
