//! The sampling loop: runs on the caller's thread while load is applied and
//! appends samples in strict chronological order.

use std::any::Any;
use std::hint::black_box;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::cancel::CancellationToken;
use super::memory::{self, BufferProvider, Mismatch};
use super::meter::{ThermalSource, UtilizationSource};
use super::sample::{CpuSample, ErrorOrigin, ErrorSample, RamSample, Sample};
use super::{EngineError, Progress};

/// Single-producer sample sequence and error list of one run, plus the
/// caller's progress hook.
pub struct SampleLog<'a> {
    samples: Vec<Sample>,
    errors: Vec<String>,
    progress: Option<Progress<'a>>,
}

impl<'a> SampleLog<'a> {
    pub fn new(progress: Option<Progress<'a>>) -> Self {
        Self {
            samples: Vec::new(),
            errors: Vec::new(),
            progress,
        }
    }

    /// Append a measurement and hand it to the progress hook. A hook that
    /// fails or panics gets an error entry in the samples; the run goes on.
    pub fn emit(&mut self, sample: Sample) {
        self.samples.push(sample);

        let Some(progress) = self.progress.as_mut() else {
            return;
        };
        let Some(latest) = self.samples.last() else {
            return;
        };

        let failure = match panic::catch_unwind(AssertUnwindSafe(|| (*progress)(latest))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("progress callback failed: {e:#}")),
            Err(payload) => Some(format!(
                "progress callback panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        if let Some(error) = failure {
            warn!(%error, "ignoring progress callback fault");
            self.samples.push(Sample::Error(ErrorSample {
                timestamp: Utc::now(),
                error,
                origin: ErrorOrigin::Callback,
            }));
        }
    }

    /// A tick that produced no measurement. Counts against the run status.
    pub fn tick_failed(&mut self, error: String) {
        warn!(%error, "sampling tick failed");
        self.errors.push(error.clone());
        self.samples.push(Sample::Error(ErrorSample {
            timestamp: Utc::now(),
            error,
            origin: ErrorOrigin::Tick,
        }));
    }

    /// A fault that is reported in the result without a sample entry.
    pub fn error(&mut self, error: String) {
        warn!(%error, "load test fault");
        self.errors.push(error);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn into_parts(self) -> (Vec<Sample>, Vec<String>) {
        (self.samples, self.errors)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fixed-cadence CPU utilization sampling.
pub struct CpuSampler<'m> {
    meter: &'m mut dyn UtilizationSource,
    thermal: &'m dyn ThermalSource,
}

impl<'m> CpuSampler<'m> {
    pub fn new(meter: &'m mut dyn UtilizationSource, thermal: &'m dyn ThermalSource) -> Self {
        Self { meter, thermal }
    }

    /// Sample every `interval` until `deadline` or cancellation. Windows are
    /// never shorter than the meter's minimum, except the final one, which is
    /// cut at the deadline and skipped if that leaves it too short.
    pub fn run(
        &mut self,
        interval: Duration,
        deadline: Instant,
        token: &CancellationToken,
        log: &mut SampleLog<'_>,
    ) {
        let min_window = self.meter.min_window();
        let interval = interval.max(min_window);
        while !token.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let window = interval.min(deadline - now);
            if window < min_window {
                debug!(?window, "remaining window too short to sample");
                break;
            }

            let opened = Instant::now();
            match panic::catch_unwind(AssertUnwindSafe(|| self.tick(window, token))) {
                Ok(Ok(Some(sample))) => {
                    debug!(avg = sample.average_utilization, "cpu sample");
                    log.emit(Sample::Cpu(sample));
                    continue;
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => log.tick_failed(format!("CPU sampling failed: {e}")),
                Err(payload) => log.tick_failed(format!(
                    "CPU sampling panicked: {}",
                    panic_message(payload.as_ref())
                )),
            }
            // Keep the cadence when a tick fails early.
            token.sleep(window.saturating_sub(opened.elapsed()));
        }
    }

    /// Measure one window. `None` when cancellation cut the window too short
    /// to be meaningful.
    fn tick(
        &mut self,
        window: Duration,
        token: &CancellationToken,
    ) -> Result<Option<CpuSample>, EngineError> {
        self.meter.begin()?;
        let opened = Instant::now();
        if !token.sleep(window) && opened.elapsed() < self.meter.min_window() {
            return Ok(None);
        }
        let per_core = self.meter.read()?;

        let temperatures = self.thermal.read();
        let temperatures = (!temperatures.is_empty()).then_some(temperatures);

        Ok(Some(CpuSample::new(Utc::now(), per_core, temperatures)))
    }
}

/// Timing and verification of a single chunk.
struct ChunkReport {
    write: Duration,
    read: Duration,
    mismatch: Option<Mismatch>,
}

/// Allocate / write / verify / free, chunk by chunk, pass by pass.
pub struct RamSampler<'b> {
    buffers: &'b dyn BufferProvider,
}

impl<'b> RamSampler<'b> {
    pub fn new(buffers: &'b dyn BufferProvider) -> Self {
        Self { buffers }
    }

    /// Test `target_bytes` in `chunk_bytes` pieces, `passes` times. Emits one
    /// sample per chunk. Returns the number of allocation failures.
    ///
    /// An allocation failure ends the current pass; a mismatch is recorded
    /// and the pass continues. Cancellation is honored between chunks and
    /// between passes.
    pub fn run(
        &self,
        target_bytes: u64,
        chunk_bytes: u64,
        passes: u32,
        token: &CancellationToken,
        log: &mut SampleLog<'_>,
    ) -> usize {
        let mut allocation_failures = 0;

        for pass in 1..=passes {
            if token.is_cancelled() {
                info!(pass, "cancelled before pass");
                break;
            }

            let mut offset = 0u64;
            while offset < target_bytes {
                if token.is_cancelled() {
                    info!(pass, offset, "cancelled mid-pass");
                    break;
                }
                let len = chunk_bytes.min(target_bytes - offset);

                match panic::catch_unwind(AssertUnwindSafe(|| self.test_chunk(pass, offset, len))) {
                    Ok(Ok(chunk)) => {
                        if let Some(m) = chunk.mismatch {
                            log.error(format!(
                                "Pass {}: data mismatch at offset {} (expected 0x{:02x}, found 0x{:02x}; {} byte(s) differ in chunk)",
                                pass,
                                offset + m.index as u64,
                                m.expected,
                                m.found,
                                m.count
                            ));
                        }
                        offset += len;
                        log.emit(Sample::Ram(RamSample {
                            timestamp: Utc::now(),
                            pass_index: pass,
                            cumulative_tested_bytes: offset,
                            chunk_bytes: len,
                            chunk_write_seconds: chunk.write.as_secs_f64(),
                            chunk_read_seconds: chunk.read.as_secs_f64(),
                            verification_ok: chunk.mismatch.is_none(),
                        }));
                    }
                    Ok(Err(e)) => {
                        allocation_failures += 1;
                        log.error(format!(
                            "Pass {}: allocation failed at offset {}: {}",
                            pass, offset, e
                        ));
                        break;
                    }
                    Err(payload) => {
                        log.tick_failed(format!(
                            "Pass {}: chunk at offset {} panicked: {}",
                            pass,
                            offset,
                            panic_message(payload.as_ref())
                        ));
                        break;
                    }
                }
            }
            debug!(pass, tested = offset, "pass finished");
        }

        allocation_failures
    }

    fn test_chunk(&self, pass: u32, offset: u64, len: u64) -> Result<ChunkReport, EngineError> {
        let size = usize::try_from(len).map_err(|_| EngineError::Allocation {
            bytes: len,
            reason: "chunk larger than address space".into(),
        })?;

        let started = Instant::now();
        let mut buf = self.buffers.allocate(size)?;
        memory::fill_pattern(&mut buf, size);
        self.buffers.after_write(pass, offset, &mut buf);
        let write = started.elapsed();

        let started = Instant::now();
        let mismatch = memory::verify_pattern(black_box(&buf));
        let read = started.elapsed();

        drop(buf);
        Ok(ChunkReport {
            write,
            read,
            mismatch,
        })
    }
}
