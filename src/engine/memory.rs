//! Test pattern and buffer allocation for the RAM write/verify cycle.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use super::EngineError;

/// Deterministic pseudo-random byte for position `index` within a buffer.
#[inline]
pub fn pattern_byte(index: usize) -> u8 {
    (index.wrapping_mul(31).wrapping_add(17) & 0xFF) as u8
}

/// Replace the contents of `buf` with `len` pattern bytes.
pub fn fill_pattern(buf: &mut Vec<u8>, len: usize) {
    buf.clear();
    buf.extend((0..len).map(pattern_byte));
}

/// First differing byte of a buffer, plus how many bytes differ in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub index: usize,
    pub expected: u8,
    pub found: u8,
    pub count: usize,
}

/// Compare `buf` against the pattern.
pub fn verify_pattern(buf: &[u8]) -> Option<Mismatch> {
    let mut first: Option<Mismatch> = None;
    let mut count = 0usize;
    for (index, &found) in buf.iter().enumerate() {
        let expected = pattern_byte(index);
        if found != expected {
            count += 1;
            first.get_or_insert(Mismatch {
                index,
                expected,
                found,
                count: 0,
            });
        }
    }
    first.map(|m| Mismatch { count, ..m })
}

/// Where chunk buffers come from.
///
/// `after_write` runs between the pattern write and the read-back; real
/// providers leave it alone, fault injection uses it.
pub trait BufferProvider: Send + Sync {
    /// An empty buffer with capacity for at least `len` bytes.
    fn allocate(&self, len: usize) -> Result<Vec<u8>, EngineError>;

    fn after_write(&self, _pass: u32, _offset: u64, _buf: &mut [u8]) {}
}

/// Plain heap buffers. Allocation failure is reported instead of aborting
/// the process.
pub struct HeapBuffers;

impl BufferProvider for HeapBuffers {
    fn allocate(&self, len: usize) -> Result<Vec<u8>, EngineError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|e| EngineError::Allocation {
                bytes: len as u64,
                reason: e.to_string(),
            })?;
        Ok(buf)
    }
}

/// Heap buffers that corrupt one byte at a chosen offset of the first pass,
/// once. Used to prove the verifier catches faults end to end.
pub struct FaultInjection {
    offset: u64,
    armed: AtomicBool,
}

impl FaultInjection {
    pub fn at_offset(offset: u64) -> Self {
        Self {
            offset,
            armed: AtomicBool::new(true),
        }
    }
}

impl BufferProvider for FaultInjection {
    fn allocate(&self, len: usize) -> Result<Vec<u8>, EngineError> {
        HeapBuffers.allocate(len)
    }

    fn after_write(&self, pass: u32, offset: u64, buf: &mut [u8]) {
        if pass != 1 || self.offset < offset {
            return;
        }
        let Ok(index) = usize::try_from(self.offset - offset) else {
            return;
        };
        if index < buf.len() && self.armed.swap(false, Ordering::SeqCst) {
            warn!(offset = self.offset, "injecting memory fault");
            buf[index] = !buf[index];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_values() {
        assert_eq!(pattern_byte(0), 17);
        assert_eq!(pattern_byte(1), 48);
        assert_eq!(pattern_byte(8), (8 * 31 + 17) as u8);
    }

    #[test]
    fn test_fill_and_verify_clean() {
        let mut buf = HeapBuffers.allocate(4096).unwrap();
        assert!(buf.capacity() >= 4096);
        fill_pattern(&mut buf, 4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(verify_pattern(&buf), None);
    }

    #[test]
    fn test_verify_reports_first_mismatch_and_count() {
        let mut buf = Vec::new();
        fill_pattern(&mut buf, 1024);
        buf[100] ^= 0xFF;
        buf[700] ^= 0x01;

        let m = verify_pattern(&buf).unwrap();
        assert_eq!(m.index, 100);
        assert_eq!(m.expected, pattern_byte(100));
        assert_eq!(m.found, !pattern_byte(100));
        assert_eq!(m.count, 2);
    }

    #[test]
    fn test_allocation_failure_is_an_error() {
        let err = HeapBuffers.allocate(usize::MAX).unwrap_err();
        assert!(matches!(err, EngineError::Allocation { .. }));
    }

    #[test]
    fn test_fault_injection_fires_once_in_the_right_chunk() {
        let faults = FaultInjection::at_offset(1030);
        let mut first = Vec::new();
        fill_pattern(&mut first, 1024);
        faults.after_write(1, 0, &mut first);
        assert_eq!(verify_pattern(&first), None);

        let mut second = Vec::new();
        fill_pattern(&mut second, 1024);
        faults.after_write(1, 1024, &mut second);
        assert_eq!(verify_pattern(&second).map(|m| m.index), Some(6));

        let mut again = Vec::new();
        fill_pattern(&mut again, 1024);
        faults.after_write(1, 1024, &mut again);
        assert_eq!(verify_pattern(&again), None);
    }

    #[test]
    fn test_fault_injection_skips_later_passes() {
        let faults = FaultInjection::at_offset(0);
        let mut buf = Vec::new();
        fill_pattern(&mut buf, 64);
        faults.after_write(2, 0, &mut buf);
        assert_eq!(verify_pattern(&buf), None);
    }
}
