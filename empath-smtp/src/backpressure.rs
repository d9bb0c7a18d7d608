//! Bounds how much unprocessed input a single connection is allowed to have
//! buffered at once.
//!
//! The session is a synchronous request/response loop (read a frame, act on
//! it, respond), so the classic "stop reading the socket" backpressure
//! applies mostly to `BDAT` (RFC 3030): a client can declare several large
//! chunks back to back, and without a cap the server would happily buffer
//! all of them before ever looking at one. [`BackpressureController`] gates
//! that with an inflight-byte budget; `autoRead` watermark bookkeeping is
//! tracked alongside it for observability and for non-BDAT paths that may
//! grow to need it, without changing read-loop behaviour today.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Byte budget for data a connection may have in flight (buffered but not
/// yet handed to a handler) at once, across `BDAT` chunks.
const DEFAULT_MAX_INFLIGHT: usize = 16 * 1024 * 1024;

/// High-water mark: once queued-but-unread bytes cross this, the connection
/// is considered under backpressure (bookkeeping only; see module docs).
const DEFAULT_HIGH_WATERMARK: usize = 4 * 1024 * 1024;

/// Low-water mark: once queued bytes drop back below this, backpressure is
/// considered relieved.
const DEFAULT_LOW_WATERMARK: usize = 1024 * 1024;

/// Per-connection backpressure state.
#[derive(Debug)]
pub struct BackpressureController {
    max_inflight: usize,
    high_watermark: usize,
    low_watermark: usize,
    inflight: AtomicUsize,
    queued: AtomicUsize,
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INFLIGHT, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
    }
}

impl BackpressureController {
    #[must_use]
    pub const fn new(max_inflight: usize, high_watermark: usize, low_watermark: usize) -> Self {
        Self {
            max_inflight,
            high_watermark,
            low_watermark,
            inflight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    /// Try to reserve `size` bytes of inflight budget for a `BDAT` chunk.
    ///
    /// Returns `false` (and reserves nothing) if granting it would exceed
    /// `max_inflight`; the caller should reject the `BDAT` command (421) and
    /// close rather than start buffering a chunk it can't bound.
    pub fn try_reserve_inflight(&self, size: usize) -> bool {
        loop {
            let current = self.inflight.load(Ordering::Acquire);
            let Some(next) = current.checked_add(size) else {
                return false;
            };
            if next > self.max_inflight {
                return false;
            }
            if self
                .inflight
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release a previously-reserved chunk once it has been fully received
    /// and handed off.
    pub fn release_inflight(&self, size: usize) {
        self.inflight.fetch_sub(size, Ordering::AcqRel);
    }

    /// Bytes currently reserved against the inflight budget.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Record that `size` more bytes are sitting in the connection's read
    /// buffer, queued but not yet consumed by a frame.
    pub fn note_queued(&self, size: usize) {
        self.queued.fetch_add(size, Ordering::AcqRel);
    }

    /// Record that `size` bytes have been drained from the read buffer.
    pub fn note_drained(&self, size: usize) {
        self.queued.fetch_sub(size, Ordering::AcqRel);
    }

    /// Whether queued bytes have crossed the high watermark.
    #[must_use]
    pub fn is_over_high_watermark(&self) -> bool {
        self.queued.load(Ordering::Acquire) >= self.high_watermark
    }

    /// Whether queued bytes have dropped back below the low watermark.
    #[must_use]
    pub fn is_under_low_watermark(&self) -> bool {
        self.queued.load(Ordering::Acquire) <= self.low_watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_up_to_the_cap() {
        let controller = BackpressureController::new(100, 50, 10);
        assert!(controller.try_reserve_inflight(60));
        assert!(controller.try_reserve_inflight(40));
        assert_eq!(controller.inflight(), 100);
    }

    #[test]
    fn refuses_a_reservation_that_would_exceed_the_cap() {
        let controller = BackpressureController::new(100, 50, 10);
        assert!(controller.try_reserve_inflight(90));
        assert!(!controller.try_reserve_inflight(20));
        assert_eq!(controller.inflight(), 90);
    }

    #[test]
    fn release_frees_budget_for_later_reservations() {
        let controller = BackpressureController::new(100, 50, 10);
        assert!(controller.try_reserve_inflight(100));
        controller.release_inflight(40);
        assert_eq!(controller.inflight(), 60);
        assert!(controller.try_reserve_inflight(40));
    }

    #[test]
    fn watermarks_track_queued_bytes() {
        let controller = BackpressureController::new(100, 50, 10);
        controller.note_queued(60);
        assert!(controller.is_over_high_watermark());
        controller.note_drained(55);
        assert!(controller.is_under_low_watermark());
    }
}
