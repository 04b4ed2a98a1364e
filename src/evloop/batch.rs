//! Fixed-capacity subscription batch handed to `poll_oneoff` each tick.
//!
//! Slot 0 is permanently reserved for the per-tick clock subscription that
//! bounds the wait; user slots are kept contiguous in `[1, len)` by swapping
//! the last occupied slot into any freed hole.

use super::completion::Completion;

/// Refusal: no free user slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatchFull;

pub struct Batch {
    subs: [wasi::Subscription; Self::CAPACITY],
    /// High-water mark: slots `[0, len)` are occupied.
    len: usize,
}

impl Batch {
    /// Total slots, including the reserved clock slot 0.
    pub const CAPACITY: usize = 1024;

    const _CAPACITY_FITS_U32: () = assert!(Self::CAPACITY <= u32::MAX as usize);

    pub(crate) fn new() -> Self {
        // SAFETY: Subscription is a plain C struct; all-zero bits are a valid
        // value (a relative clock subscription with userdata 0).
        let subs = unsafe { core::mem::zeroed() };

        Self { subs, len: 1 }
    }

    /// Occupied slot count, always at least 1 for the clock slot.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        assert!(self.len >= 1);
        assert!(self.len <= Self::CAPACITY);

        self.len
    }

    /// The occupied prefix, ready to hand to the poll call.
    #[inline]
    pub(crate) fn slots(&self) -> &[wasi::Subscription] {
        &self.subs[..self.len()]
    }

    /// Installs this tick's clock subscription in slot 0.
    pub(crate) fn set_clock(&mut self, sub: wasi::Subscription) {
        assert!(sub.userdata == 0);
        assert!(sub.u.tag == wasi::EVENTTYPE_CLOCK.raw());

        self.subs[0] = sub;
    }

    /// Reserves a slot for `completion` and returns it for filling.
    ///
    /// On success the completion's batch index records the slot; the caller
    /// writes the subscription (whose userdata must be the completion's
    /// address).
    pub(crate) fn get(&mut self, completion: &mut Completion) -> Result<&mut wasi::Subscription, BatchFull> {
        assert!(completion.batch_idx == 0, "completion already in the batch");

        if self.len == Self::CAPACITY {
            return Err(BatchFull);
        }

        let idx = self.len;
        assert!(idx >= 1);

        completion.batch_idx = idx as u32;
        self.len += 1;

        Ok(&mut self.subs[idx])
    }

    /// Releases `completion`'s slot, swapping the last occupied slot into the
    /// hole and updating the displaced completion's batch index.
    pub(crate) fn put(&mut self, completion: &mut Completion) {
        let old_len = self.len;
        let idx = completion.batch_idx as usize;

        assert!(idx >= 1, "completion not in the batch");
        assert!(idx < old_len);

        let last = old_len - 1;
        if idx != last {
            self.subs[idx] = self.subs[last];

            let moved = self.subs[idx].userdata as usize as *mut Completion;
            assert!(!moved.is_null());
            assert!(moved != completion as *mut Completion);

            // SAFETY: userdata of every user slot is the address of a live,
            // loaned completion.
            unsafe { (*moved).batch_idx = idx as u32 };
        }

        self.len = last;
        completion.batch_idx = 0;

        assert!(self.len == old_len - 1);
        assert!(self.len >= 1);
    }
}
