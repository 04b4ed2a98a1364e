//! Thin wrappers over the WASI preview-1 syscalls the loop consumes.
//!
//! Readiness operations keep the host errno so per-operation results can map
//! it; loop-fatal calls (clock, poll) surface `io::Error` directly.

use core::mem::MaybeUninit;
use std::io;

/// Precision of the per-tick clock subscription: one millisecond.
pub(crate) const CLOCK_PRECISION_NS: u64 = 1_000_000;

pub(crate) const NS_PER_MS: u64 = 1_000_000;

const _: () = assert!(CLOCK_PRECISION_NS == NS_PER_MS);

pub(crate) fn errno_error(errno: wasi::Errno) -> io::Error {
    io::Error::from_raw_os_error(errno.raw() as i32)
}

/// Current monotonic time in nanoseconds.
pub(crate) fn clock_now() -> io::Result<u64> {
    // SAFETY: clock_time_get takes no memory arguments.
    unsafe { wasi::clock_time_get(wasi::CLOCKID_MONOTONIC, 1) }.map_err(errno_error)
}

/// One multiplexed wait over `subs`. Blocks until at least one subscription
/// fires; the slot-0 clock subscription bounds the sleep.
///
/// Returns the number of events written to the front of `events`.
pub(crate) fn poll(
    subs: &[wasi::Subscription],
    events: &mut [MaybeUninit<wasi::Event>],
) -> io::Result<usize> {
    assert!(!subs.is_empty());
    assert!(events.len() >= subs.len());

    // SAFETY: both pointers are valid for `subs.len()` entries and the host
    // writes at most that many events.
    let n = unsafe {
        wasi::poll_oneoff(
            subs.as_ptr(),
            events.as_mut_ptr() as *mut wasi::Event,
            subs.len(),
        )
    }
    .map_err(errno_error)?;

    assert!(n <= subs.len());
    Ok(n)
}

/// Absolute-deadline clock subscription for batch slot 0. Userdata 0 marks it
/// as the loop's own.
pub(crate) fn clock_subscription(deadline_ns: u64) -> wasi::Subscription {
    wasi::Subscription {
        userdata: 0,
        u: wasi::SubscriptionU {
            tag: wasi::EVENTTYPE_CLOCK.raw(),
            u: wasi::SubscriptionUU {
                clock: wasi::SubscriptionClock {
                    id: wasi::CLOCKID_MONOTONIC,
                    timeout: deadline_ns,
                    precision: CLOCK_PRECISION_NS,
                    flags: wasi::SUBCLOCKFLAGS_SUBSCRIPTION_CLOCK_ABSTIME,
                },
            },
        },
    }
}

/// # Safety
///
/// `buf..buf + len` must be valid for writes for the duration of the call.
pub(crate) unsafe fn read(fd: wasi::Fd, buf: *mut u8, len: usize) -> Result<usize, wasi::Errno> {
    let iovs = [wasi::Iovec { buf, buf_len: len }];
    // SAFETY: caller guarantees the buffer; the iovec array outlives the call.
    unsafe { wasi::fd_read(fd, &iovs) }
}

/// # Safety
///
/// `buf..buf + len` must be valid for reads for the duration of the call.
pub(crate) unsafe fn write(fd: wasi::Fd, buf: *const u8, len: usize) -> Result<usize, wasi::Errno> {
    let iovs = [wasi::Ciovec { buf, buf_len: len }];
    // SAFETY: caller guarantees the buffer; the iovec array outlives the call.
    unsafe { wasi::fd_write(fd, &iovs) }
}

/// # Safety
///
/// `buf..buf + len` must be valid for writes for the duration of the call.
pub(crate) unsafe fn recv(fd: wasi::Fd, buf: *mut u8, len: usize) -> Result<usize, wasi::Errno> {
    let iovs = [wasi::Iovec { buf, buf_len: len }];
    // SAFETY: caller guarantees the buffer; the iovec array outlives the call.
    let (n, _roflags) = unsafe { wasi::sock_recv(fd, &iovs, 0) }?;
    Ok(n)
}

/// # Safety
///
/// `buf..buf + len` must be valid for reads for the duration of the call.
pub(crate) unsafe fn send(fd: wasi::Fd, buf: *const u8, len: usize) -> Result<usize, wasi::Errno> {
    let iovs = [wasi::Ciovec { buf, buf_len: len }];
    // SAFETY: caller guarantees the buffer; the iovec array outlives the call.
    unsafe { wasi::sock_send(fd, &iovs, 0) }
}

pub(crate) fn accept(fd: wasi::Fd) -> Result<wasi::Fd, wasi::Errno> {
    // SAFETY: no memory arguments.
    unsafe { wasi::sock_accept(fd, 0) }
}

pub(crate) fn shutdown(fd: wasi::Fd, how: wasi::Sdflags) -> Result<(), wasi::Errno> {
    // SAFETY: no memory arguments.
    unsafe { wasi::sock_shutdown(fd, how) }
}

pub(crate) fn close(fd: wasi::Fd) -> Result<(), wasi::Errno> {
    // SAFETY: no memory arguments; ownership of the descriptor is the
    // caller's concern.
    unsafe { wasi::fd_close(fd) }
}
