//! Completions: one unit of asynchronous work plus its callback and the
//! loop-private state that tracks it.
//!
//! # Ownership
//!
//! Completion storage is caller-owned. The loop holds a completion by raw
//! pointer from [`Loop::add`](super::Loop::add) until its terminal callback
//! returns [`CallbackAction::Disarm`]; rearming extends the loan. A
//! completion must not be moved or mutated while its state is not
//! [`State::Dead`].

use core::ffi::c_void;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::AtomicBool;

use crate::stdx::{HeapLink, HeapNode, QueueLink, QueueNode};

use super::Loop;
use super::host;

/// Queue tag: a completion is in at most one loop FIFO (submissions or async
/// waiters) at a time.
pub(crate) enum LoopTag {}

/// Heap tag for pending timers.
pub(crate) enum TimerTag {}

/// Inline buffer length for the fixed-array buffer variants.
pub const INLINE_BUFFER_LEN: usize = 32;

const _: () = assert!(INLINE_BUFFER_LEN > 0);

/// Callback-returned decision: retire the completion or schedule it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// The completion is finished; the loop drops its reference.
    Disarm,
    /// Queue the completion again. From within a tick this re-enters the
    /// loop's per-kind structure directly; from a synchronous completion it
    /// defers to the next tick.
    Rearm,
}

/// Completion callback. Runs on the loop thread, inline within `tick`.
///
/// The result's variant always matches the completion's operation variant.
pub type Callback =
    fn(userdata: *mut c_void, ev_loop: &mut Loop, completion: *mut Completion, result: OpResult) -> CallbackAction;

/// A callback that ignores its result and disarms.
pub fn noop_callback(
    _userdata: *mut c_void,
    _ev_loop: &mut Loop,
    _completion: *mut Completion,
    _result: OpResult,
) -> CallbackAction {
    CallbackAction::Disarm
}

/// Lifecycle state of a [`Completion`]. Transitions are driven exclusively
/// by the loop on its owning thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not owned by the loop. Initial and terminal state.
    Dead,
    /// Submitted via `add`, awaiting the next tick's start.
    Adding,
    /// Cancelled while still queued; the submission drain finalizes it.
    Deleting,
    /// Started: in the batch, the timer heap, or the async waiter list.
    Active,
    /// Readiness fired; the blocking completion syscall is running.
    InProgress,
}

/// Destination for read/recv: a caller-owned byte region or a small inline
/// array stored in the operation itself.
///
/// The slice variant stores a raw pointer; the region must stay valid and
/// pinned until the completion's callback has run.
pub enum ReadBuffer {
    Slice { ptr: NonNull<u8>, len: usize },
    Array([u8; INLINE_BUFFER_LEN]),
}

impl ReadBuffer {
    /// Borrow a caller-owned region.
    ///
    /// # Panics
    ///
    /// Panics on an empty slice.
    pub fn slice(buf: &mut [u8]) -> Self {
        let ptr = NonNull::new(buf.as_mut_ptr()).expect("buf must not be null");
        assert!(!buf.is_empty(), "read buffer must not be empty");

        Self::Slice {
            ptr,
            len: buf.len(),
        }
    }

    /// Inline zeroed array buffer.
    pub fn array() -> Self {
        Self::Array([0; INLINE_BUFFER_LEN])
    }

    /// The first `n` bytes of the buffer, where `n` came from the operation's
    /// result.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the buffer length.
    pub fn filled(&self, n: usize) -> &[u8] {
        match self {
            Self::Slice { ptr, len } => {
                assert!(n <= *len);
                // SAFETY: the caller-owned region is valid for `len` bytes
                // while the completion is loaned out.
                unsafe { core::slice::from_raw_parts(ptr.as_ptr(), n) }
            }
            Self::Array(bytes) => {
                assert!(n <= bytes.len());
                &bytes[..n]
            }
        }
    }

    fn raw_parts_mut(&mut self) -> (*mut u8, usize) {
        match self {
            Self::Slice { ptr, len } => (ptr.as_ptr(), *len),
            Self::Array(bytes) => (bytes.as_mut_ptr(), bytes.len()),
        }
    }
}

/// Source for write/send; mirrors [`ReadBuffer`], with an explicit length on
/// the inline variant.
pub enum WriteBuffer {
    Slice { ptr: NonNull<u8>, len: usize },
    Array {
        bytes: [u8; INLINE_BUFFER_LEN],
        len: usize,
    },
}

impl WriteBuffer {
    /// Borrow a caller-owned region.
    ///
    /// # Panics
    ///
    /// Panics on an empty slice.
    pub fn slice(buf: &[u8]) -> Self {
        let ptr = NonNull::new(buf.as_ptr() as *mut u8).expect("buf must not be null");
        assert!(!buf.is_empty(), "write buffer must not be empty");

        Self::Slice {
            ptr,
            len: buf.len(),
        }
    }

    /// Inline buffer holding a copy of `src`.
    ///
    /// # Panics
    ///
    /// Panics if `src` exceeds [`INLINE_BUFFER_LEN`].
    pub fn array(src: &[u8]) -> Self {
        assert!(src.len() <= INLINE_BUFFER_LEN);

        let mut bytes = [0; INLINE_BUFFER_LEN];
        bytes[..src.len()].copy_from_slice(src);

        Self::Array {
            bytes,
            len: src.len(),
        }
    }

    fn raw_parts(&self) -> (*const u8, usize) {
        match self {
            Self::Slice { ptr, len } => (ptr.as_ptr(), *len),
            Self::Array { bytes, len } => {
                assert!(*len <= bytes.len());
                (bytes.as_ptr(), *len)
            }
        }
    }
}

/// Socket shutdown direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Both,
    Recv,
    Send,
}

impl ShutdownHow {
    pub(crate) fn sdflags(self) -> wasi::Sdflags {
        match self {
            Self::Both => wasi::SDFLAGS_WR | wasi::SDFLAGS_RD,
            Self::Recv => wasi::SDFLAGS_RD,
            Self::Send => wasi::SDFLAGS_WR,
        }
    }
}

/// Pending timer entry: absolute monotonic deadline plus heap linkage and a
/// back-pointer to the owning completion. The back-pointer is set when the
/// timer is started; the heap linkage alone does not reveal the container.
pub struct Timer {
    deadline_ns: u64,
    pub(crate) link: HeapLink<TimerTag>,
    pub(crate) completion: *mut Completion,
}

impl Timer {
    /// Timer with an absolute deadline on the monotonic clock.
    pub fn new(deadline_ns: u64) -> Self {
        Self {
            deadline_ns,
            link: HeapLink::new(),
            completion: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn deadline_ns(&self) -> u64 {
        self.deadline_ns
    }
}

impl HeapNode<TimerTag> for Timer {
    fn heap_link(&mut self) -> &mut HeapLink<TimerTag> {
        &mut self.link
    }
    fn heap_link_ref(&self) -> &HeapLink<TimerTag> {
        &self.link
    }
    fn heap_key(&self) -> u64 {
        self.deadline_ns
    }
}

/// Describes one asynchronous operation.
///
/// # Buffer Ownership
///
/// `Read`/`Write`/`Recv`/`Send` slice buffers are caller-owned raw regions;
/// they must remain valid and immovable until the callback runs.
pub enum Operation {
    /// Cancel another completion. Only timer targets receive a cancellation
    /// callback; cancelling in-flight I/O or async waiters is not supported.
    Cancel { target: NonNull<Completion> },
    /// Accept one connection once `fd` is readable.
    Accept { fd: wasi::Fd },
    /// Read from `fd` once readable.
    Read { fd: wasi::Fd, buffer: ReadBuffer },
    /// Write to `fd` once writable.
    Write { fd: wasi::Fd, buffer: WriteBuffer },
    /// Receive from socket `fd` once readable.
    Recv { fd: wasi::Fd, buffer: ReadBuffer },
    /// Send on socket `fd` once writable.
    Send { fd: wasi::Fd, buffer: WriteBuffer },
    /// Shut down socket `fd` synchronously at start.
    Shutdown { fd: wasi::Fd, how: ShutdownHow },
    /// Close `fd` synchronously at start.
    Close { fd: wasi::Fd },
    /// Fire at an absolute monotonic deadline.
    Timer(Timer),
    /// Park until another thread calls
    /// [`Loop::async_notify`](super::Loop::async_notify).
    AsyncWait,
}

/// Why a timer callback fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerTrigger {
    /// The deadline passed.
    Expiration,
    /// The timer was cancelled before expiring.
    Cancel,
    /// Reserved; never emitted.
    Request,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelError {
    /// The cancel targeted another cancel.
    InvalidOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptError {
    /// No batch slot was free at submission.
    BatchFull,
    Unexpected(wasi::Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    /// No batch slot was free at submission.
    BatchFull,
    /// Zero bytes transferred.
    Eof,
    Unexpected(wasi::Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// No batch slot was free at submission.
    BatchFull,
    Unexpected(wasi::Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownError {
    Unexpected(wasi::Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseError {
    Unexpected(wasi::Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncError {
    Unexpected(wasi::Errno),
}

impl fmt::Display for CancelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOp => write!(f, "cancel target is itself a cancel"),
        }
    }
}

impl fmt::Display for AcceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchFull => write!(f, "subscription batch is full"),
            Self::Unexpected(errno) => write!(f, "accept failed: {}", errno),
        }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchFull => write!(f, "subscription batch is full"),
            Self::Eof => write!(f, "end of file"),
            Self::Unexpected(errno) => write!(f, "read failed: {}", errno),
        }
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BatchFull => write!(f, "subscription batch is full"),
            Self::Unexpected(errno) => write!(f, "write failed: {}", errno),
        }
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected(errno) => write!(f, "shutdown failed: {}", errno),
        }
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected(errno) => write!(f, "close failed: {}", errno),
        }
    }
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected(errno) => write!(f, "async wait failed: {}", errno),
        }
    }
}

impl std::error::Error for CancelError {}
impl std::error::Error for AcceptError {}
impl std::error::Error for ReadError {}
impl std::error::Error for WriteError {}
impl std::error::Error for ShutdownError {}
impl std::error::Error for CloseError {}
impl std::error::Error for AsyncError {}

/// Result delivered to a completion's callback. The variant always equals
/// the completion's operation variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpResult {
    Cancel(Result<(), CancelError>),
    Accept(Result<wasi::Fd, AcceptError>),
    Read(Result<usize, ReadError>),
    Write(Result<usize, WriteError>),
    Recv(Result<usize, ReadError>),
    Send(Result<usize, WriteError>),
    Shutdown(Result<(), ShutdownError>),
    Close(Result<(), CloseError>),
    Timer(TimerTrigger),
    AsyncWait(Result<(), AsyncError>),
}

/// One unit of asynchronous work: the operation, the callback that receives
/// its result, and the loop-private bookkeeping that threads it through the
/// submission FIFO, the batch, the timer heap, or the async waiter list.
pub struct Completion {
    /// The operation to perform.
    pub op: Operation,
    /// Opaque pointer passed untouched to the callback.
    pub userdata: *mut c_void,
    /// Invoked exactly once per dispatch with the operation's result.
    pub callback: Callback,

    pub(crate) link: QueueLink<Completion, LoopTag>,
    pub(crate) state: State,
    /// Slot in the subscription batch; 0 means "not in the batch".
    pub(crate) batch_idx: u32,
    /// Per-waiter wakeup flag, set by `async_notify` from any thread. Lives
    /// outside [`Operation`] so cross-thread stores never project through the
    /// enum.
    pub(crate) wakeup: AtomicBool,
}

impl Completion {
    /// Creates a completion in the `Dead` state, ready for `add`.
    pub fn new(op: Operation, userdata: *mut c_void, callback: Callback) -> Self {
        Self {
            op,
            userdata,
            callback,
            link: QueueLink::new(),
            state: State::Dead,
            batch_idx: 0,
            wakeup: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn is_dead(&self) -> bool {
        self.state == State::Dead
    }

    /// Builds this operation's readiness subscription. Userdata carries the
    /// completion's own address for demultiplexing.
    ///
    /// Only defined for operations that reach the poll path.
    pub(crate) fn subscription(&self) -> wasi::Subscription {
        let userdata = self as *const Completion as usize as u64;
        assert!(userdata != 0);

        let (tag, fd) = match self.op {
            Operation::Accept { fd } | Operation::Read { fd, .. } | Operation::Recv { fd, .. } => {
                (wasi::EVENTTYPE_FD_READ.raw(), fd)
            }
            Operation::Write { fd, .. } | Operation::Send { fd, .. } => {
                (wasi::EVENTTYPE_FD_WRITE.raw(), fd)
            }
            _ => unreachable!("subscription on a non-pollable operation"),
        };

        wasi::Subscription {
            userdata,
            u: wasi::SubscriptionU {
                tag,
                u: wasi::SubscriptionUU {
                    fd_read: wasi::SubscriptionFdReadwrite {
                        file_descriptor: fd,
                    },
                },
            },
        }
    }

    /// Executes the blocking syscall once readiness has fired and maps the
    /// outcome into this operation's result variant.
    ///
    /// Zero bytes transferred on read/recv is reported as `Eof`, never as a
    /// zero-length success.
    ///
    /// Only defined for operations that reach the poll path.
    pub(crate) fn perform(&mut self) -> OpResult {
        match &mut self.op {
            Operation::Accept { fd } => {
                OpResult::Accept(host::accept(*fd).map_err(AcceptError::Unexpected))
            }
            Operation::Read { fd, buffer } => {
                let (ptr, len) = buffer.raw_parts_mut();
                // SAFETY: the buffer is pinned for the loan; see ReadBuffer.
                OpResult::Read(match unsafe { host::read(*fd, ptr, len) } {
                    Ok(0) => Err(ReadError::Eof),
                    Ok(n) => Ok(n),
                    Err(errno) => Err(ReadError::Unexpected(errno)),
                })
            }
            Operation::Recv { fd, buffer } => {
                let (ptr, len) = buffer.raw_parts_mut();
                // SAFETY: the buffer is pinned for the loan; see ReadBuffer.
                OpResult::Recv(match unsafe { host::recv(*fd, ptr, len) } {
                    Ok(0) => Err(ReadError::Eof),
                    Ok(n) => Ok(n),
                    Err(errno) => Err(ReadError::Unexpected(errno)),
                })
            }
            Operation::Write { fd, buffer } => {
                let (ptr, len) = buffer.raw_parts();
                // SAFETY: the buffer is pinned for the loan; see WriteBuffer.
                OpResult::Write(unsafe { host::write(*fd, ptr, len) }.map_err(WriteError::Unexpected))
            }
            Operation::Send { fd, buffer } => {
                let (ptr, len) = buffer.raw_parts();
                // SAFETY: the buffer is pinned for the loan; see WriteBuffer.
                OpResult::Send(unsafe { host::send(*fd, ptr, len) }.map_err(WriteError::Unexpected))
            }
            _ => unreachable!("perform on a non-pollable operation"),
        }
    }

    /// The BatchFull refusal in this operation's result variant.
    pub(crate) fn batch_full_result(&self) -> OpResult {
        match self.op {
            Operation::Accept { .. } => OpResult::Accept(Err(AcceptError::BatchFull)),
            Operation::Read { .. } => OpResult::Read(Err(ReadError::BatchFull)),
            Operation::Recv { .. } => OpResult::Recv(Err(ReadError::BatchFull)),
            Operation::Write { .. } => OpResult::Write(Err(WriteError::BatchFull)),
            Operation::Send { .. } => OpResult::Send(Err(WriteError::BatchFull)),
            _ => unreachable!("batch refusal on a non-pollable operation"),
        }
    }
}

impl QueueNode<LoopTag> for Completion {
    fn queue_link(&mut self) -> &mut QueueLink<Self, LoopTag> {
        &mut self.link
    }

    fn queue_link_ref(&self) -> &QueueLink<Self, LoopTag> {
        &self.link
    }
}
