//! # Message Frames

use kernel_addr::FrameNumber;
use kernel_sched::TaskId;
use kernel_vmem::PhysAccess;

/// Maximum payload carried by one message.
pub const MAX_PAYLOAD: usize = kernel_addr::layout::IPC_MAX_PAYLOAD;

/// Byte offset of the payload within a message frame.
const PAYLOAD_OFFSET: usize = 64;

/// Queue-link terminator.
pub(crate) const NIL: u64 = u64::MAX;

/// Classification of a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Data = 0,
    System = 1,
    Terminal = 2,
    Service = 3,
}

impl MessageType {
    pub(crate) const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::System,
            2 => Self::Terminal,
            3 => Self::Service,
            _ => Self::Data,
        }
    }
}

bitflags::bitflags! {
    /// Delivery-behaviour flags of a message.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct MessageFlags: u32 {
        /// Sender parks until the queue has room.
        const BLOCKING = 1;
        /// Fail with `QueueFull` instead of waiting.
        const NON_BLOCKING = 2;
        /// Delivery hint; carried, not yet interpreted.
        const URGENT = 4;
    }
}

/// Metadata returned with a received payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RecvInfo {
    pub len: usize,
    pub mtype: MessageType,
    pub flags: MessageFlags,
    /// Sending task; `None` for kernel-originated messages.
    pub sender: Option<TaskId>,
    /// Capture time of the message, in uptime milliseconds.
    pub timestamp_ms: u64,
}

/// On-frame message header. The payload follows at [`PAYLOAD_OFFSET`].
#[repr(C)]
pub(crate) struct MessageHeader {
    /// Frame number of the next queued message, or [`NIL`].
    pub next: u64,
    pub len: u32,
    pub mtype: u32,
    pub flags: u32,
    _reserved: u32,
    /// Raw sender task id; 0 when kernel-originated.
    pub sender: u64,
    pub timestamp_ms: u64,
}

impl MessageHeader {
    pub(crate) fn info(&self) -> RecvInfo {
        RecvInfo {
            len: self.len as usize,
            mtype: MessageType::from_raw(self.mtype),
            flags: MessageFlags::from_bits_truncate(self.flags),
            sender: (self.sender != 0).then(|| TaskId::new(self.sender)),
            timestamp_ms: self.timestamp_ms,
        }
    }
}

/// Borrow the header stored in a message frame.
pub(crate) unsafe fn header_mut<'a, M: PhysAccess>(
    m: &M,
    frame: FrameNumber,
) -> &'a mut MessageHeader {
    unsafe { m.phys_to_mut::<MessageHeader>(frame.base()) }
}

/// Write a fresh message into `frame`.
pub(crate) fn write_message<M: PhysAccess>(
    m: &M,
    frame: FrameNumber,
    payload: &[u8],
    mtype: MessageType,
    flags: MessageFlags,
    sender: Option<TaskId>,
    timestamp_ms: u64,
) {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let header = unsafe { header_mut(m, frame) };
    *header = MessageHeader {
        next: NIL,
        len: payload.len() as u32,
        mtype: mtype as u32,
        flags: flags.bits(),
        _reserved: 0,
        sender: sender.map_or(0, TaskId::as_u64),
        timestamp_ms,
    };
    let dst = unsafe {
        let base = m.phys_to_mut::<u8>(frame.base());
        core::slice::from_raw_parts_mut(core::ptr::from_mut(base).add(PAYLOAD_OFFSET), payload.len())
    };
    dst.copy_from_slice(payload);
}

/// Copy the payload of `frame` into `buf`; `buf` must be large enough.
pub(crate) fn read_payload<M: PhysAccess>(m: &M, frame: FrameNumber, buf: &mut [u8]) -> usize {
    let len = unsafe { header_mut(m, frame) }.len as usize;
    let src = unsafe {
        let base = m.phys_to_mut::<u8>(frame.base());
        core::slice::from_raw_parts(core::ptr::from_mut(base).cast_const().add(PAYLOAD_OFFSET), len)
    };
    buf[..len].copy_from_slice(src);
    len
}
