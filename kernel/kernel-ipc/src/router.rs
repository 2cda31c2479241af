//! # Destinations, Services and the Send/Receive Paths

use crate::message::{MAX_PAYLOAD, MessageFlags, MessageType, RecvInfo, header_mut, read_payload, write_message};
use crate::queue::MessageQueue;
use crate::{IpcError, WaitOps};
use kernel_addr::layout::{IPC_QUEUE_CAPACITY, IPC_SYSTEM_QUEUE_CAPACITY};
use kernel_sched::TaskId;
use kernel_vmem::{FrameAlloc, PhysAccess};
use log::{info, trace};

/// Capacity of the named-service registry.
pub const MAX_SERVICES: usize = 32;

/// Per-task destination queues created on first use.
const MAX_TASK_QUEUES: usize = 64;

/// Longest service name accepted by the registry.
const SERVICE_NAME_LEN: usize = 32;

/// What a registered service dispatches to.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ServiceHandler {
    /// Messages are fetched by this task.
    Task(TaskId),
    /// In-kernel callback invoked by the owner of the registry.
    Fn(fn(&[u8])),
}

/// A message destination (or receive source).
#[derive(Debug, Copy, Clone)]
pub enum Destination<'a> {
    /// The always-present system queue.
    System,
    /// A registered service, by name.
    Service(&'a str),
    /// A task's own queue.
    Task(TaskId),
}

struct ServiceEntry {
    name: [u8; SERVICE_NAME_LEN],
    name_len: usize,
    handler: ServiceHandler,
    queue: MessageQueue,
}

impl ServiceEntry {
    fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("")
    }
}

/// The message router: system queue, service registry, task queues.
///
/// One lock per queue is the contract; this single structure is guarded by
/// the owner's IPC lock, with the registry sharing it.
pub struct Ipc {
    system: MessageQueue,
    services: [Option<ServiceEntry>; MAX_SERVICES],
    task_queues: [Option<(TaskId, MessageQueue)>; MAX_TASK_QUEUES],
}

impl Default for Ipc {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipc {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            system: MessageQueue::new(IPC_SYSTEM_QUEUE_CAPACITY),
            services: [const { None }; MAX_SERVICES],
            task_queues: [const { None }; MAX_TASK_QUEUES],
        }
    }

    /// Register a named service with the default queue capacity.
    ///
    /// # Errors
    /// See [`register_service_with_capacity`](Self::register_service_with_capacity).
    pub fn register_service(
        &mut self,
        name: &str,
        handler: ServiceHandler,
    ) -> Result<(), IpcError> {
        self.register_service_with_capacity(name, handler, IPC_QUEUE_CAPACITY)
    }

    /// Register a named service with a dedicated queue of `capacity`.
    ///
    /// # Errors
    /// - [`IpcError::InvalidArgument`] for an empty or over-long name.
    /// - [`IpcError::AlreadyRegistered`] when the name is taken.
    /// - [`IpcError::RegistryFull`] when all service slots are in use.
    pub fn register_service_with_capacity(
        &mut self,
        name: &str,
        handler: ServiceHandler,
        capacity: usize,
    ) -> Result<(), IpcError> {
        if name.is_empty() || name.len() > SERVICE_NAME_LEN || capacity == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if self.service_index(name).is_some() {
            return Err(IpcError::AlreadyRegistered);
        }
        let slot = self
            .services
            .iter()
            .position(Option::is_none)
            .ok_or(IpcError::RegistryFull)?;

        let mut stored = [0_u8; SERVICE_NAME_LEN];
        stored[..name.len()].copy_from_slice(name.as_bytes());
        self.services[slot] = Some(ServiceEntry {
            name: stored,
            name_len: name.len(),
            handler,
            queue: MessageQueue::new(capacity),
        });
        info!("ipc: registered service '{name}'");
        Ok(())
    }

    /// The handler registered under `name`.
    ///
    /// # Errors
    /// [`IpcError::NotFound`].
    pub fn lookup_service(&self, name: &str) -> Result<ServiceHandler, IpcError> {
        self.service_index(name)
            .and_then(|i| self.services[i].as_ref())
            .map(|e| e.handler)
            .ok_or(IpcError::NotFound)
    }

    /// Remove a service, dropping (and freeing) any queued messages.
    ///
    /// # Errors
    /// [`IpcError::NotFound`].
    pub fn unregister_service<M: PhysAccess, A: FrameAlloc>(
        &mut self,
        m: &M,
        frames: &mut A,
        name: &str,
    ) -> Result<(), IpcError> {
        let slot = self.service_index(name).ok_or(IpcError::NotFound)?;
        if let Some(mut entry) = self.services[slot].take() {
            entry.queue.drain(m, |frame| frames.free_frame(frame));
        }
        info!("ipc: unregistered service '{name}'");
        Ok(())
    }

    /// Send `payload` to `dest`.
    ///
    /// Allocates exactly one frame for the message, stamps it with the
    /// calling task and the current uptime, and links it at the destination
    /// tail.
    ///
    /// A full queue always reports [`IpcError::QueueFull`]; for a *blocking*
    /// send issued from task context the caller is first registered as the
    /// queue's waiting sender, so it can park itself (outside the IPC lock)
    /// and retry when the next receive wakes it.
    ///
    /// # Errors
    /// - [`IpcError::TooLarge`] for payloads over 1024 bytes.
    /// - [`IpcError::NoRoute`] when the destination does not resolve.
    /// - [`IpcError::QueueFull`] on a full queue.
    /// - [`IpcError::OutOfMemory`] when no message frame is available.
    pub fn send<M: PhysAccess, A: FrameAlloc, W: WaitOps>(
        &mut self,
        m: &M,
        frames: &mut A,
        wait: &mut W,
        dest: Destination<'_>,
        payload: &[u8],
        mtype: MessageType,
        flags: MessageFlags,
    ) -> Result<(), IpcError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(IpcError::TooLarge);
        }

        let queue = self.queue_mut(dest)?;
        if queue.is_full() {
            let blocking = flags.contains(MessageFlags::BLOCKING)
                && !flags.contains(MessageFlags::NON_BLOCKING);
            if blocking && let Some(current) = wait.current() {
                queue.waiting_sender = Some(current);
            }
            return Err(IpcError::QueueFull);
        }

        let frame = frames.alloc_frame().ok_or(IpcError::OutOfMemory)?;
        write_message(m, frame, payload, mtype, flags, wait.current(), wait.now_ms());

        let queue = self.queue_mut(dest)?;
        if !queue.enqueue(m, frame) {
            frames.free_frame(frame);
            return Err(IpcError::QueueFull);
        }
        if let Some(receiver) = queue.waiting_receiver.take() {
            wait.unblock(receiver);
        }
        trace!("ipc: {} bytes to {dest:?}", payload.len());
        Ok(())
    }

    /// Receive the head message of `src` into `buf`.
    ///
    /// This is the poll half of receive: an empty queue reports
    /// [`IpcError::Empty`] immediately. With a non-zero `timeout_ms` and a
    /// task context the caller is additionally registered as the queue's
    /// waiting receiver first, so it can park itself (outside the IPC lock),
    /// be woken by the next send, and retry until its deadline. An
    /// undersized buffer leaves the message queued.
    ///
    /// # Errors
    /// [`IpcError::Empty`], [`IpcError::BufferTooSmall`], or
    /// [`IpcError::NoRoute`].
    pub fn recv<M: PhysAccess, A: FrameAlloc, W: WaitOps>(
        &mut self,
        m: &M,
        frames: &mut A,
        wait: &mut W,
        src: Destination<'_>,
        buf: &mut [u8],
        timeout_ms: u64,
    ) -> Result<RecvInfo, IpcError> {
        let queue = self.queue_mut(src)?;
        if let Some(head) = queue.peek() {
            let info = unsafe { header_mut(m, head) }.info();
            if buf.len() < info.len {
                return Err(IpcError::BufferTooSmall);
            }
            let frame = queue.dequeue(m).expect("peeked head exists");
            read_payload(m, frame, buf);
            let sender = queue.waiting_sender.take();
            frames.free_frame(frame);
            if let Some(tx) = sender {
                wait.unblock(tx);
            }
            return Ok(info);
        }

        if timeout_ms > 0
            && let Some(current) = wait.current()
        {
            queue.waiting_receiver = Some(current);
        }
        Err(IpcError::Empty)
    }

    /// Drop a task's receive-waiter registration on `src` (timeout and
    /// termination cleanup).
    pub fn clear_receiver(&mut self, src: Destination<'_>, task: TaskId) {
        if let Ok(queue) = self.queue_mut(src)
            && queue.waiting_receiver == Some(task)
        {
            queue.waiting_receiver = None;
        }
    }

    /// Drop a task's send-waiter registration on `dest`.
    pub fn clear_sender(&mut self, dest: Destination<'_>, task: TaskId) {
        if let Ok(queue) = self.queue_mut(dest)
            && queue.waiting_sender == Some(task)
        {
            queue.waiting_sender = None;
        }
    }

    /// Non-blocking delivery to the system queue and every registered
    /// service queue; full queues are skipped silently. Returns the number
    /// of queues the message reached.
    pub fn broadcast<M: PhysAccess, A: FrameAlloc, W: WaitOps>(
        &mut self,
        m: &M,
        frames: &mut A,
        wait: &mut W,
        payload: &[u8],
        mtype: MessageType,
    ) -> usize {
        if payload.len() > MAX_PAYLOAD {
            return 0;
        }
        let mut delivered = 0;

        if self
            .send(m, frames, wait, Destination::System, payload, mtype, MessageFlags::NON_BLOCKING)
            .is_ok()
        {
            delivered += 1;
        }

        for slot in 0..MAX_SERVICES {
            let full = match &self.services[slot] {
                Some(entry) => entry.queue.is_full(),
                None => continue,
            };
            if full {
                continue;
            }
            let Some(frame) = frames.alloc_frame() else {
                break;
            };
            write_message(
                m,
                frame,
                payload,
                mtype,
                MessageFlags::NON_BLOCKING,
                wait.current(),
                wait.now_ms(),
            );
            let entry = self.services[slot].as_mut().expect("checked above");
            if entry.queue.enqueue(m, frame) {
                delivered += 1;
                if let Some(receiver) = entry.queue.waiting_receiver.take() {
                    wait.unblock(receiver);
                }
            } else {
                frames.free_frame(frame);
            }
        }
        delivered
    }

    /// Depth and capacity of a destination's queue, if it resolves.
    #[must_use]
    pub fn depth(&self, dest: Destination<'_>) -> Option<(usize, usize)> {
        let queue = match dest {
            Destination::System => &self.system,
            Destination::Service(name) => {
                &self.services[self.service_index(name)?].as_ref()?.queue
            }
            Destination::Task(id) => {
                &self
                    .task_queues
                    .iter()
                    .flatten()
                    .find(|(owner, _)| *owner == id)?
                    .1
            }
        };
        Some((queue.len(), queue.capacity()))
    }

    fn service_index(&self, name: &str) -> Option<usize> {
        self.services
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.name() == name))
    }

    /// Resolve a destination to its queue, creating task queues on first
    /// use.
    fn queue_mut(&mut self, dest: Destination<'_>) -> Result<&mut MessageQueue, IpcError> {
        match dest {
            Destination::System => Ok(&mut self.system),
            Destination::Service(name) => {
                let slot = self.service_index(name).ok_or(IpcError::NoRoute)?;
                Ok(&mut self.services[slot].as_mut().expect("indexed").queue)
            }
            Destination::Task(id) => {
                if let Some(slot) = self
                    .task_queues
                    .iter()
                    .position(|q| q.as_ref().is_some_and(|(owner, _)| *owner == id))
                {
                    return Ok(&mut self.task_queues[slot].as_mut().expect("indexed").1);
                }
                let free = self
                    .task_queues
                    .iter()
                    .position(Option::is_none)
                    .ok_or(IpcError::NoRoute)?;
                self.task_queues[free] = Some((id, MessageQueue::new(IPC_QUEUE_CAPACITY)));
                Ok(&mut self.task_queues[free].as_mut().expect("just stored").1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_addr::{FrameNumber, PhysAddr};
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[repr(align(4096))]
    struct Frame([u8; 4096]);

    struct TestPhys {
        frames: RefCell<HashMap<u64, Box<Frame>>>,
    }

    impl TestPhys {
        fn new() -> Self {
            Self {
                frames: RefCell::new(HashMap::new()),
            }
        }
    }

    impl PhysAccess for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysAddr) -> &'a mut T {
            let mut frames = self.frames.borrow_mut();
            let frame = frames
                .entry(pa.as_u64() >> 12)
                .or_insert_with(|| Box::new(Frame([0; 4096])));
            let ptr = core::ptr::from_mut(frame.as_mut()).cast::<u8>();
            unsafe { &mut *ptr.add(pa.page_offset() as usize).cast::<T>() }
        }
    }

    struct TestFrames {
        free: Vec<FrameNumber>,
        total: u64,
    }

    impl TestFrames {
        fn new(count: u64) -> Self {
            Self {
                free: (0..count).rev().map(FrameNumber::new).collect(),
                total: count,
            }
        }

        fn used(&self) -> u64 {
            self.total - self.free.len() as u64
        }
    }

    impl FrameAlloc for TestFrames {
        fn alloc_frame(&mut self) -> Option<FrameNumber> {
            self.free.pop()
        }

        fn free_frame(&mut self, frame: FrameNumber) {
            assert!(!self.free.contains(&frame), "double free");
            self.free.push(frame);
        }

        fn total_frames(&self) -> u64 {
            self.total
        }

        fn free_frames(&self) -> u64 {
            self.free.len() as u64
        }
    }

    /// Scripted scheduler double: a fixed current task, a settable clock and
    /// a wake log.
    struct MockWait {
        current: Option<TaskId>,
        now: u64,
        unblocked: Vec<TaskId>,
    }

    impl MockWait {
        fn new() -> Self {
            Self {
                current: Some(TaskId::new(7)),
                now: 0,
                unblocked: Vec::new(),
            }
        }
    }

    impl WaitOps for MockWait {
        fn current(&mut self) -> Option<TaskId> {
            self.current
        }

        fn unblock(&mut self, id: TaskId) {
            self.unblocked.push(id);
        }

        fn now_ms(&mut self) -> u64 {
            self.now
        }
    }

    fn setup() -> (TestPhys, TestFrames, MockWait, Ipc) {
        (TestPhys::new(), TestFrames::new(64), MockWait::new(), Ipc::new())
    }

    fn handler() -> ServiceHandler {
        ServiceHandler::Task(TaskId::new(42))
    }

    #[test]
    fn fifo_order_within_a_destination() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        ipc.register_service_with_capacity("echo", handler(), 4).unwrap();
        let dest = Destination::Service("echo");

        for msg in [b"m1", b"m2", b"m3"] {
            ipc.send(&phys, &mut frames, &mut wait, dest, msg, MessageType::Data, MessageFlags::NON_BLOCKING)
                .unwrap();
        }
        let mut buf = [0_u8; 64];
        for expected in [b"m1", b"m2", b"m3"] {
            let info = ipc.recv(&phys, &mut frames, &mut wait, dest, &mut buf, 0).unwrap();
            assert_eq!(&buf[..info.len], expected);
            assert_eq!(info.sender, Some(TaskId::new(7)));
        }
    }

    #[test]
    fn full_queue_rejects_nonblocking_send() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        ipc.register_service_with_capacity("echo", handler(), 4).unwrap();
        let dest = Destination::Service("echo");

        for _ in 0..4 {
            ipc.send(&phys, &mut frames, &mut wait, dest, b"x", MessageType::Data, MessageFlags::NON_BLOCKING)
                .unwrap();
        }
        assert_eq!(
            ipc.send(&phys, &mut frames, &mut wait, dest, b"x", MessageType::Data, MessageFlags::NON_BLOCKING),
            Err(IpcError::QueueFull)
        );
        assert_eq!(ipc.depth(dest), Some((4, 4)));
    }

    #[test]
    fn payload_limit_is_exact() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        let big = [0_u8; MAX_PAYLOAD];
        ipc.send(&phys, &mut frames, &mut wait, Destination::System, &big, MessageType::Data, MessageFlags::NON_BLOCKING)
            .unwrap();

        let too_big = [0_u8; MAX_PAYLOAD + 1];
        assert_eq!(
            ipc.send(&phys, &mut frames, &mut wait, Destination::System, &too_big, MessageType::Data, MessageFlags::NON_BLOCKING),
            Err(IpcError::TooLarge)
        );
    }

    #[test]
    fn empty_poll_and_waiter_registration() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        let mut buf = [0_u8; 16];

        // Zero timeout polls and reports Empty immediately, registering
        // nothing.
        assert_eq!(
            ipc.recv(&phys, &mut frames, &mut wait, Destination::System, &mut buf, 0),
            Err(IpcError::Empty)
        );
        assert!(ipc.system.waiting_receiver.is_none());

        // A timed receive registers the caller before reporting Empty, so
        // the owner can park it and the next send wakes it.
        assert_eq!(
            ipc.recv(&phys, &mut frames, &mut wait, Destination::System, &mut buf, 25),
            Err(IpcError::Empty)
        );
        assert_eq!(ipc.system.waiting_receiver, Some(TaskId::new(7)));

        ipc.clear_receiver(Destination::System, TaskId::new(7));
        assert!(ipc.system.waiting_receiver.is_none());
    }

    #[test]
    fn blocking_send_on_full_queue_registers_the_sender() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        ipc.register_service_with_capacity("tight", handler(), 1).unwrap();
        let dest = Destination::Service("tight");
        ipc.send(&phys, &mut frames, &mut wait, dest, b"x", MessageType::Data, MessageFlags::NON_BLOCKING)
            .unwrap();

        assert_eq!(
            ipc.send(&phys, &mut frames, &mut wait, dest, b"y", MessageType::Data, MessageFlags::BLOCKING),
            Err(IpcError::QueueFull)
        );
        let idx = ipc.service_index("tight").unwrap();
        assert_eq!(
            ipc.services[idx].as_ref().unwrap().queue.waiting_sender,
            Some(TaskId::new(7))
        );

        // A receive drains one slot and wakes the parked sender for its
        // retry.
        let mut buf = [0_u8; 8];
        ipc.recv(&phys, &mut frames, &mut wait, dest, &mut buf, 0).unwrap();
        assert_eq!(wait.unblocked, vec![TaskId::new(7)]);
    }

    #[test]
    fn undersized_buffer_keeps_the_message() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        ipc.send(&phys, &mut frames, &mut wait, Destination::System, b"hello world", MessageType::Data, MessageFlags::NON_BLOCKING)
            .unwrap();

        let mut small = [0_u8; 4];
        assert_eq!(
            ipc.recv(&phys, &mut frames, &mut wait, Destination::System, &mut small, 0),
            Err(IpcError::BufferTooSmall)
        );
        assert_eq!(ipc.depth(Destination::System).unwrap().0, 1);

        let mut buf = [0_u8; 32];
        let info = ipc.recv(&phys, &mut frames, &mut wait, Destination::System, &mut buf, 0).unwrap();
        assert_eq!(&buf[..info.len], b"hello world");
    }

    #[test]
    fn one_frame_per_message() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        assert_eq!(frames.used(), 0);
        ipc.send(&phys, &mut frames, &mut wait, Destination::System, b"a", MessageType::Data, MessageFlags::NON_BLOCKING)
            .unwrap();
        assert_eq!(frames.used(), 1);

        let mut buf = [0_u8; 8];
        ipc.recv(&phys, &mut frames, &mut wait, Destination::System, &mut buf, 0).unwrap();
        assert_eq!(frames.used(), 0, "frame freed at receive");
    }

    #[test]
    fn registry_round_trip() {
        let (phys, mut frames, _wait, mut ipc) = setup();
        assert_eq!(ipc.lookup_service("log"), Err(IpcError::NotFound));

        ipc.register_service("log", handler()).unwrap();
        assert!(matches!(ipc.lookup_service("log"), Ok(ServiceHandler::Task(id)) if id == TaskId::new(42)));
        assert_eq!(
            ipc.register_service("log", handler()),
            Err(IpcError::AlreadyRegistered)
        );

        ipc.unregister_service(&phys, &mut frames, "log").unwrap();
        assert_eq!(ipc.lookup_service("log"), Err(IpcError::NotFound));
        assert_eq!(
            ipc.unregister_service(&phys, &mut frames, "log"),
            Err(IpcError::NotFound)
        );
    }

    #[test]
    fn registry_fills_up() {
        let (_, _, _, mut ipc) = setup();
        let names: Vec<String> = (0..MAX_SERVICES).map(|i| format!("svc{i}")).collect();
        for name in &names {
            ipc.register_service(name, handler()).unwrap();
        }
        assert_eq!(
            ipc.register_service("one-too-many", handler()),
            Err(IpcError::RegistryFull)
        );
    }

    #[test]
    fn unregister_frees_queued_messages() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        ipc.register_service("spool", handler()).unwrap();
        for _ in 0..5 {
            ipc.send(&phys, &mut frames, &mut wait, Destination::Service("spool"), b"x", MessageType::Data, MessageFlags::NON_BLOCKING)
                .unwrap();
        }
        assert_eq!(frames.used(), 5);
        ipc.unregister_service(&phys, &mut frames, "spool").unwrap();
        assert_eq!(frames.used(), 0);
    }

    #[test]
    fn broadcast_fan_out_counts_deliveries() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        for name in ["s1", "s2", "s3"] {
            ipc.register_service_with_capacity(name, handler(), 1).unwrap();
        }

        // System queue plus three empty service queues.
        assert_eq!(
            ipc.broadcast(&phys, &mut frames, &mut wait, b"x", MessageType::Service),
            4
        );
        // All three service queues are now full; only the system queue
        // takes the second round.
        assert_eq!(
            ipc.broadcast(&phys, &mut frames, &mut wait, b"x", MessageType::Service),
            1
        );
    }

    #[test]
    fn task_queues_materialize_on_first_send() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        let dest = Destination::Task(TaskId::new(9));
        assert_eq!(ipc.depth(dest), None);

        ipc.send(&phys, &mut frames, &mut wait, dest, b"ping", MessageType::Data, MessageFlags::NON_BLOCKING)
            .unwrap();
        assert_eq!(ipc.depth(dest), Some((1, IPC_QUEUE_CAPACITY)));

        let mut buf = [0_u8; 8];
        let info = ipc.recv(&phys, &mut frames, &mut wait, dest, &mut buf, 0).unwrap();
        assert_eq!(&buf[..info.len], b"ping");
    }

    #[test]
    fn send_wakes_a_parked_receiver() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        let waiter = TaskId::new(11);
        ipc.system.waiting_receiver = Some(waiter);

        ipc.send(&phys, &mut frames, &mut wait, Destination::System, b"x", MessageType::Data, MessageFlags::NON_BLOCKING)
            .unwrap();
        assert_eq!(wait.unblocked, vec![waiter]);
        assert!(ipc.system.waiting_receiver.is_none());
    }

    #[test]
    fn recv_wakes_a_parked_sender() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        ipc.send(&phys, &mut frames, &mut wait, Destination::System, b"x", MessageType::Data, MessageFlags::NON_BLOCKING)
            .unwrap();
        let sender = TaskId::new(13);
        ipc.system.waiting_sender = Some(sender);

        let mut buf = [0_u8; 8];
        ipc.recv(&phys, &mut frames, &mut wait, Destination::System, &mut buf, 0).unwrap();
        assert_eq!(wait.unblocked, vec![sender]);
    }

    #[test]
    fn queue_count_matches_linked_messages() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        ipc.register_service_with_capacity("q", handler(), 8).unwrap();
        let dest = Destination::Service("q");
        for _ in 0..6 {
            ipc.send(&phys, &mut frames, &mut wait, dest, b"x", MessageType::Data, MessageFlags::NON_BLOCKING)
                .unwrap();
        }
        let mut buf = [0_u8; 8];
        ipc.recv(&phys, &mut frames, &mut wait, dest, &mut buf, 0).unwrap();
        ipc.recv(&phys, &mut frames, &mut wait, dest, &mut buf, 0).unwrap();

        let idx = ipc.service_index("q").unwrap();
        let queue = &ipc.services[idx].as_ref().unwrap().queue;
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.linked_len(&phys), 4);
        assert!(queue.len() <= queue.capacity());
    }

    #[test]
    fn timestamps_come_from_the_clock() {
        let (phys, mut frames, mut wait, mut ipc) = setup();
        wait.now = 1234;
        ipc.send(&phys, &mut frames, &mut wait, Destination::System, b"x", MessageType::Terminal, MessageFlags::NON_BLOCKING)
            .unwrap();
        let mut buf = [0_u8; 8];
        let info = ipc.recv(&phys, &mut frames, &mut wait, Destination::System, &mut buf, 0).unwrap();
        assert_eq!(info.timestamp_ms, 1234);
        assert_eq!(info.mtype, MessageType::Terminal);
    }
}
