use super::{Frame, MessageHandle, Tag, Transport, OFFSET_BATCHED};
use crate::encoding::wire;
use crate::error::{Error, Result};
use crate::Rank;

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A monotonically increasing ID assigned to each send.
pub type SendId = u32;

/// A handler for a received message, invoked with the caller-provided
/// context. At most one handler may be registered per tag.
pub type Callback<C> = Box<dyn FnMut(&mut C, &mut MessageHandle) -> Result<()>>;

/// A handler invoked with the send ID once a transfer has completed.
pub type SentCallback<C> = Box<dyn FnMut(&mut C, SendId)>;

/// Per-slice processing limit, keeping each `advance` call responsive.
const SLICE: usize = 4;

/// The trailer appended to every fragment: (sendId, batchIndex, totalBatches)
/// as little-endian 32-bit integers.
const TRAILER_LEN: usize = 12;

/// An outbound transfer. Large payloads are cut into batches of at most
/// `max_msg_size` bytes, sent one batch per `advance` visit.
struct SendHandle {
    id: SendId,
    dest: Rank,
    tag: Tag,
    data: Vec<u8>,
    sent_batches: u32,
    total_batches: u32,
}

impl SendHandle {
    fn is_batched(&self) -> bool {
        self.total_batches > 1
    }

    fn is_finished(&self) -> bool {
        self.sent_batches == self.total_batches
    }

    /// Builds the frame for the next unsent batch.
    fn next_batch(&self, max_msg_size: usize) -> Frame {
        if !self.is_batched() {
            return Frame {
                from: 0, // filled in by the queue
                tag: self.tag.to_wire(),
                payload: self.data.clone(),
            };
        }
        let index = self.sent_batches;
        let start = index as usize * max_msg_size;
        let end = (start + max_msg_size).min(self.data.len());
        let mut payload = Vec::with_capacity(end - start + TRAILER_LEN);
        payload.extend_from_slice(&self.data[start..end]);
        wire::put_u32(&mut payload, self.id);
        wire::put_u32(&mut payload, index);
        wire::put_u32(&mut payload, self.total_batches);
        Frame { from: 0, tag: self.tag.to_wire() + OFFSET_BATCHED, payload }
    }
}

/// Fragments of a large inbound message, keyed by (source, send ID).
struct ReceiveFragment {
    source: Rank,
    tag: Tag,
    fragments: Vec<Option<Vec<u8>>>,
    received: u32,
    total: u32,
}

/// Fully assembled messages handed from the assembler thread back to the
/// event loop. The length counter lets the main thread skip taking the lock
/// when nothing is pending.
#[derive(Default)]
struct FusedQueue {
    queue: Mutex<VecDeque<MessageHandle>>,
    len: AtomicUsize,
}

/// A handle for queueing outbound messages. Cloneable, so every component of
/// a worker can send without holding a reference to the queue itself; the
/// queue drains the shared channel on its next `advance`.
#[derive(Clone)]
pub struct CommLink {
    rank: Rank,
    tx: Sender<SendHandle>,
    next_id: Arc<AtomicU32>,
}

impl CommLink {
    /// This worker's own rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Queues a payload for delivery to `dest`, returning the send ID.
    /// Sending to the own rank short-circuits through the self-receive queue.
    /// Never blocks.
    pub fn send(&self, dest: Rank, tag: Tag, payload: Vec<u8>) -> SendId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle =
            SendHandle { id, dest, tag, data: payload, sent_batches: 0, total_batches: 0 };
        // The queue outlives all links, so the channel cannot be closed.
        let _ = self.tx.send(handle);
        id
    }
}

/// A non-blocking point-to-point message queue with tag dispatch, large
/// message fragmentation, and self-loopback. The generic parameter is the
/// handler context (normally the worker) threaded through every callback.
///
/// One dedicated assembler thread fuses completed fragment groups into whole
/// messages; one garbage thread releases large buffers off the hot path. The
/// event loop thread is the sole caller of all callbacks.
pub struct MessageQueue<C> {
    rank: Rank,
    max_msg_size: usize,
    transport: Box<dyn Transport>,
    callbacks: HashMap<Tag, Callback<C>>,
    sent_callback: Option<SentCallback<C>>,
    link: CommLink,
    send_rx: Receiver<SendHandle>,
    self_queue: VecDeque<SendHandle>,
    send_queue: VecDeque<SendHandle>,
    fragments: HashMap<(Rank, SendId), ReceiveFragment>,
    fused: Arc<FusedQueue>,
    assembler_tx: Option<Sender<ReceiveFragment>>,
    garbage_tx: Option<Sender<Vec<u8>>>,
    helpers: Vec<JoinHandle<()>>,
}

impl<C> MessageQueue<C> {
    pub fn new(rank: Rank, max_msg_size: usize, transport: Box<dyn Transport>) -> Self {
        let (send_tx, send_rx) = unbounded();
        let link = CommLink { rank, tx: send_tx, next_id: Arc::new(AtomicU32::new(0)) };

        let fused = Arc::new(FusedQueue::default());
        let (assembler_tx, assembler_rx) = unbounded::<ReceiveFragment>();
        let (garbage_tx, garbage_rx) = unbounded::<Vec<u8>>();

        let assembler = {
            let fused = fused.clone();
            std::thread::spawn(move || {
                for fragment in assembler_rx.iter() {
                    let handle = Self::assemble(fragment);
                    let mut queue = fused.queue.lock().expect("fused queue poisoned");
                    queue.push_back(handle);
                    fused.len.fetch_add(1, Ordering::Release);
                }
            })
        };
        let garbage = std::thread::spawn(move || {
            for buffer in garbage_rx.iter() {
                drop(buffer);
            }
        });

        Self {
            rank,
            max_msg_size,
            transport,
            callbacks: HashMap::new(),
            sent_callback: None,
            link,
            send_rx,
            self_queue: VecDeque::new(),
            send_queue: VecDeque::new(),
            fragments: HashMap::new(),
            fused,
            assembler_tx: Some(assembler_tx),
            garbage_tx: Some(garbage_tx),
            helpers: vec![assembler, garbage],
        }
    }

    /// Returns a handle for queueing outbound messages.
    pub fn link(&self) -> CommLink {
        self.link.clone()
    }

    /// Queues a payload for delivery, returning the send ID.
    pub fn send(&self, dest: Rank, tag: Tag, payload: Vec<u8>) -> SendId {
        self.link.send(dest, tag, payload)
    }

    /// Registers the handler for a tag. Registering a tag twice is a
    /// programming error and panics.
    pub fn register_callback(&mut self, tag: Tag, callback: Callback<C>) {
        if self.callbacks.insert(tag, callback).is_some() {
            panic!("more than one callback for tag {tag:?}");
        }
    }

    /// Registers the handler invoked with the send ID of every completed
    /// transfer.
    pub fn register_sent_callback(&mut self, callback: SentCallback<C>) {
        self.sent_callback = Some(callback);
    }

    /// Whether no messages are in flight anywhere in the queue.
    pub fn is_idle(&self) -> bool {
        self.transport.is_idle()
            && self.send_rx.is_empty()
            && self.self_queue.is_empty()
            && self.send_queue.is_empty()
            && self.fragments.is_empty()
            && self.fused.len.load(Ordering::Acquire) == 0
    }

    /// Drains one slice of received, self-received, assembled, and outbound
    /// messages, dispatching callbacks on the calling thread. A protocol
    /// violation (unregistered tag, duplicate or out-of-bounds fragment) is
    /// returned as a fatal error.
    pub fn advance(&mut self, ctx: &mut C) -> Result<()> {
        self.drain_submitted();
        self.process_received(ctx)?;
        self.process_self_received(ctx)?;
        self.process_assembled(ctx)?;
        self.process_sent(ctx);
        Ok(())
    }

    /// Moves freshly submitted sends into the self-receive or outbound queue.
    /// Self-sends submitted during a previous `advance` thereby become
    /// visible to this one, and never earlier.
    fn drain_submitted(&mut self) {
        while let Ok(mut handle) = self.send_rx.try_recv() {
            if handle.dest == self.rank {
                self.self_queue.push_back(handle);
                continue;
            }
            handle.total_batches = if handle.data.len() > self.max_msg_size {
                (handle.data.len() as u32).div_ceil(self.max_msg_size as u32)
            } else {
                1
            };
            self.send_queue.push_back(handle);
        }
    }

    fn process_received(&mut self, ctx: &mut C) -> Result<()> {
        for _ in 0..SLICE {
            let Some(frame) = self.transport.recv()? else { break };
            debug!(
                "rank {} received tag {} ({} bytes) from rank {}",
                self.rank,
                frame.tag,
                frame.payload.len(),
                frame.from
            );
            if frame.tag >= OFFSET_BATCHED {
                self.receive_fragment(frame)?;
            } else {
                let tag = Tag::from_wire(frame.tag).ok_or_else(|| {
                    Error::ProtocolViolation(format!("unknown tag {}", frame.tag))
                })?;
                let mut handle = MessageHandle::new(frame.from, tag, frame.payload);
                self.dispatch(ctx, &mut handle)?;
            }
        }
        Ok(())
    }

    /// Books one fragment of a batched message, and hands the group to the
    /// assembler thread once complete.
    fn receive_fragment(&mut self, frame: Frame) -> Result<()> {
        let tag = Tag::from_wire(frame.tag - OFFSET_BATCHED)
            .ok_or_else(|| Error::ProtocolViolation(format!("unknown batched tag {}", frame.tag)))?;
        if frame.payload.len() < TRAILER_LEN {
            return Err(Error::ProtocolViolation(format!(
                "fragment of {} bytes is smaller than its trailer",
                frame.payload.len()
            )));
        }
        let mut data = frame.payload;
        let mut offset = data.len() - TRAILER_LEN;
        let send_id = wire::get_u32(&data, &mut offset)?;
        let index = wire::get_u32(&data, &mut offset)?;
        let total = wire::get_u32(&data, &mut offset)?;
        data.truncate(data.len() - TRAILER_LEN);

        if index >= total {
            return Err(Error::ProtocolViolation(format!("invalid batch {index}/{total}")));
        }

        let fragment = self.fragments.entry((frame.from, send_id)).or_insert(ReceiveFragment {
            source: frame.from,
            tag,
            fragments: Vec::new(),
            received: 0,
            total,
        });
        if fragment.tag != tag || fragment.total != total {
            return Err(Error::ProtocolViolation(format!(
                "fragment group ({}, {send_id}) changed shape",
                frame.from
            )));
        }
        if fragment.fragments.len() <= index as usize {
            fragment.fragments.resize(index as usize + 1, None);
        }
        if fragment.fragments[index as usize].is_some() {
            return Err(Error::ProtocolViolation(format!(
                "batch {index}/{total} already present"
            )));
        }
        fragment.fragments[index as usize] = Some(data);
        fragment.received += 1;

        if fragment.received == total {
            let fragment = self.fragments.remove(&(frame.from, send_id)).unwrap();
            if let Some(tx) = &self.assembler_tx {
                let _ = tx.send(fragment);
            }
        }
        Ok(())
    }

    fn process_self_received(&mut self, ctx: &mut C) -> Result<()> {
        for _ in 0..SLICE {
            let Some(sent) = self.self_queue.pop_front() else { break };
            let mut handle = MessageHandle::new(self.rank, sent.tag, sent.data);
            self.dispatch(ctx, &mut handle)?;
            if let Some(callback) = &mut self.sent_callback {
                callback(ctx, sent.id);
            }
        }
        Ok(())
    }

    fn process_assembled(&mut self, ctx: &mut C) -> Result<()> {
        if self.fused.len.load(Ordering::Acquire) == 0 {
            return Ok(());
        }
        let mut drained = Vec::new();
        if let Ok(mut queue) = self.fused.queue.try_lock() {
            while drained.len() < SLICE {
                match queue.pop_front() {
                    Some(handle) => drained.push(handle),
                    None => break,
                }
            }
            self.fused.len.fetch_sub(drained.len(), Ordering::Release);
        }
        for mut handle in drained {
            self.dispatch(ctx, &mut handle)?;
            // Whatever the handler left behind of a large buffer is released
            // off the hot path.
            if handle.payload().len() > self.max_msg_size {
                if let Some(tx) = &self.garbage_tx {
                    let _ = tx.send(handle.take_payload());
                }
            }
        }
        Ok(())
    }

    /// Pushes in-flight transfers forward, one batch per handle per call,
    /// testing at most a slice of handles.
    fn process_sent(&mut self, ctx: &mut C) {
        let mut remaining = VecDeque::new();
        let mut tested = 0;
        while let Some(mut handle) = self.send_queue.pop_front() {
            if tested >= SLICE {
                remaining.push_back(handle);
                continue;
            }
            tested += 1;
            let mut frame = handle.next_batch(self.max_msg_size);
            frame.from = self.rank;
            if let Err(err) = self.transport.send(handle.dest, frame) {
                error!("send to rank {} failed: {err}", handle.dest);
            }
            handle.sent_batches += 1;
            if handle.is_finished() {
                if let Some(callback) = &mut self.sent_callback {
                    callback(ctx, handle.id);
                }
                if handle.data.len() > self.max_msg_size {
                    if let Some(tx) = &self.garbage_tx {
                        let _ = tx.send(std::mem::take(&mut handle.data));
                    }
                }
            } else {
                remaining.push_back(handle);
            }
        }
        self.send_queue = remaining;
    }

    fn dispatch(&mut self, ctx: &mut C, handle: &mut MessageHandle) -> Result<()> {
        let Some(callback) = self.callbacks.get_mut(&handle.tag) else {
            return Err(Error::ProtocolViolation(format!("no callback for tag {:?}", handle.tag)));
        };
        match callback(ctx, handle) {
            // Discarded-by-rule messages never escalate.
            Err(err) if err.is_discard() => {
                debug!("discarding message with tag {:?}: {err}", handle.tag);
                Ok(())
            }
            result => result,
        }
    }

    /// Fuses a completed fragment group into a single message. Runs on the
    /// assembler thread.
    fn assemble(fragment: ReceiveFragment) -> MessageHandle {
        let size = fragment.fragments.iter().flatten().map(Vec::len).sum();
        let mut data = Vec::with_capacity(size);
        for piece in &fragment.fragments {
            match piece {
                Some(piece) => data.extend_from_slice(piece),
                None => {
                    // Groups are only enqueued once every batch arrived.
                    error!("incomplete fragment group from rank {}", fragment.source);
                    std::process::abort();
                }
            }
        }
        MessageHandle::new(fragment.source, fragment.tag, data)
    }
}

impl<C> Drop for MessageQueue<C> {
    fn drop(&mut self) {
        drop(self.assembler_tx.take());
        drop(self.garbage_tx.take());
        for helper in self.helpers.drain(..) {
            let _ = helper.join();
        }
    }
}
