//! Host-side streaming buffer: a fixed ring of frame elements.
//!
//! Architecture:
//! ```text
//!  acquisition (producer)            consumers
//!        │
//!        ▼
//!  BufferProducer::fill ──► slot[next] Free → Ready ──► rtrb event queue ──► BufferSubscription
//!        │                                                                        │
//!        │ slot not Free?                                                         ▼
//!        ▼                                                                 BufferElement
//!  BufferError::Overflow + one Overflow event                                     │
//!  (stop_on_overflow → buffer Invalid)                                   release() Ready → Free
//!                                                                                 │
//!                                                                                 ▼
//!                                                                   release hook (HOST mode re-trigger)
//! ```
//!
//! The producer never blocks and never overwrites: a slot that has not been
//! released is an overflow. Each slot carries a single atomic tag packing
//! the frame number with the element state, so a stale `BufferElement`
//! handle can never release a newer frame that reused its slot.

use rtrb::{Consumer, Producer, RingBuffer};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Free,
    Ready,
    Invalid,
}

impl ElementState {
    fn bits(self) -> u64 {
        match self {
            Self::Free => 0,
            Self::Ready => 1,
            Self::Invalid => 2,
        }
    }

    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Self::Free,
            1 => Self::Ready,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Running,
    Shutdown,
    Invalid,
}

impl BufferState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Shutdown,
            _ => Self::Invalid,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Shutdown => 1,
            Self::Invalid => 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer needs at least one element")]
    Empty,

    #[error("buffer overflow: element {position} has not been released")]
    Overflow { position: usize },

    #[error("frame has {actual} samples, elements hold {expected}")]
    FrameSize { expected: usize, actual: usize },

    #[error("buffer is {0:?}")]
    NotRunning(BufferState),

    #[error("element {position} no longer holds frame {frame_number}")]
    Stale { position: usize, frame_number: u64 },

    #[error("buffer already has a subscriber")]
    AlreadySubscribed,
}

/// Called with the slot position after every successful release.
pub type ReleaseHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Counters for buffer activity.
#[derive(Debug, Default)]
pub struct BufferStats {
    /// Frames written by the producer
    pub filled: AtomicU64,
    /// Elements released by consumers
    pub released: AtomicU64,
    /// Fill attempts that found the next slot occupied
    pub overflows: AtomicU64,
    /// Ready elements freed by shutdown without being released
    pub discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStatsSnapshot {
    pub filled: u64,
    pub released: u64,
    pub overflows: u64,
    pub discarded: u64,
}

/// Notification pushed by the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEvent {
    Ready { position: usize, frame_number: u64 },
    Overflow { position: usize },
}

fn pack(frame_number: u64, state: ElementState) -> u64 {
    (frame_number << 2) | state.bits()
}

fn unpack(tag: u64) -> (u64, ElementState) {
    (tag >> 2, ElementState::from_bits(tag))
}

struct Slot {
    tag: AtomicU64,
    data: RwLock<Vec<i16>>,
}

impl Slot {
    fn load(&self) -> (u64, ElementState) {
        unpack(self.tag.load(Ordering::Acquire))
    }

    /// Move from `from` to `to` only if the slot still holds `frame_number`.
    fn transition(&self, frame_number: u64, from: ElementState, to: ElementState) -> bool {
        self.tag
            .compare_exchange(
                pack(frame_number, from),
                pack(frame_number, to),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Wakes blocked subscribers when anything changes.
#[derive(Default)]
struct Doorbell {
    rings: Mutex<u64>,
    cv: Condvar,
}

impl Doorbell {
    fn ring(&self) {
        let mut rings = self.rings.lock().unwrap_or_else(PoisonError::into_inner);
        *rings = rings.wrapping_add(1);
        self.cv.notify_all();
    }

    fn count(&self) -> u64 {
        *self.rings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_past(&self, seen: u64, timeout: Duration) {
        let rings = self.rings.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .cv
            .wait_timeout_while(rings, timeout, |rings| *rings == seen);
    }
}

struct Shared {
    slots: Vec<Slot>,
    shape: Vec<usize>,
    frame_len: usize,
    state: AtomicU8,
    stop_on_overflow: bool,
    stats: BufferStats,
    release_hook: RwLock<Option<ReleaseHook>>,
    events: Mutex<Option<Consumer<BufferEvent>>>,
    /// Ready events that did not fit the event queue, in order.
    spill: Mutex<VecDeque<BufferEvent>>,
    spilled: AtomicBool,
    /// An overflow event is queued and not yet delivered.
    overflow_queued: AtomicBool,
    subscribed: AtomicBool,
    doorbell: Doorbell,
}

impl Shared {
    fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Shared handle to a streaming buffer. Clones refer to the same ring.
#[derive(Clone)]
pub struct StreamingBuffer {
    shared: Arc<Shared>,
}

impl StreamingBuffer {
    /// Allocate a ring of `n_elements` frames of the given shape.
    ///
    /// Returns the consumer-side handle and the single producer.
    pub fn new(
        n_elements: usize,
        shape: Vec<usize>,
        stop_on_overflow: bool,
    ) -> Result<(Self, BufferProducer), BufferError> {
        if n_elements == 0 {
            return Err(BufferError::Empty);
        }
        let frame_len = shape.iter().product();
        let slots = (0..n_elements)
            .map(|_| Slot {
                tag: AtomicU64::new(pack(0, ElementState::Free)),
                data: RwLock::new(vec![0; frame_len]),
            })
            .collect();
        let (producer, consumer) = RingBuffer::new(n_elements * 2 + 8);

        let shared = Arc::new(Shared {
            slots,
            shape,
            frame_len,
            state: AtomicU8::new(BufferState::Running.as_u8()),
            stop_on_overflow,
            stats: BufferStats::default(),
            release_hook: RwLock::new(None),
            events: Mutex::new(Some(consumer)),
            spill: Mutex::new(VecDeque::new()),
            spilled: AtomicBool::new(false),
            overflow_queued: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            doorbell: Doorbell::default(),
        });

        debug!(
            "allocated streaming buffer: {} elements of {:?}",
            n_elements, shared.shape
        );

        let producer = BufferProducer {
            shared: Arc::clone(&shared),
            events: producer,
            next: 0,
            frame_number: 0,
        };
        Ok((Self { shared }, producer))
    }

    pub fn n_elements(&self) -> usize {
        self.shared.slots.len()
    }

    /// Shape of one frame.
    pub fn shape(&self) -> &[usize] {
        &self.shared.shape
    }

    /// Samples per frame.
    pub fn frame_len(&self) -> usize {
        self.shared.frame_len
    }

    pub fn state(&self) -> BufferState {
        self.shared.state()
    }

    pub fn stop_on_overflow(&self) -> bool {
        self.shared.stop_on_overflow
    }

    pub fn element_state(&self, position: usize) -> Option<ElementState> {
        self.shared.slots.get(position).map(|slot| slot.load().1)
    }

    pub fn count_in_state(&self, state: ElementState) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|slot| slot.load().1 == state)
            .count()
    }

    /// Handle to the frame currently held at `position`, if it is ready.
    pub fn element(&self, position: usize) -> Option<BufferElement> {
        let (frame_number, state) = self.shared.slots.get(position)?.load();
        (state == ElementState::Ready).then(|| BufferElement {
            buffer: self.clone(),
            position,
            frame_number,
        })
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        let stats = &self.shared.stats;
        BufferStatsSnapshot {
            filled: stats.filled.load(Ordering::Relaxed),
            released: stats.released.load(Ordering::Relaxed),
            overflows: stats.overflows.load(Ordering::Relaxed),
            discarded: stats.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn set_release_hook(&self, hook: Option<ReleaseHook>) {
        *self
            .shared
            .release_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// Attach the (single) consumer of ready notifications.
    ///
    /// Elements that were already ready are delivered first, oldest first.
    pub fn subscribe(&self) -> Result<BufferSubscription, BufferError> {
        let mut consumer = self
            .shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BufferError::AlreadySubscribed)?;

        // leftovers from a previous subscriber
        while consumer.pop().is_ok() {}
        self.shared
            .spill
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared.spilled.store(false, Ordering::Release);
        self.shared.overflow_queued.store(false, Ordering::Release);
        self.shared.subscribed.store(true, Ordering::Release);

        let mut ready: Vec<(u64, usize)> = self
            .shared
            .slots
            .iter()
            .enumerate()
            .filter_map(|(position, slot)| match slot.load() {
                (frame_number, ElementState::Ready) => Some((frame_number, position)),
                _ => None,
            })
            .collect();
        ready.sort_unstable();

        Ok(BufferSubscription {
            buffer: self.clone(),
            events: Some(consumer),
            backlog: ready
                .into_iter()
                .map(|(frame_number, position)| BufferEvent::Ready {
                    position,
                    frame_number,
                })
                .collect(),
            last_frame: None,
        })
    }

    /// Stop accepting frames and free every ready element.
    pub fn shutdown(&self) {
        let _ = self.shared.state.compare_exchange(
            BufferState::Running.as_u8(),
            BufferState::Shutdown.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        for slot in &self.shared.slots {
            let (frame_number, state) = slot.load();
            if state == ElementState::Ready
                && slot.transition(frame_number, ElementState::Ready, ElementState::Free)
            {
                self.shared.stats.discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.set_release_hook(None);
        self.shared.doorbell.ring();
        debug!("streaming buffer shut down: {:?}", self.stats());
    }

    /// Mark the buffer and all of its elements unusable.
    pub fn invalidate(&self) {
        self.shared
            .state
            .store(BufferState::Invalid.as_u8(), Ordering::Release);
        for slot in &self.shared.slots {
            let (frame_number, _) = slot.load();
            slot.tag
                .store(pack(frame_number, ElementState::Invalid), Ordering::Release);
        }
        self.set_release_hook(None);
        self.shared.doorbell.ring();
        warn!("streaming buffer invalidated");
    }

    pub fn ptr_eq(&self, other: &StreamingBuffer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn slot(&self, position: usize) -> &Slot {
        &self.shared.slots[position]
    }
}

impl fmt::Debug for StreamingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingBuffer")
            .field("n_elements", &self.n_elements())
            .field("shape", &self.shared.shape)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

/// The only writer of a streaming buffer. Fills slots in ring order.
pub struct BufferProducer {
    shared: Arc<Shared>,
    events: Producer<BufferEvent>,
    next: usize,
    frame_number: u64,
}

impl BufferProducer {
    /// Position the next frame will be written to.
    pub fn next_position(&self) -> usize {
        self.next
    }

    pub fn next_is_free(&self) -> bool {
        self.shared.slots[self.next].load().1 == ElementState::Free
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame_number
    }

    pub fn fill(&mut self, frame: &[i16]) -> Result<usize, BufferError> {
        if frame.len() != self.shared.frame_len {
            return Err(BufferError::FrameSize {
                expected: self.shared.frame_len,
                actual: frame.len(),
            });
        }
        self.fill_with(|_, dst| dst.copy_from_slice(frame))
    }

    /// Write the next frame in place. `write` receives the frame number.
    pub fn fill_with(
        &mut self,
        write: impl FnOnce(u64, &mut [i16]),
    ) -> Result<usize, BufferError> {
        let state = self.shared.state();
        if state != BufferState::Running {
            return Err(BufferError::NotRunning(state));
        }

        let shared = Arc::clone(&self.shared);
        let position = self.next;
        let slot = &shared.slots[position];
        let (previous, element_state) = slot.load();
        if element_state != ElementState::Free {
            shared.stats.overflows.fetch_add(1, Ordering::Relaxed);
            warn!("buffer overflow: element {} still {:?}", position, element_state);
            self.notify(BufferEvent::Overflow { position });
            if shared.stop_on_overflow {
                StreamingBuffer { shared }.invalidate();
            }
            return Err(BufferError::Overflow { position });
        }

        let frame_number = self.frame_number;
        {
            let mut data = slot.data.write().unwrap_or_else(PoisonError::into_inner);
            write(frame_number, &mut data);
        }

        if slot
            .tag
            .compare_exchange(
                pack(previous, ElementState::Free),
                pack(frame_number, ElementState::Ready),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(BufferError::NotRunning(shared.state()));
        }
        // lost a race with shutdown
        let state = shared.state();
        if state != BufferState::Running {
            slot.transition(frame_number, ElementState::Ready, ElementState::Free);
            return Err(BufferError::NotRunning(state));
        }

        shared.stats.filled.fetch_add(1, Ordering::Relaxed);
        self.frame_number += 1;
        self.next = (position + 1) % shared.slots.len();
        self.notify(BufferEvent::Ready {
            position,
            frame_number,
        });
        Ok(position)
    }

    /// Queue an event for the subscriber, if any.
    ///
    /// Ready events are never dropped: when the queue is full they go to the
    /// spill list, and once anything is spilled later events follow it there
    /// to keep frame order. Overflows are coalesced so repeated failed fills
    /// against a held slot queue a single notice.
    fn notify(&mut self, event: BufferEvent) {
        let shared = &self.shared;
        if shared.subscribed.load(Ordering::Acquire) {
            let queue = match event {
                BufferEvent::Overflow { .. } => !shared.overflow_queued.swap(true, Ordering::AcqRel),
                BufferEvent::Ready { .. } => true,
            };
            if queue {
                if shared.spilled.load(Ordering::Acquire) || self.events.push(event).is_err() {
                    let mut spill = shared.spill.lock().unwrap_or_else(PoisonError::into_inner);
                    if spill.is_empty() {
                        debug!("event queue full, spilling from {:?}", event);
                    }
                    spill.push_back(event);
                    shared.spilled.store(true, Ordering::Release);
                }
            }
        }
        shared.doorbell.ring();
    }
}

/// One acquired frame, held until released.
#[derive(Clone)]
pub struct BufferElement {
    buffer: StreamingBuffer,
    position: usize,
    frame_number: u64,
}

impl BufferElement {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn shape(&self) -> &[usize] {
        self.buffer.shape()
    }

    /// Whether the slot still holds this frame, ready and unreleased.
    pub fn is_current(&self) -> bool {
        self.buffer.slot(self.position).load() == (self.frame_number, ElementState::Ready)
    }

    /// Borrow the frame samples.
    pub fn data(&self) -> Result<RwLockReadGuard<'_, Vec<i16>>, BufferError> {
        let state = self.buffer.state();
        if state == BufferState::Invalid {
            return Err(BufferError::NotRunning(state));
        }
        let data = self
            .buffer
            .slot(self.position)
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.is_current() {
            return Err(BufferError::Stale {
                position: self.position,
                frame_number: self.frame_number,
            });
        }
        Ok(data)
    }

    pub fn to_vec(&self) -> Result<Vec<i16>, BufferError> {
        self.data().map(|data| data.to_vec())
    }

    /// Hand the slot back to the producer. Releasing twice is a no-op.
    pub fn release(&self) -> Result<(), BufferError> {
        let slot = self.buffer.slot(self.position);
        if !slot.transition(self.frame_number, ElementState::Ready, ElementState::Free) {
            return match self.buffer.state() {
                BufferState::Invalid => Err(BufferError::NotRunning(BufferState::Invalid)),
                _ => Ok(()),
            };
        }

        let shared = &self.buffer.shared;
        shared.stats.released.fetch_add(1, Ordering::Relaxed);
        let hook = shared
            .release_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(self.position);
        }
        shared.doorbell.ring();
        Ok(())
    }
}

impl fmt::Debug for BufferElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferElement")
            .field("position", &self.position)
            .field("frame_number", &self.frame_number)
            .finish()
    }
}

/// What a subscriber receives.
#[derive(Debug)]
pub enum Delivery {
    Element(BufferElement),
    Overflow { position: usize },
    /// Buffer stopped producing; no more deliveries will follow.
    Closed(BufferState),
}

/// Consumer side of the ready queue. Dropping it unsubscribes.
pub struct BufferSubscription {
    buffer: StreamingBuffer,
    events: Option<Consumer<BufferEvent>>,
    backlog: VecDeque<BufferEvent>,
    last_frame: Option<u64>,
}

impl BufferSubscription {
    pub fn buffer(&self) -> &StreamingBuffer {
        &self.buffer
    }

    fn pop_event(&mut self) -> Option<BufferEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        if let Ok(event) = self.events.as_mut()?.pop() {
            return Some(event);
        }
        let shared = &self.buffer.shared;
        if !shared.spilled.load(Ordering::Acquire) {
            return None;
        }
        let mut spill = shared.spill.lock().unwrap_or_else(PoisonError::into_inner);
        let event = spill.pop_front();
        if spill.is_empty() {
            shared.spilled.store(false, Ordering::Release);
        }
        event
    }

    /// Next delivery without waiting.
    pub fn try_next(&mut self) -> Option<Delivery> {
        while let Some(event) = self.pop_event() {
            match event {
                BufferEvent::Ready {
                    position,
                    frame_number,
                } => {
                    if self.last_frame.is_some_and(|last| frame_number <= last) {
                        continue;
                    }
                    let element = BufferElement {
                        buffer: self.buffer.clone(),
                        position,
                        frame_number,
                    };
                    // freed by shutdown or invalidated
                    if !element.is_current() {
                        continue;
                    }
                    self.last_frame = Some(frame_number);
                    return Some(Delivery::Element(element));
                }
                BufferEvent::Overflow { position } => {
                    self.buffer
                        .shared
                        .overflow_queued
                        .store(false, Ordering::Release);
                    return Some(Delivery::Overflow { position });
                }
            }
        }

        match self.buffer.state() {
            BufferState::Running => None,
            state => Some(Delivery::Closed(state)),
        }
    }

    /// Next delivery, waiting at most `timeout`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.buffer.shared.doorbell.count();
            if let Some(delivery) = self.try_next() {
                return Some(delivery);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.buffer.shared.doorbell.wait_past(seen, deadline - now);
        }
    }
}

impl Drop for BufferSubscription {
    fn drop(&mut self) {
        let shared = &self.buffer.shared;
        shared.subscribed.store(false, Ordering::Release);
        if let Some(consumer) = self.events.take() {
            *shared.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(consumer);
        }
    }
}
