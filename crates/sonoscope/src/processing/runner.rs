//! Processing runner: drains a streaming buffer through a pipeline.
//!
//! Architecture:
//! ```text
//! StreamingBuffer ──subscribe──► worker thread ("sonoscope-processing")
//!                                     │
//!                       for each ready element, in order:
//!                         data → Frame → Pipeline::process
//!                         release element
//!                         callback(&output)          (optional)
//!                                     │
//!                                     ▼
//!                        tokio mpsc ──► RunnerOutputs (recv / stream)
//! ```
//!
//! `close()` joins the worker; once it returns no callback fires and the
//! subscription is gone. The pipeline survives a close so the runner can
//! be resumed when the scheme is re-armed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn, Dispatch};

use super::{Frame, ParameterHandle, Processing, ProcessingError};
use crate::buffer::{BufferElement, BufferState, BufferSubscription, Delivery, StreamingBuffer};
use crate::metadata::{ConstMetadata, FrameMetadata};

/// How long the worker waits for a frame before re-checking its running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Back-off while the output channel is full.
const SEND_RETRY: Duration = Duration::from_millis(1);
const SEND_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFrame {
    pub frame: Frame,
    /// Present when metadata extraction is enabled.
    pub metadata: Option<FrameMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    /// Runner was shut down by its owner
    Stopped,
    BufferShutdown,
    /// Buffer overflowed with stop-on-overflow set
    BufferInvalid,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    Frame(ProcessedFrame),
    /// The producer found no free element; the frame was not acquired.
    Overflow { position: usize },
    /// Last event on the channel.
    Terminated(TerminationReason),
}

#[derive(Debug, Default)]
pub struct RunnerStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub overflows: AtomicU64,
    /// Outputs not delivered because the channel stayed full or was closed
    pub dropped_outputs: AtomicU64,
}

/// Receiving end of a runner.
#[derive(Debug)]
pub struct RunnerOutputs {
    receiver: mpsc::Receiver<RunnerEvent>,
    metadata: Arc<ConstMetadata>,
}

impl RunnerOutputs {
    /// Description of the pipeline's output frames.
    pub fn metadata(&self) -> &Arc<ConstMetadata> {
        &self.metadata
    }

    pub async fn recv(&mut self) -> Option<RunnerEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<RunnerEvent> {
        self.receiver.try_recv().ok()
    }

    /// Blocking receive; must not be called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<RunnerEvent> {
        self.receiver.blocking_recv()
    }

    pub fn into_stream(self) -> ReceiverStream<RunnerEvent> {
        ReceiverStream::new(self.receiver)
    }
}

/// State moved into the worker thread and handed back on join.
struct Worker {
    processing: Processing,
    sender: mpsc::Sender<RunnerEvent>,
    terminated: bool,
}

pub struct ProcessingRunner {
    buffer: StreamingBuffer,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<Worker>>,
    parked: Option<Worker>,
    parameters: ParameterHandle,
    stats: Arc<RunnerStats>,
    output_metadata: Arc<ConstMetadata>,
    dispatch: Dispatch,
}

impl ProcessingRunner {
    /// Prepare the pipeline against `metadata` and start draining `buffer`.
    pub fn start(
        buffer: &StreamingBuffer,
        metadata: Arc<ConstMetadata>,
        mut processing: Processing,
    ) -> Result<(Self, RunnerOutputs), ProcessingError> {
        let output_metadata = Arc::new(processing.pipeline.prepare(&metadata)?);
        let parameters = processing.pipeline.parameters().clone();
        let (sender, receiver) = mpsc::channel(buffer.n_elements().max(1));

        let mut runner = Self {
            buffer: buffer.clone(),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            parked: Some(Worker {
                processing,
                sender,
                terminated: false,
            }),
            parameters,
            stats: Arc::new(RunnerStats::default()),
            output_metadata: Arc::clone(&output_metadata),
            dispatch: tracing::dispatcher::get_default(|d| d.clone()),
        };
        runner.resume()?;

        Ok((
            runner,
            RunnerOutputs {
                receiver,
                metadata: output_metadata,
            },
        ))
    }

    /// Spawn the worker again after `close`.
    pub fn resume(&mut self) -> Result<(), ProcessingError> {
        if self.thread_handle.is_some() {
            return Ok(());
        }
        let worker = self.parked.take().ok_or(ProcessingError::WorkerLost)?;
        if worker.terminated {
            debug!("processing already terminated, not resuming");
            self.parked = Some(worker);
            return Ok(());
        }
        let subscription = match self.buffer.subscribe() {
            Ok(subscription) => subscription,
            Err(e) => {
                self.parked = Some(worker);
                return Err(e.into());
            }
        };

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let dispatch = self.dispatch.clone();

        let spawned = thread::Builder::new()
            .name("sonoscope-processing".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    run_worker(worker, subscription, running, stats)
                })
            });
        match spawned {
            Ok(handle) => {
                self.thread_handle = Some(handle);
                info!("processing runner started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(ProcessingError::Spawn(e))
            }
        }
    }

    /// Stop the worker and wait for it. Idempotent.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            match handle.join() {
                Ok(worker) => self.parked = Some(worker),
                Err(_) => error!("processing worker panicked"),
            }
            info!(
                "processing runner closed: {} frames processed",
                self.stats.processed.load(Ordering::Relaxed)
            );
        }
    }

    /// Whether the worker is currently draining the buffer.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self
                .thread_handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    pub fn parameters(&self) -> &ParameterHandle {
        &self.parameters
    }

    pub fn stats(&self) -> &Arc<RunnerStats> {
        &self.stats
    }

    pub fn output_metadata(&self) -> &Arc<ConstMetadata> {
        &self.output_metadata
    }
}

impl Drop for ProcessingRunner {
    fn drop(&mut self) {
        self.close();
        if let Some(worker) = self.parked.take() {
            if !worker.terminated {
                let _ = worker
                    .sender
                    .try_send(RunnerEvent::Terminated(TerminationReason::Stopped));
            }
        }
    }
}

fn run_worker(
    mut worker: Worker,
    mut subscription: BufferSubscription,
    running: Arc<AtomicBool>,
    stats: Arc<RunnerStats>,
) -> Worker {
    debug!("processing worker started");
    let mut reason = None;

    while running.load(Ordering::Acquire) {
        let Some(delivery) = subscription.next_timeout(POLL_INTERVAL) else {
            continue;
        };

        match delivery {
            Delivery::Element(element) => {
                let result = process_element(&mut worker.processing, &element);
                if let Err(e) = element.release() {
                    debug!("release of element {} failed: {}", element.position(), e);
                }

                match result {
                    Ok(processed) => {
                        stats.processed.fetch_add(1, Ordering::Relaxed);
                        if let Some(callback) = worker.processing.callback.as_mut() {
                            callback(&processed);
                        }
                        if !send(&worker.sender, RunnerEvent::Frame(processed), &running) {
                            stats.dropped_outputs.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    // element went away underneath us; the next delivery says why
                    Err(ProcessingError::Buffer(e)) => {
                        warn!("skipping element {}: {}", element.position(), e);
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        error!("processing failed on frame {}: {}", element.frame_number(), e);
                        reason = Some(TerminationReason::Failed(e.to_string()));
                        break;
                    }
                }
            }
            Delivery::Overflow { position } => {
                stats.overflows.fetch_add(1, Ordering::Relaxed);
                warn!("acquisition overflowed at element {}", position);
                send(&worker.sender, RunnerEvent::Overflow { position }, &running);
            }
            Delivery::Closed(state) => {
                reason = Some(match state {
                    BufferState::Invalid => TerminationReason::BufferInvalid,
                    _ => TerminationReason::BufferShutdown,
                });
                break;
            }
        }
    }
    drop(subscription);

    if let Some(reason) = reason {
        info!("processing terminated: {:?}", reason);
        send(&worker.sender, RunnerEvent::Terminated(reason), &running);
        worker.terminated = true;
        running.store(false, Ordering::Release);
    }
    debug!("processing worker exiting");
    worker
}

fn process_element(
    processing: &mut Processing,
    element: &BufferElement,
) -> Result<ProcessedFrame, ProcessingError> {
    let (input, metadata) = {
        let data = element.data()?;
        let metadata = processing.extract_metadata.then(|| FrameMetadata {
            frame_number: element.frame_number(),
            position: element.position(),
            trigger_counter: data.first().copied().unwrap_or_default(),
        });
        (Frame::from_i16(&data, element.shape()), metadata)
    };
    let output = processing.pipeline.process(input)?;
    Ok(ProcessedFrame {
        frame: output,
        metadata,
    })
}

/// Deliver `event`, retrying briefly while the channel is full.
///
/// Returns false if the event was dropped.
fn send(sender: &mpsc::Sender<RunnerEvent>, event: RunnerEvent, running: &AtomicBool) -> bool {
    let mut event = event;
    for _ in 0..SEND_ATTEMPTS {
        match sender.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(returned)) => {
                if !running.load(Ordering::Acquire) {
                    return false;
                }
                event = returned;
                thread::sleep(SEND_RETRY);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ElementState;
    use crate::processing::{Gain, Lambda, Pipeline};
    use crate::test_support::metadata_with_shape;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{mpsc as std_mpsc, Mutex};

    fn setup(n: usize) -> (StreamingBuffer, crate::buffer::BufferProducer, Arc<ConstMetadata>) {
        let (buffer, producer) = StreamingBuffer::new(n, vec![1, 2, 2], true).unwrap();
        (buffer, producer, Arc::new(metadata_with_shape(vec![1, 2, 2])))
    }

    fn next_event(outputs: &mut RunnerOutputs) -> RunnerEvent {
        tokio_test::block_on(async {
            tokio::time::timeout(Duration::from_secs(5), outputs.recv())
                .await
                .expect("runner event")
                .expect("channel open")
        })
    }

    #[test]
    fn test_runner_processes_and_releases_in_order() {
        let (buffer, mut producer, metadata) = setup(4);
        let pipeline = Pipeline::new().with_step(Gain::new(2.0));
        let (mut runner, mut outputs) =
            ProcessingRunner::start(&buffer, metadata, Processing::new(pipeline)).unwrap();

        producer.fill(&[1, 1, 1, 1]).unwrap();
        producer.fill(&[2, 2, 2, 2]).unwrap();

        for expected in [2.0f32, 4.0] {
            match next_event(&mut outputs) {
                RunnerEvent::Frame(out) => {
                    assert_eq!(out.frame.data, vec![expected; 4]);
                    assert!(out.metadata.is_none());
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        runner.close();
        assert_eq!(buffer.stats().released, 2);
        assert!(!runner.is_running());
    }

    #[test]
    fn test_parameter_change_applies_to_later_frames() {
        let (buffer, mut producer, metadata) = setup(2);
        let pipeline = Pipeline::new().with_step(Gain::new(1.0));
        let (mut runner, mut outputs) =
            ProcessingRunner::start(&buffer, metadata, Processing::new(pipeline)).unwrap();

        runner.parameters().set_parameter("gain", &[3.0]).unwrap();
        producer.fill(&[1, 2, 3, 4]).unwrap();
        match next_event(&mut outputs) {
            RunnerEvent::Frame(out) => assert_eq!(out.frame.data, vec![3.0, 6.0, 9.0, 12.0]),
            other => panic!("unexpected {:?}", other),
        }
        runner.close();
    }

    #[test]
    fn test_callback_and_metadata_extraction() {
        let (buffer, mut producer, metadata) = setup(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_callback = Arc::clone(&seen);
        let processing = Processing::new(Pipeline::new().with_step(Gain::new(1.0)))
            .with_callback(move |out| {
                if let Some(meta) = out.metadata {
                    seen_by_callback.lock().unwrap().push(meta.trigger_counter);
                }
            })
            .with_metadata_extraction();
        let (mut runner, mut outputs) =
            ProcessingRunner::start(&buffer, metadata, processing).unwrap();

        producer.fill(&[7, 0, 0, 0]).unwrap();
        match next_event(&mut outputs) {
            RunnerEvent::Frame(out) => {
                let meta = out.metadata.unwrap();
                assert_eq!(meta.frame_number, 0);
                assert_eq!(meta.trigger_counter, 7);
            }
            other => panic!("unexpected {:?}", other),
        }
        runner.close();
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_buffer_shutdown_terminates_runner() {
        let (buffer, _producer, metadata) = setup(2);
        let (runner, mut outputs) = ProcessingRunner::start(
            &buffer,
            metadata,
            Processing::new(Pipeline::new().with_step(Gain::new(1.0))),
        )
        .unwrap();

        buffer.shutdown();
        assert_eq!(
            next_event(&mut outputs),
            RunnerEvent::Terminated(TerminationReason::BufferShutdown)
        );
        drop(runner);
        // no second terminal event
        assert!(tokio_test::block_on(outputs.recv()).is_none());
    }

    #[test]
    fn test_close_then_resume() {
        let (buffer, mut producer, metadata) = setup(2);
        let (mut runner, mut outputs) = ProcessingRunner::start(
            &buffer,
            metadata,
            Processing::new(Pipeline::new().with_step(Gain::new(1.0))),
        )
        .unwrap();

        runner.close();
        producer.fill(&[5, 5, 5, 5]).unwrap();
        assert!(outputs.try_recv().is_none());

        runner.resume().unwrap();
        assert!(matches!(next_event(&mut outputs), RunnerEvent::Frame(_)));

        drop(runner);
        assert_eq!(
            next_event(&mut outputs),
            RunnerEvent::Terminated(TerminationReason::Stopped)
        );
    }

    #[test]
    fn test_close_mid_frame_waits_for_worker() {
        let (buffer, mut producer, metadata) = setup(2);
        let (entered_tx, entered) = std_mpsc::channel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let pipeline = Pipeline::new().with_step(Lambda::new("slow", move |frame| {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(200));
            Ok(frame)
        }));
        let processing = Processing::new(pipeline).with_callback(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        let (mut runner, _outputs) = ProcessingRunner::start(&buffer, metadata, processing).unwrap();

        producer.fill(&[1, 2, 3, 4]).unwrap();
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        runner.close();

        assert!(!runner.is_running());
        assert_eq!(buffer.count_in_state(ElementState::Free), 2);
        let after_close = calls.load(Ordering::SeqCst);
        assert!(after_close <= 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), after_close);
    }

    #[test]
    fn test_overflow_burst_does_not_stall_processing() {
        let (buffer, mut producer) = StreamingBuffer::new(2, vec![1, 2, 2], false).unwrap();
        let metadata = Arc::new(metadata_with_shape(vec![1, 2, 2]));
        let (entered_tx, entered) = std_mpsc::channel();
        let (gate_tx, gate) = std_mpsc::channel::<()>();
        let pipeline = Pipeline::new().with_step(Lambda::new("gate", move |frame| {
            let _ = entered_tx.send(());
            // returns at once when the gate is dropped
            let _ = gate.recv_timeout(Duration::from_secs(5));
            Ok(frame)
        }));
        let (mut runner, mut outputs) =
            ProcessingRunner::start(&buffer, metadata, Processing::new(pipeline)).unwrap();

        producer.fill(&[1, 1, 1, 1]).unwrap();
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        producer.fill(&[2, 2, 2, 2]).unwrap();
        for _ in 0..40 {
            assert!(matches!(
                producer.fill(&[0, 0, 0, 0]),
                Err(crate::buffer::BufferError::Overflow { position: 0 })
            ));
        }
        drop(gate_tx);

        let mut frames = Vec::new();
        let mut overflows = 0;
        let mut refilled = false;
        while frames.len() < 3 {
            match next_event(&mut outputs) {
                RunnerEvent::Frame(out) => frames.push(out.frame.data[0]),
                RunnerEvent::Overflow { position } => {
                    assert_eq!(position, 0);
                    overflows += 1;
                }
                other => panic!("unexpected {:?}", other),
            }
            if !refilled && !frames.is_empty() {
                refilled = true;
                let deadline = std::time::Instant::now() + Duration::from_secs(5);
                while !producer.next_is_free() && std::time::Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
                producer.fill(&[3, 3, 3, 3]).unwrap();
            }
        }

        assert_eq!(frames, vec![1.0, 2.0, 3.0]);
        assert_eq!(overflows, 1);
        assert_eq!(buffer.stats().overflows, 40);
        runner.close();
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let (buffer, _producer, metadata) = setup(2);
        let result = ProcessingRunner::start(&buffer, metadata, Processing::new(Pipeline::new()));
        assert!(matches!(result, Err(ProcessingError::EmptyPipeline)));
    }
}
