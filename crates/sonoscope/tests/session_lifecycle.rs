//! End-to-end session scenarios against the simulated core.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use sonoconf::SystemKind;
use sonoscope::{
    BufferState, ComputeCapabilities, Device, DeviceId, DeviceType, ElementState, Gain, Lambda,
    LinSequence, Pipeline, Processing, Pulse, RunnerEvent, RunnerOutputs, Scheme, Session,
    SessionError, SessionState, SonoConfig, StreamingBuffer, TerminationReason, UltrasoundDevice,
    WorkMode,
};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

fn config(work_mode: WorkMode, buffer_elements: u32) -> SonoConfig {
    let mut config = SonoConfig::default();
    config.system.probe.n_elements = 16;
    config.system.n_modules = 2;
    config.system.channels_per_module = 8;
    config.system.compute.gpu_ordinal = None;
    config.system.acquisition.work_mode = work_mode;
    config.system.acquisition.buffer_elements = buffer_elements;
    config
}

fn session_with(config: SonoConfig) -> Session {
    Session::builder()
        .config(config)
        .capabilities(ComputeCapabilities::cpu_only())
        .build()
        .unwrap()
}

fn session(work_mode: WorkMode, buffer_elements: u32) -> Session {
    session_with(config(work_mode, buffer_elements))
}

fn lin(pri: f64) -> LinSequence {
    LinSequence {
        tx_aperture_center_element: vec![4.0, 8.0, 12.0],
        tx_aperture_size: 8,
        tx_focus: 20e-3,
        pulse: Pulse::new(6e6, 2.0),
        rx_aperture_center_element: vec![4.0, 8.0, 12.0],
        rx_aperture_size: 16,
        rx_sample_range: (0, 32),
        downsampling_factor: 1,
        pri,
        speed_of_sound: None,
        tgc_start: 14.0,
        tgc_slope: 2e2,
    }
}

fn upload_buffer(session: &mut Session, scheme: Scheme) -> StreamingBuffer {
    let (buffer, _metadata) = session.upload(scheme).unwrap().into_buffer().unwrap();
    buffer
}

fn upload_processed(session: &mut Session, scheme: Scheme) -> RunnerOutputs {
    session.upload(scheme).unwrap().into_outputs().unwrap()
}

fn next_event(outputs: &mut RunnerOutputs) -> RunnerEvent {
    tokio_test::block_on(async { tokio::time::timeout(FRAME_TIMEOUT, outputs.recv()).await })
        .expect("timed out waiting for a runner event")
        .expect("runner output closed")
}

/// Next frame number, skipping overflow notifications.
fn next_frame_number(outputs: &mut RunnerOutputs) -> u64 {
    loop {
        match next_event(outputs) {
            RunnerEvent::Frame(frame) => {
                return frame.metadata.expect("metadata extraction enabled").frame_number
            }
            RunnerEvent::Overflow { .. } => continue,
            RunnerEvent::Terminated(reason) => panic!("runner terminated: {:?}", reason),
        }
    }
}

/// Drain until the terminal event.
fn termination(outputs: &mut RunnerOutputs) -> Option<TerminationReason> {
    loop {
        let event = tokio_test::block_on(async { tokio::time::timeout(FRAME_TIMEOUT, outputs.recv()).await })
            .expect("timed out waiting for termination")?;
        if let RunnerEvent::Terminated(reason) = event {
            return Some(reason);
        }
    }
}

#[test]
fn test_compilation_is_deterministic() {
    let mut first = session(WorkMode::Manual, 2);
    let mut second = session(WorkMode::Manual, 2);
    let a = upload_buffer(&mut first, Scheme::new(lin(100e-6)));
    let b = upload_buffer(&mut second, Scheme::new(lin(100e-6)));

    let meta_a = first.metadata().unwrap();
    let meta_b = second.metadata().unwrap();
    assert_eq!(meta_a.context.raw_sequence, meta_b.context.raw_sequence);
    assert_eq!(meta_a.input_shape, meta_b.input_shape);

    for session in [&mut first, &mut second] {
        session.start_scheme().unwrap();
        session.run().unwrap();
    }
    assert_eq!(
        a.element(0).unwrap().to_vec().unwrap(),
        b.element(0).unwrap().to_vec().unwrap()
    );
}

#[test]
fn test_close_leaves_every_element_free() {
    let mut session = session(WorkMode::Manual, 4);
    let buffer = upload_buffer(&mut session, Scheme::new(lin(100e-6)));
    session.start_scheme().unwrap();
    session.run().unwrap();
    session.run().unwrap();
    assert_eq!(buffer.count_in_state(ElementState::Ready), 2);

    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(buffer.state(), BufferState::Shutdown);
    assert_eq!(buffer.count_in_state(ElementState::Free), 4);
}

#[test]
fn test_lifecycle_calls_before_upload() {
    let mut session = session(WorkMode::Manual, 2);
    assert!(matches!(session.start_scheme(), Err(SessionError::NotUploaded)));
    assert_eq!(session.state(), SessionState::Created);
    assert!(matches!(session.run(), Err(SessionError::NotUploaded)));
    assert!(matches!(session.stop_scheme(), Err(SessionError::NotUploaded)));
    assert_eq!(session.state(), SessionState::Created);
}

#[test]
fn test_every_operation_fails_after_close() {
    let mut session = session(WorkMode::Manual, 2);
    upload_buffer(&mut session, Scheme::new(lin(100e-6)));
    session.close().unwrap();

    assert!(matches!(
        session.upload(Scheme::new(lin(100e-6))),
        Err(SessionError::SessionClosed)
    ));
    assert!(matches!(session.start_scheme(), Err(SessionError::SessionClosed)));
    assert!(matches!(session.stop_scheme(), Err(SessionError::SessionClosed)));
    assert!(matches!(session.run(), Err(SessionError::SessionClosed)));
    assert!(matches!(
        session.get_device("/Ultrasound:0"),
        Err(SessionError::SessionClosed)
    ));
    assert!(matches!(
        session.set_medium(sonoscope::Medium::soft_tissue()),
        Err(SessionError::SessionClosed)
    ));
    assert!(matches!(
        session.set_parameter("gain", &[1.0]),
        Err(SessionError::SessionClosed)
    ));
    assert!(matches!(
        session.get_parameter("gain"),
        Err(SessionError::SessionClosed)
    ));
    assert!(matches!(
        session.get_parameters(),
        Err(SessionError::SessionClosed)
    ));
    assert!(matches!(session.medium(), Err(SessionError::SessionClosed)));
    assert!(session.buffer().is_none());
    session.close().unwrap();
}

#[test]
fn test_ultrasound_device_is_shared() {
    let mut session = session(WorkMode::Manual, 2);
    let first = session.get_device("/Ultrasound:0").unwrap();
    let second = session.get_device("/Ultrasound:0").unwrap();
    assert!(first.ptr_eq(&second));
    assert_eq!(first.id(), DeviceId::new(DeviceType::Us4R, 0));

    let ultrasound = first.as_ultrasound().unwrap();
    assert_eq!(ultrasound.get_dto().probe.n_elements, 16);
}

#[test]
fn test_devices_without_wrapper_not_found() {
    let mut session = session(WorkMode::Manual, 2);
    assert!(matches!(
        session.get_device("/Us4OEM:0"),
        Err(SessionError::DeviceNotFound(_))
    ));
    assert!(matches!(
        session.get_device("/Us4OEM:7"),
        Err(SessionError::DeviceNotFound(_))
    ));
    assert!(matches!(
        session.get_device("Ultrasound"),
        Err(SessionError::DeviceNotFound(_))
    ));
    assert!(matches!(
        session.get_device("/GPU:0"),
        Err(SessionError::DeviceNotFound(_))
    ));
    assert!(matches!(session.get_device("/CPU:0"), Ok(Device::Compute(_))));
}

#[test]
fn test_upload_without_processing_returns_buffer() {
    let mut session = session(WorkMode::Manual, 2);
    let output = session.upload(Scheme::new(lin(100e-6))).unwrap();
    let metadata = output.metadata().clone();
    assert!(!metadata.is_iq_data);
    assert_eq!(metadata.input_shape, vec![3, 32, 16]);

    let (buffer, _) = output.into_buffer().unwrap();
    assert_eq!(buffer.n_elements(), 2);
    assert_eq!(buffer.shape(), metadata.input_shape.as_slice());
    assert_eq!(session.get_parameter("gain").unwrap(), None);
    assert!(!session.set_parameter("gain", &[2.0]).unwrap());
}

#[test]
fn test_pipeline_upload_exposes_parameters() {
    let mut session = session(WorkMode::Manual, 2);
    let outputs = upload_processed(
        &mut session,
        Scheme::new(lin(100e-6)).with_processing(Pipeline::new().with_step(Gain::new(2.0))),
    );
    assert_eq!(outputs.metadata().dtype, sonoscope::DataType::Float32);

    let names: BTreeSet<String> = session
        .get_parameters()
        .unwrap()
        .unwrap()
        .into_keys()
        .collect();
    assert_eq!(names, BTreeSet::from(["gain".to_string()]));
    assert_eq!(session.get_parameter("gain").unwrap(), Some(vec![2.0]));

    assert!(session.set_parameter("gain", &[3.5]).unwrap());
    assert_eq!(session.get_parameter("gain").unwrap(), Some(vec![3.5]));
    assert!(matches!(
        session.set_parameter("volume", &[1.0]),
        Err(SessionError::Processing(_))
    ));
}

#[test]
fn test_fifth_fill_overflows_four_elements() {
    let mut session = session(WorkMode::Manual, 4);
    let buffer = upload_buffer(&mut session, Scheme::new(lin(100e-6)));
    session.start_scheme().unwrap();
    for _ in 0..4 {
        session.run().unwrap();
    }
    assert!(matches!(
        session.run(),
        Err(SessionError::BufferOverflow { position: 0 })
    ));
    assert_eq!(buffer.stats().overflows, 1);
    // stop_on_overflow defaults to on
    assert_eq!(buffer.state(), BufferState::Invalid);
}

#[test]
fn test_manual_runs_deliver_frames_in_order() {
    let mut session = session(WorkMode::Manual, 2);
    let pipeline = Pipeline::new().with_step(Gain::new(1.0));
    let mut outputs = upload_processed(
        &mut session,
        Scheme::new(lin(100e-6))
            .with_processing(Processing::new(pipeline).with_metadata_extraction()),
    );
    session.start_scheme().unwrap();
    session.run().unwrap();
    session.run().unwrap();

    assert_eq!(next_frame_number(&mut outputs), 0);
    assert_eq!(next_frame_number(&mut outputs), 1);

    session.stop_scheme().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(matches!(session.run(), Err(SessionError::NotRunning)));
    let buffer = session.buffer().unwrap();
    assert_eq!(buffer.count_in_state(ElementState::Free), 2);
}

#[test]
fn test_restart_resumes_processing() {
    let mut session = session(WorkMode::Manual, 2);
    let pipeline = Pipeline::new().with_step(Gain::new(1.0));
    let mut outputs = upload_processed(
        &mut session,
        Scheme::new(lin(100e-6))
            .with_processing(Processing::new(pipeline).with_metadata_extraction()),
    );
    session.start_scheme().unwrap();
    session.run().unwrap();
    assert_eq!(next_frame_number(&mut outputs), 0);

    session.stop_scheme().unwrap();
    session.start_scheme().unwrap();
    session.run().unwrap();
    assert_eq!(next_frame_number(&mut outputs), 1);

    session.close().unwrap();
    assert_eq!(termination(&mut outputs), Some(TerminationReason::Stopped));
}

/// Processing whose single step takes `hold` per frame and reports entry.
fn slow_processing(hold: Duration) -> (Processing, mpsc::Receiver<()>, Arc<AtomicUsize>) {
    let (entered_tx, entered) = mpsc::channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    let pipeline = Pipeline::new().with_step(Lambda::new("slow", move |frame| {
        let _ = entered_tx.send(());
        thread::sleep(hold);
        Ok(frame)
    }));
    let processing = Processing::new(pipeline).with_callback(move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    (processing, entered, calls)
}

#[test]
fn test_stop_mid_frame_returns_after_worker() {
    let mut session = session(WorkMode::Manual, 2);
    let (processing, entered, calls) = slow_processing(Duration::from_millis(200));
    let _outputs = upload_processed(
        &mut session,
        Scheme::new(lin(100e-6)).with_processing(processing),
    );
    let buffer = session.buffer().unwrap().clone();
    session.start_scheme().unwrap();
    session.run().unwrap();

    entered.recv_timeout(FRAME_TIMEOUT).unwrap();
    session.stop_scheme().unwrap();

    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(buffer.count_in_state(ElementState::Free), 2);
    let after_stop = calls.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), after_stop);

    // the parked worker picks up again
    session.start_scheme().unwrap();
    session.run().unwrap();
    entered.recv_timeout(FRAME_TIMEOUT).unwrap();
    session.stop_scheme().unwrap();
    assert!(calls.load(Ordering::SeqCst) > after_stop);
}

#[test]
fn test_close_mid_frame_frees_elements() {
    let mut session = session(WorkMode::Manual, 2);
    let (processing, entered, calls) = slow_processing(Duration::from_millis(200));
    let mut outputs = upload_processed(
        &mut session,
        Scheme::new(lin(100e-6)).with_processing(processing),
    );
    let buffer = session.buffer().unwrap().clone();
    session.start_scheme().unwrap();
    session.run().unwrap();

    entered.recv_timeout(FRAME_TIMEOUT).unwrap();
    session.close().unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(buffer.state(), BufferState::Shutdown);
    assert_eq!(buffer.count_in_state(ElementState::Free), 2);
    let after_close = calls.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), after_close);
    assert_eq!(termination(&mut outputs), Some(TerminationReason::Stopped));
}

#[test]
fn test_host_mode_streams_past_capacity() {
    let mut session = session(WorkMode::Host, 2);
    let pipeline = Pipeline::new().with_step(Gain::new(0.5));
    let mut outputs = upload_processed(
        &mut session,
        Scheme::new(lin(100e-6))
            .with_processing(Processing::new(pipeline).with_metadata_extraction()),
    );
    session.start_scheme().unwrap();
    session.run().unwrap();
    assert!(matches!(
        session.run(),
        Err(SessionError::InvalidState {
            state: SessionState::Running,
            ..
        })
    ));

    let frames: Vec<u64> = (0..6).map(|_| next_frame_number(&mut outputs)).collect();
    assert_eq!(frames, vec![0, 1, 2, 3, 4, 5]);

    session.stop_scheme().unwrap();
    // a fresh start may trigger again
    session.start_scheme().unwrap();
    session.run().unwrap();
    session.close().unwrap();
    // undrained frames may leave no room for the terminal event
    assert!(matches!(
        termination(&mut outputs),
        Some(TerminationReason::Stopped) | None
    ));
}

#[test]
fn test_async_mode_paces_frames() {
    let mut config = config(WorkMode::Async, 4);
    config.system.acquisition.stop_on_overflow = false;
    let mut session = session_with(config);
    let pipeline = Pipeline::new().with_step(Gain::new(1.0));
    // 3 ops at 5 ms: one frame every 15 ms
    let mut outputs = upload_processed(
        &mut session,
        Scheme::new(lin(5e-3))
            .with_processing(Processing::new(pipeline).with_metadata_extraction()),
    );
    session.start_scheme().unwrap();
    session.run().unwrap();

    let mut last = None;
    for _ in 0..3 {
        let frame = next_frame_number(&mut outputs);
        assert!(last.map_or(true, |last| frame > last));
        last = Some(frame);
    }
    session.stop_scheme().unwrap();
    let stats = session.processing_stats().unwrap();
    assert!(stats.processed.load(Ordering::Relaxed) >= 3);
}

#[test]
fn test_gpu_pipeline_without_gpu_is_invalid() {
    let mut session = session(WorkMode::Manual, 2);
    let pipeline = Pipeline::new()
        .with_step(Gain::new(1.0))
        .placed_on(DeviceId::new(DeviceType::Gpu, 0));
    assert!(matches!(
        session.upload(Scheme::new(lin(100e-6)).with_processing(pipeline)),
        Err(SessionError::InvalidScheme(_))
    ));
    assert!(matches!(
        session.upload(Scheme::new(lin(100e-6)).with_processing(Pipeline::new())),
        Err(SessionError::InvalidScheme(_))
    ));
    assert_eq!(session.state(), SessionState::Created);
}

#[test]
fn test_invalid_sequence_leaves_state() {
    let mut session = session(WorkMode::Manual, 2);
    let mut sequence = lin(100e-6);
    sequence.tx_aperture_size = 64;
    assert!(matches!(
        session.upload(Scheme::new(sequence)),
        Err(SessionError::Kernel(_))
    ));
    assert_eq!(session.state(), SessionState::Created);
    assert!(session.buffer().is_none());
}

#[test]
fn test_file_device_replays_recording() {
    // [1 event, 4 samples, 8 channels], two frames
    let samples: Vec<i16> = (100..164).collect();
    let mut recording = tempfile::NamedTempFile::new().unwrap();
    for sample in &samples {
        recording.write_all(&sample.to_le_bytes()).unwrap();
    }
    recording.flush().unwrap();

    let mut config = config(WorkMode::Manual, 2);
    config.system.kind = SystemKind::File;
    config.system.probe.n_elements = 8;
    config.system.n_modules = 1;
    config.system.file.path = Some(recording.path().to_path_buf());
    let mut session = session_with(config);

    let device = session.get_device("/Ultrasound:0").unwrap();
    match &device {
        Device::File(file) => assert_eq!(file.source(), Some(&recording.path().to_path_buf())),
        other => panic!("expected file device, got {:?}", other),
    }
    assert!(device.ptr_eq(&session.get_device("/File:0").unwrap()));

    let sequence = LinSequence {
        tx_aperture_center_element: vec![3.5],
        tx_aperture_size: 8,
        rx_aperture_center_element: vec![3.5],
        rx_aperture_size: 8,
        rx_sample_range: (0, 4),
        ..lin(100e-6)
    };
    let output = session.upload(Scheme::new(sequence)).unwrap();
    assert!(output.metadata().data_description.frame_channel_mapping.is_none());
    let (buffer, _) = output.into_buffer().unwrap();
    assert_eq!(buffer.shape(), &[1, 4, 8]);

    session.start_scheme().unwrap();
    session.run().unwrap();
    session.run().unwrap();
    let second = buffer.element(1).unwrap().to_vec().unwrap();
    assert_eq!(second[0], 1);
    assert_eq!(&second[1..], &samples[33..64]);
}

#[test]
fn test_open_from_session_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[system]
n_modules = 1
channels_per_module = 16

[system.probe]
n_elements = 16

[system.acquisition]
work_mode = "manual"
buffer_elements = 3

[system.compute]
gpu_ordinal = 3
gpu_device_node = "/nonexistent/gpu"
"#
    )
    .unwrap();

    let medium = sonoscope::Medium::new("water", 1480.0);
    let mut session = Session::open(file.path(), Some(medium)).unwrap();
    assert_eq!(session.medium().unwrap().speed_of_sound, 1480.0);
    assert_eq!(session.config().system.acquisition.buffer_elements, 3);
    assert!(session.get_device("/GPU:3").is_err());

    let buffer = upload_buffer(&mut session, Scheme::new(lin(100e-6)));
    assert_eq!(buffer.n_elements(), 3);
}

#[test]
fn test_open_missing_session_file() {
    assert!(matches!(
        Session::open("/nonexistent/session.toml", None),
        Err(SessionError::Config(_))
    ));
}
