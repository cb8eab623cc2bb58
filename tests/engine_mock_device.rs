use std::time::Duration;

use spectro_daq::mock::MockDevice;
use spectro_daq::{
    Channel, Command, DaqConfig, DaqError, Engine, EngineStatus, Link, Mode, ReadStrategy,
    StopReason,
};

fn test_config() -> DaqConfig {
    DaqConfig {
        read_timeout_ms: 50,
        handshake_timeout_ms: 50,
        settle_delay_ms: 0,
        sample_delay_ms: 5,
        warmup_reads: 2,
        n_reads_per_chunk: 2,
        ..DaqConfig::default()
    }
}

fn spawn_engine(device: &MockDevice, config: DaqConfig) -> Engine {
    Engine::spawn(Link::from_channel(Box::new(device.clone())), config).unwrap()
}

/// Poll `cond` until it holds or two seconds pass.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn assert_contiguous(engine: &Engine, delay_ms: u64) {
    let samples = engine.snapshot();
    for pair in samples.windows(2) {
        assert_eq!(
            pair[1].timestamp_ms - pair[0].timestamp_ms,
            delay_ms,
            "gap or duplicate between {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}

/// First streamed timestamp at or after `clock_ms`.
fn first_sample_since(engine: &Engine, clock_ms: u64) -> Option<u64> {
    engine
        .snapshot()
        .iter()
        .map(|s| s.timestamp_ms)
        .find(|&t| t >= clock_ms)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_fills_series_after_warmup() {
    let device = MockDevice::new();
    let mut engine = spawn_engine(&device, test_config());

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| engine.series().len() >= 10).await;

    let commands = device.commands();
    let delay_at = commands.iter().position(|&c| c == Command::SetStreamDelay);
    let start_at = commands.iter().position(|&c| c == Command::StartStream);
    assert!(delay_at.unwrap() < start_at.unwrap());
    assert_eq!(device.stream_delay_ms(), Some(5));

    // Two warm-up records (t=0, t=5) are discarded.
    assert_eq!(engine.snapshot()[0].timestamp_ms, 10);
    assert_contiguous(&engine, 5);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drain_strategy_loses_and_duplicates_nothing() {
    let device = MockDevice::new();
    let config = DaqConfig {
        strategy: ReadStrategy::Drain,
        ..test_config()
    };
    let mut engine = spawn_engine(&device, config);

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| engine.series().len() >= 12).await;
    assert_contiguous(&engine, 5);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leaving_stream_stops_device_and_rearms_on_return() {
    let device = MockDevice::new();
    let mut engine = spawn_engine(&device, test_config());

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| !engine.series().is_empty()).await;
    assert_eq!(device.count(Command::StartStream), 1);

    engine.set_mode(Mode::OnDemand).await.unwrap();
    assert_eq!(device.count(Command::StopStream), 1);
    assert!(!device.is_streaming());

    let sample = engine.request_single_sample().await.unwrap();
    assert_eq!(engine.on_demand_snapshot(), vec![sample]);
    let commands = device.commands();
    let stop_at = commands.iter().rposition(|&c| c == Command::StopStream);
    let request_at = commands.iter().rposition(|&c| c == Command::SingleSampleRequest);
    assert!(stop_at.unwrap() < request_at.unwrap());

    // The device is quiet now, so its clock only moves once streaming resumes.
    let resumed_at = device.clock_ms();
    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| first_sample_since(&engine, resumed_at).is_some()).await;
    assert_eq!(device.count(Command::StartStream), 2);
    assert_eq!(device.count(Command::SetStreamDelay), 2);
    // Two warm-up records are discarded again after re-arming.
    assert_eq!(first_sample_since(&engine, resumed_at), Some(resumed_at + 2 * 5));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quick_toggle_still_rearms() {
    let device = MockDevice::new();
    let mut engine = spawn_engine(&device, test_config());

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| device.count(Command::StartStream) == 1).await;

    // Back and forth without giving the loop a cycle in between.
    engine.set_mode(Mode::OnDemand).await.unwrap();
    let resumed_at = device.clock_ms();
    engine.set_mode(Mode::Streaming).await.unwrap();
    assert_eq!(device.count(Command::StopStream), 1);

    wait_until(|| first_sample_since(&engine, resumed_at).is_some()).await;
    assert_eq!(device.count(Command::StartStream), 2);
    assert_eq!(device.count(Command::SetStreamDelay), 2);
    assert_eq!(first_sample_since(&engine, resumed_at), Some(resumed_at + 2 * 5));

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_mode_is_a_no_op() {
    let device = MockDevice::new();
    let mut engine = spawn_engine(&device, test_config());

    engine.set_mode(Mode::OnDemand).await.unwrap();
    assert_eq!(device.count(Command::StopStream), 0);

    engine.set_mode(Mode::Streaming).await.unwrap();
    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| engine.series().len() >= 4).await;
    assert_eq!(device.count(Command::StartStream), 1);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_while_streaming_stops_and_closes() {
    let device = MockDevice::new();
    let mut engine = spawn_engine(&device, test_config());

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| !engine.series().is_empty()).await;

    engine.shutdown().await.unwrap();

    assert_eq!(device.commands().last(), Some(&Command::StopStream));
    assert!(!engine.is_open().await);
    assert!(!device.is_open());
    assert_eq!(engine.status(), EngineStatus::Stopped(StopReason::Shutdown));

    assert!(matches!(
        engine.set_mode(Mode::Streaming).await,
        Err(DaqError::LinkClosed(_))
    ));
    // Second shutdown has nothing left to report.
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_ends_loop_and_is_reported_once() {
    let device = MockDevice::new();
    let mut engine = spawn_engine(&device, test_config());

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| !engine.series().is_empty()).await;
    let collected = engine.series().len();

    device.disconnect();
    let reason = tokio::time::timeout(Duration::from_secs(2), engine.wait_stopped())
        .await
        .unwrap();
    assert!(matches!(reason, StopReason::LinkClosed(_)));
    assert!(!engine.is_open().await);
    assert!(engine.series().len() >= collected);

    assert!(matches!(
        engine.shutdown().await,
        Err(DaqError::LinkClosed(_))
    ));
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_device_times_out_single_sample() {
    let device = MockDevice::new().silent();
    let mut engine = spawn_engine(&device, test_config());

    let err = engine.request_single_sample().await.unwrap_err();
    assert!(matches!(err, DaqError::Timeout(_)));
    assert!(engine.on_demand_snapshot().is_empty());
    // A timed-out request does not end the engine.
    assert_eq!(engine.status(), EngineStatus::Running);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_sample_while_streaming_uses_latest() {
    let device = MockDevice::new();
    let mut engine = spawn_engine(&device, test_config());

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| engine.series().len() >= 3).await;
    let requests_before = device.count(Command::SingleSampleRequest);

    let sample = engine.request_single_sample().await.unwrap();
    assert!(engine.snapshot().contains(&sample));
    assert_eq!(device.count(Command::SingleSampleRequest), requests_before);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_clears_series_and_rewinds_cursor() {
    let device = MockDevice::new();
    let mut engine = spawn_engine(&device, test_config());

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| engine.series().len() >= 4).await;
    engine.set_mode(Mode::OnDemand).await.unwrap();

    let mut cursor = engine.cursor();
    engine.reset();
    assert!(engine.snapshot().is_empty());

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| !engine.series().is_empty()).await;
    let batch = cursor.next_batch(engine.series());
    assert!(!batch.is_empty());
    assert!(cursor.consumed() <= engine.series().len());

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_performs_handshake_once() {
    let device = MockDevice::new();
    let link = Link::from_channel(Box::new(device.clone()));
    let mut engine = Engine::start(link, test_config()).await.unwrap();

    assert_eq!(device.reopens(), 1);
    assert_eq!(device.count(Command::Handshake), 2);

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| !engine.series().is_empty()).await;
    assert_eq!(device.count(Command::Handshake), 2);

    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_fails_on_silent_device() {
    let device = MockDevice::new().silent();
    let link = Link::from_channel(Box::new(device.clone()));
    let err = Engine::start(link, test_config()).await.err().unwrap();
    assert!(matches!(err, DaqError::Handshake(_)));
}

#[tokio::test]
async fn connect_requires_a_port() {
    let err = Engine::connect(DaqConfig::default()).await.err().unwrap();
    assert!(matches!(err, DaqError::Config(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_opcode_table_is_used_end_to_end() {
    let opcodes = spectro_daq::OpcodeTable {
        stop_stream: 0x20,
        start_stream: 0x21,
        set_stream_delay: 0x22,
        ..Default::default()
    };
    let device = MockDevice::new().with_opcodes(opcodes);
    let config = DaqConfig {
        opcodes,
        ..test_config()
    };
    let mut engine = spawn_engine(&device, config);

    engine.set_mode(Mode::Streaming).await.unwrap();
    wait_until(|| engine.series().len() >= 4).await;
    assert!(device.written().contains(&0x21));
    assert_eq!(device.stream_delay_ms(), Some(5));

    engine.shutdown().await.unwrap();
    assert_eq!(device.commands().last(), Some(&Command::StopStream));
}
