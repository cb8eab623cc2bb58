//! Synchronous handle for hosts without an async runtime.
//!
//! [`BlockingEngine`] owns a tokio runtime next to the [`Engine`] it drives
//! and blocks the calling thread on every operation. Dropping it performs
//! the same shutdown as [`BlockingEngine::shutdown`], so the device is told
//! to stop streaming and the port is released even if the host forgets.

use log::warn;
use tokio::runtime::Runtime;

use crate::config::DaqConfig;
use crate::engine::{Engine, EngineStatus, Mode};
use crate::errors::Result;
use crate::link::Link;
use crate::series::Sample;

pub struct BlockingEngine {
    // Declared first so it drops before the runtime it needs.
    engine: Engine,
    runtime: Runtime,
}

impl BlockingEngine {
    /// Open the configured port, handshake, and start the loop.
    pub fn connect(config: DaqConfig) -> Result<Self> {
        let runtime = Runtime::new()?;
        let engine = runtime.block_on(Engine::connect(config))?;
        Ok(Self { engine, runtime })
    }

    /// Handshake on an already-open link, then start the loop.
    pub fn start(link: Link, config: DaqConfig) -> Result<Self> {
        let runtime = Runtime::new()?;
        let engine = runtime.block_on(Engine::start(link, config))?;
        Ok(Self { engine, runtime })
    }

    /// The async handle, for the non-blocking accessors
    /// (`series`, `snapshot`, `status`, ...).
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn mode(&self) -> Mode {
        self.engine.mode()
    }

    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        self.runtime.block_on(self.engine.set_mode(mode))
    }

    pub fn request_single_sample(&self) -> Result<Sample> {
        self.runtime.block_on(self.engine.request_single_sample())
    }

    pub fn is_open(&self) -> bool {
        self.runtime.block_on(self.engine.is_open())
    }

    pub fn status(&self) -> EngineStatus {
        self.engine.status()
    }

    /// Stop the loop and wait for its cleanup. Later calls return `Ok(())`.
    pub fn shutdown(&mut self) -> Result<()> {
        self.runtime.block_on(self.engine.shutdown())
    }
}

impl Drop for BlockingEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("engine dropped after failure: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::link::Channel;
    use crate::mock::MockDevice;
    use crate::protocol::Command;

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

    fn start(device: &MockDevice) -> BlockingEngine {
        BlockingEngine::start(Link::from_channel(Box::new(device.clone())), test_config())
            .unwrap()
    }

    fn wait_for_samples(engine: &BlockingEngine) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.engine().series().is_empty() {
            assert!(Instant::now() < deadline, "no samples streamed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn dropping_while_streaming_stops_device_and_closes_port() {
        let device = MockDevice::new();
        let engine = start(&device);
        engine.set_mode(Mode::Streaming).unwrap();
        wait_for_samples(&engine);

        drop(engine);

        assert_eq!(device.commands().last(), Some(&Command::StopStream));
        assert!(!device.is_streaming());
        assert!(!device.is_open());
    }

    #[test]
    fn drop_after_explicit_shutdown_sends_nothing_more() {
        let device = MockDevice::new();
        let mut engine = start(&device);
        engine.set_mode(Mode::Streaming).unwrap();
        wait_for_samples(&engine);

        engine.shutdown().unwrap();
        let written = device.written().len();
        assert!(!engine.is_open());
        drop(engine);
        assert_eq!(device.written().len(), written);
    }

    #[test]
    fn single_sample_on_demand() {
        let device = MockDevice::new();
        let engine = start(&device);
        let sample = engine.request_single_sample().unwrap();
        assert_eq!(sample.timestamp_ms, 0);
        assert_eq!(engine.mode(), Mode::OnDemand);
        assert_eq!(engine.status(), EngineStatus::Running);
    }
}
