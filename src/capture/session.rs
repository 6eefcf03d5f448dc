//! Capture session state machine
//!
//! A [`CaptureSession`] is owned by whoever drives the virtual interface. The
//! capture path calls [`CaptureSession::ingest`] for every datagram; control
//! calls (`start`, `stop`, `configure`) may come from any other thread. The
//! active backend lives behind a single mutex, so a packet is never processed
//! against a backend that is being set up or torn down.
//!
//! Observers and status queries go through a [`CaptureHandle`], which can only
//! read.

use rustls::ClientConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::flow::{self, FlowKey, SegmentState};
use super::notifier::{CaptureObserver, Notifier, ObserverId};
use super::stats::{CounterSet, StatsAggregator};
use crate::config::CaptureConfig;
use crate::dump::{open_backend, DumpBackend};
use crate::error::{BackendWriteError, CaptureError};
use crate::models::{
    CaptureCounters, CaptureEvent, CaptureState, Direction, DumpMode, PacketRecord, RawPacket,
    StopReason, VpnStats,
};
use crate::platform::VirtualInterface;
use crate::tls::{
    build_upstream_client_config, CertManager, CertificateForge, Interception, TlsDecryptor,
    TlsVerdict,
};

/// What the tunnel owner must do with an ingested datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestVerdict {
    /// Deliver the datagram as usual
    Forward,
    /// The TLS stage took the datagram over; do not deliver it
    Consumed,
}

#[derive(Debug)]
struct Status {
    state: CaptureState,
    configured_mode: DumpMode,
    /// Mode reported by the backend while running
    live_mode: Option<DumpMode>,
    session_id: Option<Uuid>,
    tls_enabled: bool,
}

#[derive(Debug)]
struct SharedState {
    status: RwLock<Status>,
    stats: StatsAggregator,
    counters: CounterSet,
}

impl SharedState {
    fn status(&self) -> std::sync::RwLockReadGuard<'_, Status> {
        self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn status_mut(&self) -> std::sync::RwLockWriteGuard<'_, Status> {
        self.status.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read-only view of a capture session
#[derive(Clone)]
pub struct CaptureHandle {
    shared: Arc<SharedState>,
    notifier: Notifier,
}

impl CaptureHandle {
    pub fn state(&self) -> CaptureState {
        self.shared.status().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == CaptureState::Running
    }

    pub fn stats(&self) -> VpnStats {
        self.shared.stats.snapshot()
    }

    pub fn counters(&self) -> CaptureCounters {
        self.shared.counters.snapshot()
    }

    /// Live backend configuration while running, the configured mode otherwise
    pub fn current_dump_mode(&self) -> DumpMode {
        let status = self.shared.status();
        match (&status.state, &status.live_mode) {
            (CaptureState::Running, Some(live)) => live.clone(),
            _ => status.configured_mode.clone(),
        }
    }

    /// Port the HTTP server backend is bound to, while it is active
    pub fn bound_port(&self) -> Option<u16> {
        if !self.is_active() {
            return None;
        }
        self.current_dump_mode().http_port()
    }

    /// Collector the UDP exporter sends to, while it is active
    pub fn collector_address(&self) -> Option<(String, u16)> {
        if !self.is_active() {
            return None;
        }
        self.current_dump_mode().collector()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.shared.status().session_id
    }

    /// Whether the running session decrypts TLS flows
    pub fn tls_decryption_active(&self) -> bool {
        let status = self.shared.status();
        status.state == CaptureState::Running && status.tls_enabled
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.notifier.subscribe()
    }

    pub fn register(&self, observer: Arc<dyn CaptureObserver>) -> ObserverId {
        self.notifier.register(observer)
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        self.notifier.unregister(id)
    }
}

/// Resources that only exist while running
struct ActiveCapture {
    backend: Box<dyn DumpBackend>,
    decryptor: Option<TlsDecryptor>,
    segments: HashMap<FlowKey, SegmentState>,
    flush_interval: Option<Duration>,
    last_flush: Instant,
    /// Set while writes keep failing, so only the first failure is logged
    failing: bool,
    ticker: JoinHandle<()>,
}

pub struct CaptureSession {
    shared: Arc<SharedState>,
    notifier: Notifier,
    interface: Arc<dyn VirtualInterface>,
    forge: Option<Arc<dyn CertificateForge>>,
    upstream_tls: Option<Arc<ClientConfig>>,
    config: Mutex<CaptureConfig>,
    active: Mutex<Option<ActiveCapture>>,
}

impl CaptureSession {
    pub fn new(interface: Arc<dyn VirtualInterface>) -> Self {
        let shared = SharedState {
            status: RwLock::new(Status {
                state: CaptureState::Ready,
                configured_mode: DumpMode::None,
                live_mode: None,
                session_id: None,
                tls_enabled: false,
            }),
            stats: StatsAggregator::new(),
            counters: CounterSet::default(),
        };
        Self {
            shared: Arc::new(shared),
            notifier: Notifier::new(),
            interface,
            forge: None,
            upstream_tls: None,
            config: Mutex::new(CaptureConfig::default()),
            active: Mutex::new(None),
        }
    }

    /// Forge certificates with `forge` instead of a CA built from the configuration
    pub fn with_certificate_forge(mut self, forge: Arc<dyn CertificateForge>) -> Self {
        self.forge = Some(forge);
        self
    }

    /// Trust store used when connecting to real servers of intercepted flows
    pub fn with_upstream_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.upstream_tls = Some(config);
        self
    }

    pub fn handle(&self) -> CaptureHandle {
        CaptureHandle {
            shared: self.shared.clone(),
            notifier: self.notifier.clone(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.shared.status().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == CaptureState::Running
    }

    pub fn stats(&self) -> VpnStats {
        self.shared.stats.snapshot()
    }

    pub fn current_dump_mode(&self) -> DumpMode {
        self.handle().current_dump_mode()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.notifier.subscribe()
    }

    /// Configuration of the running session, or the last one applied
    pub fn config(&self) -> CaptureConfig {
        lock(&self.config).clone()
    }

    /// Apply a configuration change made while idle
    ///
    /// Returns false (and changes nothing) unless the session is `Ready`.
    pub fn configure(&self, config: CaptureConfig) -> bool {
        let mode = config.dump_mode();
        {
            let mut status = self.shared.status_mut();
            if status.state != CaptureState::Ready {
                tracing::debug!("Ignoring configuration change while {:?}", status.state);
                return false;
            }
            status.configured_mode = mode.clone();
            status.tls_enabled = config.tls_decryption.enabled;
        }
        *lock(&self.config) = config;
        self.notifier.publish(CaptureEvent::DumpModeChanged(mode));
        true
    }

    /// Start capturing into the backend selected by `config`
    pub async fn start(&self, config: CaptureConfig) -> Result<(), CaptureError> {
        self.begin_start()?;
        if let Err(err) = config.validate() {
            self.abort_start();
            return Err(err.into());
        }
        let backend = match open_backend(&config).await {
            Ok(backend) => backend,
            Err(err) => {
                tracing::error!("Failed to start capture: {}", err);
                self.abort_start();
                return Err(err.into());
            }
        };
        self.finish_start(config, backend)
    }

    /// Start capturing into a backend built by the caller
    pub async fn start_with_backend(
        &self,
        config: CaptureConfig,
        backend: Box<dyn DumpBackend>,
    ) -> Result<(), CaptureError> {
        self.begin_start()?;
        if let Err(err) = config.validate() {
            self.abort_start();
            return Err(err.into());
        }
        self.finish_start(config, backend)
    }

    fn begin_start(&self) -> Result<(), CaptureError> {
        let mut status = self.shared.status_mut();
        if status.state != CaptureState::Ready {
            return Err(CaptureError::AlreadyRunning);
        }
        status.state = CaptureState::Starting;
        Ok(())
    }

    fn abort_start(&self) {
        self.shared.status_mut().state = CaptureState::Ready;
    }

    fn finish_start(
        &self,
        config: CaptureConfig,
        mut backend: Box<dyn DumpBackend>,
    ) -> Result<(), CaptureError> {
        let decryptor = if config.tls_decryption.enabled {
            match self.build_decryptor(&config) {
                Ok(decryptor) => Some(decryptor),
                Err(err) => {
                    if let Err(close_err) = backend.flush_and_close() {
                        tracing::warn!("Failed to close backend after TLS setup error: {}", close_err);
                    }
                    self.abort_start();
                    return Err(err);
                }
            }
        } else {
            None
        };

        let session_id = Uuid::new_v4();
        let live_mode = backend.mode();
        let flush_interval = match config.pcap_flush_interval() {
            d if d.is_zero() => None,
            d => Some(d),
        };

        // Hold the backend slot while flipping state so no ingest sees a half-started session
        let mut active = lock(&self.active);
        self.shared.stats.reset();
        self.shared.counters.reset_session();
        {
            let mut status = self.shared.status_mut();
            status.state = CaptureState::Running;
            status.configured_mode = config.dump_mode();
            status.live_mode = Some(live_mode.clone());
            status.session_id = Some(session_id);
            status.tls_enabled = decryptor.is_some();
        }
        let ticker = tokio::spawn(stats_ticker(
            self.shared.clone(),
            self.notifier.clone(),
            config.stats_interval(),
        ));
        *active = Some(ActiveCapture {
            backend,
            decryptor,
            segments: HashMap::new(),
            flush_interval,
            last_flush: Instant::now(),
            failing: false,
            ticker,
        });
        drop(active);
        *lock(&self.config) = config;

        tracing::info!("Capture {} started, dump mode {:?}", session_id, live_mode);
        self.notifier.publish(CaptureEvent::StateChanged {
            state: CaptureState::Running,
            session_id: Some(session_id),
            reason: None,
        });
        self.notifier
            .publish(CaptureEvent::Stats(self.shared.stats.snapshot()));
        Ok(())
    }

    fn build_decryptor(&self, config: &CaptureConfig) -> Result<TlsDecryptor, CaptureError> {
        let forge: Arc<dyn CertificateForge> = match &self.forge {
            Some(forge) => forge.clone(),
            None => Arc::new(
                CertManager::from_config(&config.tls_decryption)
                    .map_err(|e| CaptureError::TlsSetup(format!("{:#}", e)))?,
            ),
        };
        let upstream = self
            .upstream_tls
            .clone()
            .unwrap_or_else(|| Arc::new(build_upstream_client_config()));
        Ok(TlsDecryptor::new(
            forge,
            upstream,
            config.tls_decryption.intercept_ports.clone(),
        ))
    }

    /// Process one datagram observed on the virtual interface
    ///
    /// Never fails: while not running the datagram is only counted as dropped,
    /// and backend or TLS failures are counted and logged.
    pub fn ingest(&self, packet: RawPacket) -> IngestVerdict {
        let mut slot = lock(&self.active);
        let Some(active) = slot.as_mut() else {
            self.shared.counters.packet_dropped();
            return IngestVerdict::Forward;
        };

        let (record, verdict) = self.run_tls_stage(active, &packet);

        // Counted before dispatch: a counted packet has always been offered to the backend
        self.shared.stats.record(packet.direction, packet.len());

        let mut lost = None;
        match active.backend.write(&record) {
            Ok(()) => active.failing = false,
            Err(err) if err.is_unrecoverable() => lost = Some(err),
            Err(err) => self.note_write_failure(active, err),
        }

        if lost.is_none() {
            if let Some(interval) = active.flush_interval {
                if active.last_flush.elapsed() >= interval {
                    active.last_flush = Instant::now();
                    match active.backend.flush() {
                        Ok(()) => {}
                        Err(err) if err.is_unrecoverable() => lost = Some(err),
                        Err(err) => self.note_write_failure(active, err),
                    }
                }
            }
        }

        if let Some(err) = lost {
            tracing::error!("Capture storage lost, stopping: {}", err);
            if let Some(active) = slot.take() {
                self.teardown(active, StopReason::Forced(err.to_string()));
            }
        }
        verdict
    }

    fn note_write_failure(&self, active: &mut ActiveCapture, err: BackendWriteError) {
        let failures = self.shared.counters.write_failed();
        if !active.failing {
            tracing::warn!("Dump backend write failed ({} so far): {}", failures, err);
            active.failing = true;
        }
    }

    /// Run the TLS stage and build the record to capture
    fn run_tls_stage(
        &self,
        active: &mut ActiveCapture,
        packet: &RawPacket,
    ) -> (PacketRecord, IngestVerdict) {
        let passthrough = || (PacketRecord::from_raw(packet), IngestVerdict::Forward);
        let Some(decryptor) = active.decryptor.as_mut() else {
            return passthrough();
        };
        let Some(parsed) = flow::parse(&packet.data, packet.direction) else {
            return passthrough();
        };
        let Some(tcp) = parsed.tcp else {
            return passthrough();
        };
        if !decryptor.is_eligible(&parsed.flow) {
            return passthrough();
        }

        if tcp.closing() {
            decryptor.close_flow(&parsed.flow);
            active.segments.remove(&parsed.flow);
            return passthrough();
        }

        // Only bytes not yet relayed may reach the TLS sessions
        let fresh = match active.segments.get_mut(&parsed.flow) {
            None => parsed.payload,
            Some(segments) => match segments.admit(packet.direction, &tcp, parsed.payload) {
                Some(fresh) => fresh,
                None => {
                    self.emit_legs(
                        segments,
                        &parsed.flow,
                        packet.direction,
                        parsed.payload,
                        &Interception::default(),
                    );
                    return (PacketRecord::from_raw(packet), IngestVerdict::Consumed);
                }
            },
        };

        let interception = match decryptor.process(&parsed.flow, packet.direction, fresh) {
            Ok(TlsVerdict::Intercepted(interception)) => interception,
            Ok(TlsVerdict::NotTls) | Ok(TlsVerdict::PassThrough) => return passthrough(),
            Err(err) => {
                tracing::debug!("TLS stage failed for {}: {}", parsed.flow.server, err);
                self.shared.counters.tls_failed();
                active.segments.remove(&parsed.flow);
                return passthrough();
            }
        };

        let segments = active
            .segments
            .entry(parsed.flow)
            .or_insert_with(|| SegmentState::from_first_segment(&tcp, fresh.len()));
        self.emit_legs(segments, &parsed.flow, packet.direction, fresh, &interception);

        let record = if interception.plaintext.is_empty() {
            PacketRecord::from_raw(packet)
        } else {
            match segments.plaintext_datagram(&parsed.flow, packet.direction, &interception.plaintext) {
                Ok(datagram) => PacketRecord {
                    timestamp: packet.timestamp,
                    direction: packet.direction,
                    payload: datagram,
                    decrypted: true,
                },
                Err(err) => {
                    tracing::debug!("Failed to frame decrypted data: {}", err);
                    PacketRecord::from_raw(packet)
                }
            }
        };
        (record, IngestVerdict::Consumed)
    }

    /// Write the TLS stage output towards the device and the real server
    fn emit_legs(
        &self,
        segments: &mut SegmentState,
        flow: &FlowKey,
        direction: Direction,
        payload: &[u8],
        interception: &Interception,
    ) {
        let carried_data = !payload.is_empty();
        // Data with nothing to say back still needs an ACK towards its sender
        let to_client = !interception.to_client.is_empty()
            || (carried_data && direction == Direction::Sent);
        let to_server = !interception.to_server.is_empty()
            || (carried_data && direction == Direction::Received);

        if to_client {
            match segments.segments_to_client(flow, &interception.to_client) {
                Ok(datagrams) => {
                    for datagram in datagrams {
                        self.deliver(&datagram, Direction::Received);
                    }
                }
                Err(err) => {
                    tracing::debug!("Failed to build segments for the device: {}", err);
                    self.shared.counters.inject_failed();
                }
            }
        }
        if to_server {
            match segments.segments_to_server(flow, &interception.to_server) {
                Ok(datagrams) => {
                    for datagram in datagrams {
                        self.deliver(&datagram, Direction::Sent);
                    }
                }
                Err(err) => {
                    tracing::debug!("Failed to build segments for the server: {}", err);
                    self.shared.counters.inject_failed();
                }
            }
        }
    }

    fn deliver(&self, datagram: &[u8], direction: Direction) {
        let result = match direction {
            Direction::Received => self.interface.inject(datagram),
            Direction::Sent => self.interface.forward(datagram),
        };
        match result {
            Ok(()) => self.shared.counters.packet_injected(),
            Err(err) => {
                tracing::debug!("Virtual interface write failed: {}", err);
                self.shared.counters.inject_failed();
            }
        }
    }

    /// Write a locally produced datagram back to the device
    ///
    /// Serialized with `ingest`, so per-flow ordering holds with respect to
    /// captured traffic. Failures are counted and returned, never fatal.
    pub fn inject(&self, datagram: &[u8]) -> std::io::Result<()> {
        let _order = lock(&self.active);
        match self.interface.inject(datagram) {
            Ok(()) => {
                self.shared.counters.packet_injected();
                Ok(())
            }
            Err(err) => {
                self.shared.counters.inject_failed();
                Err(err)
            }
        }
    }

    /// Stop capturing and return the final statistics
    ///
    /// A no-op returning the current snapshot unless the session is running.
    pub fn stop(&self) -> VpnStats {
        let active = lock(&self.active).take();
        match active {
            Some(active) => self.teardown(active, StopReason::User),
            None => self.shared.stats.snapshot(),
        }
    }

    fn teardown(&self, mut active: ActiveCapture, reason: StopReason) -> VpnStats {
        self.shared.status_mut().state = CaptureState::Stopping;
        active.ticker.abort();
        if let Some(decryptor) = active.decryptor.as_mut() {
            decryptor.clear();
        }
        if let Err(err) = active.backend.flush_and_close() {
            tracing::warn!("Failed to close dump backend: {}", err);
            self.shared.counters.write_failed();
        }

        let final_stats = self.shared.stats.snapshot();
        let session_id = {
            let mut status = self.shared.status_mut();
            status.state = CaptureState::Ready;
            status.live_mode = None;
            status.session_id.take()
        };
        match &reason {
            StopReason::User => tracing::info!("Capture stopped: {:?}", final_stats),
            StopReason::Forced(why) => tracing::warn!("Capture force-stopped ({}): {:?}", why, final_stats),
        }
        self.notifier.publish(CaptureEvent::StateChanged {
            state: CaptureState::Ready,
            session_id,
            reason: Some(reason),
        });
        self.notifier.publish(CaptureEvent::Stats(final_stats));
        final_stats
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.active).take() {
            self.teardown(active, StopReason::User);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn stats_ticker(shared: Arc<SharedState>, notifier: Notifier, period: Duration) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately and start already published a snapshot
    tick.tick().await;
    loop {
        tick.tick().await;
        notifier.publish(CaptureEvent::Stats(shared.stats.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::NullBackend;
    use crate::platform::NoopInterface;

    fn session() -> CaptureSession {
        CaptureSession::new(Arc::new(NoopInterface::new()))
    }

    struct FailingBackend {
        writes: u64,
    }

    impl DumpBackend for FailingBackend {
        fn mode(&self) -> DumpMode {
            DumpMode::None
        }

        fn write(&mut self, _record: &PacketRecord) -> Result<(), BackendWriteError> {
            self.writes += 1;
            Err(BackendWriteError::IoFailure(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn flush_and_close(&mut self) -> Result<(), BackendWriteError> {
            Ok(())
        }
    }

    #[test]
    fn ingest_before_start_only_counts_a_drop() {
        let session = session();
        assert_eq!(session.ingest(RawPacket::sent(vec![0; 40])), IngestVerdict::Forward);
        assert_eq!(session.stats(), VpnStats::default());
        assert_eq!(session.handle().counters().dropped_packets, 1);
    }

    #[tokio::test]
    async fn write_failures_are_counted_and_capture_continues() {
        let session = session();
        session
            .start_with_backend(
                CaptureConfig::default(),
                Box::new(FailingBackend { writes: 0 }),
            )
            .await
            .unwrap();

        for _ in 0..3 {
            session.ingest(RawPacket::sent(vec![0; 50]));
        }
        session.ingest(RawPacket::received(vec![0; 70]));

        assert!(session.is_active());
        assert_eq!(session.handle().counters().write_failures, 4);
        let stats = session.stop();
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.bytes_received, 70);
        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.packets_received, 1);
    }

    #[tokio::test]
    async fn configure_is_refused_while_running() {
        let session = session();
        let mut rx = session.subscribe();
        let config = CaptureConfig {
            dump_mode: crate::models::DumpModeKind::HttpServer,
            http_server_port: 9000,
            ..CaptureConfig::default()
        };
        assert!(session.configure(config.clone()));
        assert_eq!(
            rx.recv().await.unwrap(),
            CaptureEvent::DumpModeChanged(DumpMode::HttpServer { port: 9000 })
        );
        assert_eq!(session.current_dump_mode(), DumpMode::HttpServer { port: 9000 });

        session
            .start_with_backend(CaptureConfig::default(), Box::new(NullBackend::new()))
            .await
            .unwrap();
        assert!(!session.configure(config));
        assert_eq!(session.current_dump_mode(), DumpMode::None);
        session.stop();
    }

    #[tokio::test]
    async fn invalid_config_leaves_the_session_ready() {
        let session = session();
        let config = CaptureConfig {
            snaplen: 0,
            ..CaptureConfig::default()
        };
        assert!(matches!(
            session.start(config).await,
            Err(CaptureError::InvalidConfig(_))
        ));
        assert_eq!(session.state(), CaptureState::Ready);
    }
}
