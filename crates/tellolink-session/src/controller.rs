//! `SessionController`: owns the command channel and the relay for one
//! device and walks them through the session lifecycle.
//!
//! ```text
//! Idle ─start()─► Handshaking ─"command", 500ms, "streamon", 500ms, launch─► Streaming
//!  ▲                  │ bind/send/launch error                                   │ relay Failed
//!  │                  ▼                                                          ▼
//!  └──── stop() ◄── Error ◄─────────────────────────────────────────────────────┘
//! ```
//!
//! The controller runs as a single tokio task. `start()` / `stop()` arrive as
//! requests; channel events and relay completions arrive as events tagged
//! with the [`SessionId`] that produced them. Everything is processed in
//! order on that one task, so the only races left are ordering races, and
//! those are settled by comparing session ids.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tellolink_core::{
    Endpoint, LinkConfig, LinkError, RelayError, RelayOutcome, SessionId, SessionState, TransportError,
};
use tellolink_relay::{InvocationSpec, RelayHandle, RelayRunner};
use tellolink_transport::{ChannelEvent, CommandChannel, CommandTransport, HANDSHAKE};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::state::{SessionStatus, StatusCell};

// ── Constants ─────────────────────────────────────────────────────────────────

/// How long teardown waits for a cancelled relay to exit. The HTTP output
/// port stays busy until it does.
pub const RELAY_EXIT_GRACE: Duration = Duration::from_secs(3);

const EVENT_CAPACITY: usize = 64;

/// Address the relay listens on for the device's video.
const VIDEO_BIND_HOST: &str = "0.0.0.0";

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Request {
    Start,
    Stop,
    /// Acknowledged once every earlier request has been fully processed.
    Settled(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
enum Event {
    Channel { session: SessionId, event: ChannelEvent },
    RelayFinished { session: SessionId, outcome: RelayOutcome },
}

/// Why an in-flight start sequence ended early.
#[derive(Debug)]
enum Abort {
    Stopped,
    Failed(LinkError),
}

impl From<LinkError> for Abort {
    fn from(err: LinkError) -> Self {
        Self::Failed(err)
    }
}

impl From<TransportError> for Abort {
    fn from(err: TransportError) -> Self {
        Self::Failed(err.into())
    }
}

impl From<RelayError> for Abort {
    fn from(err: RelayError) -> Self {
        Self::Failed(err.into())
    }
}

// ── SessionHandle ─────────────────────────────────────────────────────────────

/// Cheap, cloneable front end to a running [`SessionController`].
///
/// `start()` and `stop()` never block and never fail; the outcome is observed
/// through [`status`](Self::status) / [`subscribe`](Self::subscribe).
///
/// The request queue is unbounded so a `stop()` is never lost behind a busy
/// controller. Repeated `start()` calls collapse into one queued request
/// until the controller picks it up or a `stop()` follows.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::UnboundedSender<Request>,
    start_queued: Arc<AtomicBool>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn start(&self) {
        if self.start_queued.swap(true, Ordering::AcqRel) {
            debug!("start() coalesced with a pending start");
            return;
        }
        self.request(Request::Start);
    }

    pub fn stop(&self) {
        self.start_queued.store(false, Ordering::Release);
        self.request(Request::Stop);
    }

    fn request(&self, request: Request) {
        if let Err(e) = self.requests.send(request) {
            warn!("Session controller gone, {:?} dropped", e.0);
        }
    }

    /// Resolves once every request issued before this call has been handled,
    /// including a start sequence still in flight.
    pub async fn settled(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Settled(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Tear everything down and end the controller task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Read-only view of the status, notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait for a status satisfying `predicate`. Returns the last known status
    /// if the controller is gone.
    pub async fn wait_until(&self, mut predicate: impl FnMut(&SessionStatus) -> bool) -> SessionStatus {
        let mut rx = self.status.clone();
        if let Ok(status) = rx.wait_for(|s| predicate(s)).await {
            return status.clone();
        }
        let last = rx.borrow().clone();
        last
    }
}

// ── SessionController ─────────────────────────────────────────────────────────

struct ActiveChannel {
    session: SessionId,
    channel: Box<dyn CommandChannel>,
    forwarder: JoinHandle<()>,
}

struct ActiveRelay {
    session: SessionId,
    handle: RelayHandle,
}

pub struct SessionController {
    config: LinkConfig,
    transport: Arc<dyn CommandTransport>,
    runner: Arc<dyn RelayRunner>,
    status: StatusCell,

    requests: mpsc::UnboundedReceiver<Request>,
    start_queued: Arc<AtomicBool>,
    events: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,

    channel: Option<ActiveChannel>,
    relay: Option<ActiveRelay>,
    last_session: SessionId,

    /// `settled()` acks that arrived while a start sequence was in flight.
    deferred: Vec<oneshot::Sender<()>>,
    shutdown: Option<oneshot::Sender<()>>,
    closed: bool,
}

impl SessionController {
    /// Spawn the controller task. The task ends on [`SessionHandle::shutdown`]
    /// or once every handle is dropped, tearing the session down either way.
    pub fn spawn(
        config: LinkConfig,
        transport: Arc<dyn CommandTransport>,
        runner: Arc<dyn RelayRunner>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::channel(EVENT_CAPACITY);
        let start_queued = Arc::new(AtomicBool::new(false));
        let status = StatusCell::new(config.relay.playback_url());
        let handle = SessionHandle {
            requests: request_tx,
            start_queued: Arc::clone(&start_queued),
            status: status.subscribe(),
        };

        let controller = Self {
            config,
            transport,
            runner,
            status,
            requests,
            start_queued,
            events,
            event_tx,
            channel: None,
            relay: None,
            last_session: SessionId(0),
            deferred: Vec::new(),
            shutdown: None,
            closed: false,
        };
        (handle, tokio::spawn(controller.run()))
    }

    async fn run(mut self) {
        info!("Session controller ready (device {})", self.config.device.command_endpoint);
        while !self.closed && self.shutdown.is_none() {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Start) => {
                        self.start_queued.store(false, Ordering::Release);
                        self.start().await
                    }
                    Some(Request::Stop) => self.stop().await,
                    Some(Request::Settled(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(Request::Shutdown(ack)) => self.shutdown = Some(ack),
                    None => self.closed = true,
                },
                Some(event) = self.events.recv() => {
                    if let Some(abort) = self.on_event(event) {
                        self.abort(abort).await;
                    }
                }
            }
        }

        self.stop().await;
        if let Some(ack) = self.shutdown.take() {
            let _ = ack.send(());
        }
        info!("Session controller exited");
    }

    // ── start ─────────────────────────────────────────────────────────────

    async fn start(&mut self) {
        if self.status.state().is_active() || self.channel.is_some() || self.relay.is_some() {
            debug!("start() ignored: session {:?} already {}", self.status.snapshot().session, self.status.state());
            return;
        }

        let session = self.last_session.next();
        self.last_session = session;
        info!("Session {} starting", session);
        self.status.handshaking(session);

        match self.run_sequence(session).await {
            Ok(()) => info!("Session {} streaming", session),
            Err(abort) => self.abort(abort).await,
        }

        for ack in self.deferred.drain(..) {
            let _ = ack.send(());
        }
    }

    /// bind → handshake → launch, strictly in order. Stop requests and
    /// channel faults are honoured between steps.
    async fn run_sequence(&mut self, session: SessionId) -> Result<(), Abort> {
        let device = self.config.device.clone();
        let remote = device.command_endpoint.socket_addr()?;
        let settle = self.config.handshake.settle_delay();

        // ── 1. Bind ───────────────────────────────────────────────────────
        let (channel, events) = self.transport.open(device.local_command_port).await?;
        let forwarder = tokio::spawn(forward_channel_events(session, events, self.event_tx.clone()));
        self.channel = Some(ActiveChannel {
            session,
            channel,
            forwarder,
        });
        self.checkpoint()?;

        // ── 2. Handshake ──────────────────────────────────────────────────
        for command in HANDSHAKE {
            let active = self.channel.as_ref().ok_or(TransportError::ChannelClosed)?;
            info!("Session {} → {} '{}'", session, remote, command);
            active.channel.send(command, remote).await?;
            self.checkpoint()?;
            self.settle(settle).await?;
        }

        // ── 3. Relay ──────────────────────────────────────────────────────
        let spec = InvocationSpec::build(
            &Endpoint::new(VIDEO_BIND_HOST, device.video_port),
            &Endpoint::new(self.config.relay.output_host.clone(), self.config.relay.output_port),
            &self.config.relay,
        );
        let mut handle = self.runner.launch(&spec)?;
        if let Some(completion) = handle.take_completion() {
            tokio::spawn(forward_completion(session, completion, self.event_tx.clone()));
        }
        self.relay = Some(ActiveRelay { session, handle });
        self.status.streaming();
        Ok(())
    }

    /// Drain whatever is queued without waiting.
    fn checkpoint(&mut self) -> Result<(), Abort> {
        loop {
            match self.requests.try_recv() {
                Ok(request) => self.absorb(request)?,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.closed = true;
                    return Err(Abort::Stopped);
                }
            }
        }
        while let Ok(event) = self.events.try_recv() {
            if let Some(abort) = self.on_event(event) {
                return Err(abort);
            }
        }
        Ok(())
    }

    /// Sleep for the settling delay, cut short by a stop request or a fault.
    async fn settle(&mut self, delay: Duration) -> Result<(), Abort> {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                request = self.requests.recv() => match request {
                    Some(request) => self.absorb(request)?,
                    None => {
                        self.closed = true;
                        return Err(Abort::Stopped);
                    }
                },
                Some(event) = self.events.recv() => {
                    if let Some(abort) = self.on_event(event) {
                        return Err(abort);
                    }
                }
            }
        }
    }

    /// Handle a request that arrived mid-sequence.
    fn absorb(&mut self, request: Request) -> Result<(), Abort> {
        match request {
            Request::Start => {
                self.start_queued.store(false, Ordering::Release);
                debug!("start() ignored: handshake in progress");
                Ok(())
            }
            Request::Stop => {
                info!("Stop requested mid-handshake");
                Err(Abort::Stopped)
            }
            Request::Settled(ack) => {
                self.deferred.push(ack);
                Ok(())
            }
            Request::Shutdown(ack) => {
                self.shutdown = Some(ack);
                Err(Abort::Stopped)
            }
        }
    }

    // ── events ────────────────────────────────────────────────────────────

    fn on_event(&mut self, event: Event) -> Option<Abort> {
        match event {
            Event::Channel { session, event } => {
                if self.channel.as_ref().map(|c| c.session) != Some(session) {
                    debug!("Dropping event from superseded channel {}: {:?}", session, event);
                    return None;
                }
                let text = event.reply_text();
                match event {
                    ChannelEvent::Reply { from, .. } => {
                        let text = text.unwrap_or_default();
                        info!("Device {} replied: {}", from, text);
                        self.status.record_reply(text);
                        None
                    }
                    ChannelEvent::Fault { reason } => {
                        warn!("Session {} command channel fault: {}", session, reason);
                        Some(Abort::Failed(TransportError::SocketFault { reason }.into()))
                    }
                }
            }
            Event::RelayFinished { session, outcome } => {
                if self.relay.as_ref().map(|r| r.session) != Some(session) {
                    debug!("Ignoring completion of superseded relay {}: {:?}", session, outcome);
                    return None;
                }
                // Finished: nothing left to cancel.
                self.relay = None;
                match outcome {
                    RelayOutcome::Cancelled => {
                        info!("Relay {} cancelled", session);
                        None
                    }
                    RelayOutcome::Success => {
                        info!("Relay {} finished; ending session", session);
                        Some(Abort::Stopped)
                    }
                    RelayOutcome::Failed { exit_code, log } => {
                        Some(Abort::Failed(LinkError::RelayFailure { exit_code, log }))
                    }
                }
            }
        }
    }

    // ── stop / teardown ───────────────────────────────────────────────────

    async fn abort(&mut self, abort: Abort) {
        match abort {
            Abort::Stopped => self.stop().await,
            Abort::Failed(err) => self.fail(err).await,
        }
    }

    async fn fail(&mut self, err: LinkError) {
        warn!("Session {} failed: {}", self.last_session, err);
        self.teardown().await;
        self.status.error(err.to_string());
    }

    async fn stop(&mut self) {
        if self.status.state() != SessionState::Idle {
            info!("Session {} stopping", self.last_session);
        }
        self.teardown().await;
        self.status.idle();
    }

    /// Release the relay and the channel. Best-effort and idempotent: errors
    /// are logged, never returned.
    async fn teardown(&mut self) {
        if let Some(mut relay) = self.relay.take() {
            match relay.handle.cancel() {
                Ok(()) => debug!("Relay {} cancel requested", relay.session),
                Err(RelayError::NotRunning) => debug!("Relay {} already finished", relay.session),
                Err(e) => warn!("Relay {} cancel failed: {}", relay.session, e),
            }
            if !relay.handle.wait_exited(RELAY_EXIT_GRACE).await {
                warn!("Relay {} still running {:?} after cancel", relay.session, RELAY_EXIT_GRACE);
            }
        }

        if let Some(mut active) = self.channel.take() {
            active.channel.close();
            active.forwarder.abort();
            debug!("Channel for session {} closed", active.session);
        }
    }
}

// ── Forwarders ────────────────────────────────────────────────────────────────

async fn forward_channel_events(
    session: SessionId,
    mut events: mpsc::Receiver<ChannelEvent>,
    tx: mpsc::Sender<Event>,
) {
    while let Some(event) = events.recv().await {
        if tx.send(Event::Channel { session, event }).await.is_err() {
            return;
        }
    }
}

async fn forward_completion(
    session: SessionId,
    completion: oneshot::Receiver<RelayOutcome>,
    tx: mpsc::Sender<Event>,
) {
    let outcome = completion.await.unwrap_or_else(|_| RelayOutcome::Failed {
        exit_code: None,
        log: "relay supervisor ended without reporting an outcome".to_owned(),
    });
    let _ = tx.send(Event::RelayFinished { session, outcome }).await;
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tellolink_relay::{relay_link, RelayLink};

    use super::*;

    // ── Fake transport ────────────────────────────────────────────────────

    #[derive(Default)]
    struct Wire {
        opens: usize,
        closes: usize,
        fail_bind: bool,
        fail_send_at: Option<usize>,
        sent: Vec<(String, Instant)>,
        channels: Vec<mpsc::Sender<ChannelEvent>>,
    }

    #[derive(Clone, Default)]
    struct FakeTransport(Arc<Mutex<Wire>>);

    impl FakeTransport {
        fn wire(&self) -> std::sync::MutexGuard<'_, Wire> {
            self.0.lock().unwrap()
        }

        fn sent(&self) -> Vec<String> {
            self.wire().sent.iter().map(|(c, _)| c.clone()).collect()
        }

        fn open_channels(&self) -> usize {
            let wire = self.wire();
            wire.opens - wire.closes
        }

        async fn inject(&self, channel: usize, event: ChannelEvent) {
            let tx = self.wire().channels[channel].clone();
            tx.send(event).await.unwrap();
        }
    }

    #[async_trait]
    impl CommandTransport for FakeTransport {
        async fn open(
            &self,
            local_port: u16,
        ) -> Result<(Box<dyn CommandChannel>, mpsc::Receiver<ChannelEvent>), TransportError> {
            let mut wire = self.wire();
            if wire.fail_bind {
                return Err(TransportError::Bind {
                    port: local_port,
                    source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
                });
            }
            wire.opens += 1;
            let (tx, rx) = mpsc::channel(8);
            wire.channels.push(tx);
            let channel = FakeChannel {
                wire: Arc::clone(&self.0),
                closed: false,
            };
            Ok((Box::new(channel), rx))
        }
    }

    struct FakeChannel {
        wire: Arc<Mutex<Wire>>,
        closed: bool,
    }

    #[async_trait]
    impl CommandChannel for FakeChannel {
        async fn send(&self, command: &str, _remote: SocketAddr) -> Result<(), TransportError> {
            if self.closed {
                return Err(TransportError::ChannelClosed);
            }
            let mut wire = self.wire.lock().unwrap();
            if wire.fail_send_at == Some(wire.sent.len()) {
                return Err(TransportError::SendFailed {
                    command: command.to_owned(),
                    reason: "network unreachable".to_owned(),
                });
            }
            wire.sent.push((command.to_owned(), Instant::now()));
            Ok(())
        }

        fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.wire.lock().unwrap().closes += 1;
            }
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    // ── Fake relay ────────────────────────────────────────────────────────

    #[derive(Default)]
    struct Relays {
        fail_launch: bool,
        /// Ignore cancellation, like a process that will not die.
        stubborn: bool,
        launched_at: Vec<Instant>,
        cancels: usize,
        live: usize,
        scripts: Vec<Option<oneshot::Sender<RelayOutcome>>>,
    }

    #[derive(Clone, Default)]
    struct FakeRelay(Arc<Mutex<Relays>>);

    impl FakeRelay {
        fn relays(&self) -> std::sync::MutexGuard<'_, Relays> {
            self.0.lock().unwrap()
        }

        fn launches(&self) -> usize {
            self.relays().launched_at.len()
        }

        /// Make relay `index` terminate on its own with `outcome`.
        fn finish(&self, index: usize, outcome: RelayOutcome) {
            let tx = self.relays().scripts[index].take().unwrap();
            let _ = tx.send(outcome);
        }
    }

    impl RelayRunner for FakeRelay {
        fn launch(&self, _spec: &InvocationSpec) -> Result<RelayHandle, RelayError> {
            let mut relays = self.relays();
            if relays.fail_launch {
                return Err(RelayError::LaunchFailed {
                    reason: "exec format error".to_owned(),
                });
            }
            let (script_tx, script_rx) = oneshot::channel();
            relays.scripts.push(Some(script_tx));
            relays.launched_at.push(Instant::now());
            relays.live += 1;

            let (handle, link) = relay_link(Some(1000 + relays.launched_at.len() as u32));
            tokio::spawn(run_fake(Arc::clone(&self.0), relays.stubborn, script_rx, link));
            Ok(handle)
        }
    }

    async fn run_fake(
        relays: Arc<Mutex<Relays>>,
        stubborn: bool,
        script: oneshot::Receiver<RelayOutcome>,
        mut link: RelayLink,
    ) {
        let outcome = tokio::select! {
            scripted = script => match scripted {
                Ok(outcome) => outcome,
                Err(_) => return,
            },
            _ = link.cancelled(), if !stubborn => {
                relays.lock().unwrap().cancels += 1;
                RelayOutcome::Cancelled
            }
        };
        relays.lock().unwrap().live -= 1;
        link.finish(outcome);
    }

    // ── Harness ───────────────────────────────────────────────────────────

    const PLAYBACK: &str = "http://127.0.0.1:11112";

    fn spawn_session() -> (SessionHandle, JoinHandle<()>, FakeTransport, FakeRelay) {
        let transport = FakeTransport::default();
        let relay = FakeRelay::default();
        let (handle, task) = SessionController::spawn(
            LinkConfig::default(),
            Arc::new(transport.clone()),
            Arc::new(relay.clone()),
        );
        (handle, task, transport, relay)
    }

    async fn start(handle: &SessionHandle) -> SessionStatus {
        handle.start();
        handle.settled().await;
        handle.status()
    }

    async fn stop(handle: &SessionHandle) -> SessionStatus {
        handle.stop();
        handle.settled().await;
        handle.status()
    }

    /// Let forwarder tasks deliver whatever is in flight.
    async fn drain(handle: &SessionHandle) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.settled().await;
    }

    fn failed(log: &str) -> RelayOutcome {
        RelayOutcome::Failed {
            exit_code: Some(1),
            log: log.to_owned(),
        }
    }

    // ── Start ─────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn start_reaches_streaming_with_playback_url() {
        let (handle, _task, transport, relay) = spawn_session();
        assert_eq!(handle.status().state, SessionState::Idle);

        let status = start(&handle).await;
        assert_eq!(status.state, SessionState::Streaming);
        assert_eq!(status.playback_url.as_deref(), Some(PLAYBACK));
        assert_eq!(status.session, Some(SessionId(1)));
        assert_eq!(status.error, None);
        assert_eq!(transport.sent(), ["command", "streamon"]);
        assert_eq!(transport.open_channels(), 1);
        assert_eq!(relay.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_commands_are_spaced_by_the_settle_delay() {
        let (handle, _task, transport, relay) = spawn_session();
        start(&handle).await;

        let sent: Vec<Instant> = transport.wire().sent.iter().map(|(_, at)| *at).collect();
        let launched = relay.relays().launched_at[0];
        assert!(sent[1] - sent[0] >= Duration::from_millis(500));
        assert!(launched - sent[1] >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn bind_failure_is_an_error() {
        let (handle, _task, transport, relay) = spawn_session();
        transport.wire().fail_bind = true;

        let status = start(&handle).await;
        assert_eq!(status.state, SessionState::Error);
        assert!(status.error.unwrap().contains("8889"));
        assert_eq!(status.playback_url, None);
        assert_eq!(relay.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_closes_the_channel_and_skips_the_relay() {
        let (handle, _task, transport, relay) = spawn_session();
        transport.wire().fail_send_at = Some(0);

        let status = start(&handle).await;
        assert_eq!(status.state, SessionState::Error);
        assert!(status.error.unwrap().contains("command"));
        assert!(transport.sent().is_empty());
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(relay.launches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_is_an_error() {
        let (handle, _task, transport, relay) = spawn_session();
        relay.relays().fail_launch = true;

        let status = start(&handle).await;
        assert_eq!(status.state, SessionState::Error);
        assert!(status.error.unwrap().contains("exec format error"));
        assert_eq!(transport.sent(), ["command", "streamon"]);
        assert_eq!(transport.open_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_active_is_ignored() {
        let (handle, _task, transport, relay) = spawn_session();

        // Second start collapses into the first; the third lands mid-handshake.
        handle.start();
        handle.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.start();
        handle.settled().await;
        assert_eq!(transport.wire().opens, 1);

        let status = start(&handle).await;
        assert_eq!(status.state, SessionState::Streaming);
        assert_eq!(status.session, Some(SessionId(1)));
        assert_eq!(transport.wire().opens, 1);
        assert_eq!(relay.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_error_recovers() {
        let (handle, _task, transport, _relay) = spawn_session();
        transport.wire().fail_send_at = Some(0);
        assert_eq!(start(&handle).await.state, SessionState::Error);

        transport.wire().fail_send_at = None;
        let status = start(&handle).await;
        assert_eq!(status.state, SessionState::Streaming);
        assert_eq!(status.session, Some(SessionId(2)));
        assert_eq!(status.error, None);
        assert_eq!(transport.open_channels(), 1);
    }

    // ── Stop ──────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn stop_while_idle_changes_nothing() {
        let (handle, _task, transport, _relay) = spawn_session();
        let mut rx = handle.subscribe();
        rx.borrow_and_update();

        let status = stop(&handle).await;
        assert_eq!(status.state, SessionState::Idle);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(transport.wire().opens, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_streaming_cancels_the_relay() {
        let (handle, _task, transport, relay) = spawn_session();
        start(&handle).await;

        let status = stop(&handle).await;
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.playback_url, None);
        assert_eq!(status.session, None);
        assert_eq!(relay.relays().cancels, 1);
        assert_eq!(relay.relays().live, 0);
        assert_eq!(transport.open_channels(), 0);

        // The Cancelled completion arrives after teardown and changes nothing.
        let mut rx = handle.subscribe();
        rx.borrow_and_update();
        drain(&handle).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(handle.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_not_lost_behind_a_burst_of_starts() {
        let (handle, _task, transport, relay) = spawn_session();
        relay.relays().stubborn = true;
        start(&handle).await;

        // The controller sits in the exit grace wait while the burst queues up.
        handle.stop();
        for _ in 0..256 {
            handle.start();
        }
        handle.stop();
        handle.settled().await;

        let status = handle.status();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.session, None);
        assert_eq!(transport.open_channels(), 0);
        // The burst collapsed into a single restart, abandoned mid-handshake.
        assert_eq!(transport.wire().opens, 2);
        assert_eq!(relay.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_after_stop_is_not_coalesced_away() {
        let (handle, _task, _transport, _relay) = spawn_session();

        handle.start();
        handle.stop();
        handle.start();
        handle.settled().await;

        let status = handle.status();
        assert_eq!(status.state, SessionState::Streaming);
        assert_eq!(status.session, Some(SessionId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_handshake_abandons_the_sequence() {
        let (handle, _task, transport, relay) = spawn_session();
        handle.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = stop(&handle).await;
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(transport.sent(), ["command"]);
        assert_eq!(transport.open_channels(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(relay.launches(), 0);
        assert_eq!(handle.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_from_error_returns_to_idle() {
        let (handle, _task, transport, _relay) = spawn_session();
        transport.wire().fail_bind = true;
        start(&handle).await;

        let status = stop(&handle).await;
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.error, None);
    }

    // ── Relay completion ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn relay_failure_surfaces_its_log() {
        let (handle, _task, transport, relay) = spawn_session();
        start(&handle).await;

        relay.finish(0, failed("udp://0.0.0.0:11111: Connection timed out"));
        let status = handle.wait_until(|s| s.state == SessionState::Error).await;
        assert!(status.error.unwrap().contains("Connection timed out"));
        assert_eq!(status.playback_url, None);
        assert_eq!(transport.open_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_success_ends_the_session() {
        let (handle, _task, transport, relay) = spawn_session();
        start(&handle).await;

        relay.finish(0, RelayOutcome::Success);
        let status = handle.wait_until(|s| s.state == SessionState::Idle).await;
        assert_eq!(status.error, None);
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(relay.relays().cancels, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn relay_cancelled_elsewhere_only_clears_the_handle() {
        let (handle, _task, transport, relay) = spawn_session();
        start(&handle).await;

        relay.finish(0, RelayOutcome::Cancelled);
        drain(&handle).await;

        let status = handle.status();
        assert_eq!(status.state, SessionState::Streaming);
        assert_eq!(status.playback_url.as_deref(), Some(PLAYBACK));
        assert_eq!(transport.open_channels(), 1);
        assert_eq!(relay.relays().live, 0);

        // Nothing left to cancel; stop only closes the channel.
        assert_eq!(stop(&handle).await.state, SessionState::Idle);
        assert_eq!(relay.relays().cancels, 0);
        assert_eq!(transport.open_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_relay_completion_is_ignored() {
        let (handle, _task, _transport, relay) = spawn_session();
        relay.relays().stubborn = true;
        start(&handle).await;

        // Relay #1 ignores the cancel; teardown gives up after the grace period.
        let before = Instant::now();
        assert_eq!(stop(&handle).await.state, SessionState::Idle);
        assert!(Instant::now() - before >= RELAY_EXIT_GRACE);

        relay.relays().stubborn = false;
        assert_eq!(start(&handle).await.session, Some(SessionId(2)));

        relay.finish(0, failed("late failure from the first relay"));
        drain(&handle).await;

        let status = handle.status();
        assert_eq!(status.state, SessionState::Streaming);
        assert_eq!(status.session, Some(SessionId(2)));
        assert_eq!(status.error, None);
    }

    // ── Channel events ────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn device_replies_are_recorded() {
        let (handle, _task, transport, _relay) = spawn_session();
        start(&handle).await;

        let from: SocketAddr = "192.168.10.1:8889".parse().unwrap();
        transport
            .inject(0, ChannelEvent::Reply { payload: Bytes::from_static(b"ok\r\n"), from })
            .await;
        let status = handle.wait_until(|s| s.device_replies == 1).await;
        assert_eq!(status.last_reply.as_deref(), Some("ok"));
        assert_eq!(status.state, SessionState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn socket_fault_tears_the_session_down() {
        let (handle, _task, transport, relay) = spawn_session();
        start(&handle).await;

        transport
            .inject(0, ChannelEvent::Fault { reason: "connection refused".to_owned() })
            .await;
        let status = handle.wait_until(|s| s.state == SessionState::Error).await;
        assert!(status.error.unwrap().contains("connection refused"));
        assert_eq!(relay.relays().cancels, 1);
        assert_eq!(transport.open_channels(), 0);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn at_most_one_channel_and_relay_across_restarts() {
        let (handle, _task, transport, relay) = spawn_session();

        for round in 0..4 {
            let status = start(&handle).await;
            assert_eq!(status.is_streaming(), status.playback_url.is_some());
            assert!(transport.open_channels() <= 1);
            assert!(relay.relays().live <= 1);

            // Interleave an immediate restart with an orderly one.
            if round % 2 == 0 {
                handle.stop();
                handle.start();
                handle.settled().await;
            } else {
                stop(&handle).await;
            }
            let status = handle.status();
            assert_eq!(status.is_streaming(), status.playback_url.is_some());
            assert!(transport.open_channels() <= 1);
            assert!(relay.relays().live <= 1);
        }

        stop(&handle).await;
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(relay.relays().live, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_tears_down_and_ends_the_task() {
        let (handle, task, transport, relay) = spawn_session();
        start(&handle).await;

        handle.shutdown().await;
        task.await.unwrap();
        assert_eq!(handle.status().state, SessionState::Idle);
        assert_eq!(transport.open_channels(), 0);
        assert_eq!(relay.relays().live, 0);

        // Requests after shutdown are dropped quietly.
        handle.start();
        handle.settled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_ends_the_task() {
        let (handle, task, transport, _relay) = spawn_session();
        start(&handle).await;

        drop(handle);
        task.await.unwrap();
        assert_eq!(transport.open_channels(), 0);
    }
}
