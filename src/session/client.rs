//! Impure I/O side of the session engine
//!
//! One worker task per engine owns every piece of mutable connection state:
//! the transport session, the pending-request table, the retry counter and
//! all timers. Handles hand commands to it over a channel and observe it
//! through watch channels, so nothing is shared behind a lock.

use super::connection::{ConnectionState, ConnectionTarget, EngineConfig, RetryState};
use super::correlator::{Completion, RequestCorrelator};
use super::health_monitor::{
    ConnectionEvent, HealthMetrics, HealthMonitor, KeepaliveSchedule, ReconnectionDecision,
    Suppression,
};
use super::message_handler::{EventDispatcher, FrameRoute};
use super::protocol::{BootstrapStep, SessionProtocol};
use crate::error::{AuthFailure, SessionError, SessionResult, TimeoutKind};
use crate::observability::{redact_secrets, MetricsCollector, MetricsSnapshot};
use crate::transport::{Connector, Frame, FrameSink, FrameStream, TransportSession};
use futures::StreamExt;
use serde_json::Value;
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Commands queued from handles before the worker applies back-pressure
const COMMAND_BUFFER: usize = 64;

/// Upper bound on a graceful close before the socket is simply dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type OpenResult = Result<SessionResult<TransportSession>, JoinError>;

enum Command {
    Connect {
        target: ConnectionTarget,
        done: oneshot::Sender<()>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Call {
        command: String,
        args: Value,
        reply: Completion,
    },
    Notify {
        command: String,
        args: Value,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    ReconnectIfNeeded {
        reply: oneshot::Sender<bool>,
    },
    Health {
        reply: oneshot::Sender<HealthMetrics>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Observable state published by the worker
struct Publishers<I> {
    state: watch::Sender<ConnectionState>,
    info: watch::Sender<Option<I>>,
    retry: watch::Sender<RetryState>,
    credential_required: watch::Sender<bool>,
    terminal: watch::Sender<Option<SessionError>>,
}

/// Entry point for starting engines
pub struct SessionEngine;

impl SessionEngine {
    /// Start a worker task for `protocol` and return its handle
    ///
    /// The engine starts Disconnected; nothing is dialed until `connect`.
    /// Must be called inside a tokio runtime.
    pub fn spawn<P, C>(
        protocol: P,
        connector: C,
        config: EngineConfig,
    ) -> SessionHandle<P::Event, P::Info>
    where
        P: SessionProtocol,
        C: Connector,
    {
        let channel = protocol.name();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let retry = RetryState::new(config.reconnect.max_attempts);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (info_tx, info_rx) = watch::channel(None);
        let (retry_tx, retry_rx) = watch::channel(retry);
        let (credential_tx, credential_rx) = watch::channel(false);
        let (terminal_tx, terminal_rx) = watch::channel(None);

        let dispatcher = EventDispatcher::new(config.event_buffer);
        let metrics = Arc::new(MetricsCollector::new(channel));

        let handle = SessionHandle {
            commands: command_tx,
            state_rx,
            info_rx,
            retry_rx,
            credential_rx,
            terminal_rx,
            events: dispatcher.sender(),
            metrics: Arc::clone(&metrics),
        };

        let worker = SessionWorker {
            channel,
            correlator: RequestCorrelator::new(config.request_timeout),
            keepalive: KeepaliveSchedule::new(config.keepalive_interval),
            protocol,
            connector: Arc::new(connector),
            config,
            publish: Publishers {
                state: state_tx,
                info: info_tx,
                retry: retry_tx,
                credential_required: credential_tx,
                terminal: terminal_tx,
            },
            dispatcher,
            metrics,
            state: ConnectionState::Disconnected,
            target: None,
            retry,
            suppression: None,
            sink: None,
            stream: None,
            opening: None,
            bootstrap_deadline: None,
            reconnect_at: None,
            connected_at: None,
            last_frame_at: None,
        };

        tokio::spawn(
            worker
                .run(command_rx)
                .instrument(crate::session_span!(channel = channel)),
        );

        handle
    }
}

/// Cloneable front end of one engine
///
/// Every mutating method hands off to the worker task; the read accessors
/// return the worker's most recently published values.
#[derive(Clone)]
pub struct SessionHandle<E, I> {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    info_rx: watch::Receiver<Option<I>>,
    retry_rx: watch::Receiver<RetryState>,
    credential_rx: watch::Receiver<bool>,
    terminal_rx: watch::Receiver<Option<SessionError>>,
    events: broadcast::Sender<E>,
    metrics: Arc<MetricsCollector>,
}

impl<E: Clone, I: Clone> SessionHandle<E, I> {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SessionResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SessionError::EngineStopped)?;
        rx.await.map_err(|_| SessionError::EngineStopped)
    }

    /// Manual connect; a no-op while a session is already active
    ///
    /// Replaces the target, resets the retry budget and cancels any
    /// scheduled reconnection. Returns once the attempt has started; use
    /// [`wait_connected`](Self::wait_connected) to await the outcome.
    pub async fn connect(&self, target: ConnectionTarget) -> SessionResult<()> {
        self.request(|done| Command::Connect { target, done }).await
    }

    /// Close the session and suppress automatic reconnection
    pub async fn disconnect(&self) -> SessionResult<()> {
        self.request(|done| Command::Disconnect { done }).await
    }

    /// Send a correlated request and wait for its reply
    pub async fn call(&self, command: &str, args: Value) -> SessionResult<Value> {
        let span = crate::request_span!(command = %command);
        self.request(|reply| Command::Call {
            command: command.to_string(),
            args,
            reply,
        })
        .instrument(span)
        .await?
    }

    /// Send without waiting for any reply
    pub async fn notify(&self, command: &str, args: Value) -> SessionResult<()> {
        self.request(|reply| Command::Notify {
            command: command.to_string(),
            args,
            reply,
        })
        .await?
    }

    /// Host lifecycle hook: redial now if the session dropped and may retry
    ///
    /// Returns whether an attempt was started.
    pub async fn reconnect_if_needed(&self) -> SessionResult<bool> {
        self.request(|reply| Command::ReconnectIfNeeded { reply })
            .await
    }

    pub async fn health(&self) -> SessionResult<HealthMetrics> {
        self.request(|reply| Command::Health { reply }).await
    }

    /// Disconnect and stop the worker; idempotent
    pub async fn shutdown(&self) -> SessionResult<()> {
        match self.request(|done| Command::Shutdown { done }).await {
            Err(SessionError::EngineStopped) => Ok(()),
            other => other,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn server_info(&self) -> Option<I> {
        self.info_rx.borrow().clone()
    }

    pub fn retry_state(&self) -> RetryState {
        *self.retry_rx.borrow()
    }

    pub fn requires_credential(&self) -> bool {
        *self.credential_rx.borrow()
    }

    /// Terminal failure that stopped automatic recovery, if any
    pub fn terminal_error(&self) -> Option<SessionError> {
        self.terminal_rx.borrow().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Wait until Connected, a terminal failure, or `timeout`
    pub async fn wait_connected(&self, timeout: Duration) -> SessionResult<()> {
        Self::wait_for_connection_confirmation(
            self.state_rx.clone(),
            self.terminal_rx.clone(),
            timeout,
        )
        .await
    }

    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        terminal_rx: watch::Receiver<Option<SessionError>>,
        timeout: Duration,
    ) -> SessionResult<()> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => return Err(SessionError::NotConnected),
                    ConnectionState::Error(_) => {
                        let terminal = terminal_rx.borrow().clone();
                        if let Some(error) = terminal {
                            return Err(error);
                        }
                    }
                    ConnectionState::Connecting | ConnectionState::Authenticating => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(SessionError::EngineStopped);
                }
            }
        })
        .await;

        outcome.unwrap_or(Err(SessionError::Timeout(TimeoutKind::Connect)))
    }
}

struct SessionWorker<P: SessionProtocol, C> {
    channel: &'static str,
    protocol: P,
    connector: Arc<C>,
    config: EngineConfig,
    publish: Publishers<P::Info>,
    dispatcher: EventDispatcher<P::Event>,
    metrics: Arc<MetricsCollector>,

    state: ConnectionState,
    target: Option<ConnectionTarget>,
    retry: RetryState,
    suppression: Option<Suppression>,
    correlator: RequestCorrelator,
    keepalive: KeepaliveSchedule,

    sink: Option<Box<dyn FrameSink>>,
    stream: Option<FrameStream>,
    opening: Option<JoinHandle<SessionResult<TransportSession>>>,

    bootstrap_deadline: Option<(Instant, TimeoutKind)>,
    reconnect_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
}

impl<P: SessionProtocol, C: Connector> SessionWorker<P, C> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("Session engine started");

        loop {
            let bootstrap_deadline = self.bootstrap_deadline.map(|(at, _)| at);
            let request_deadline = self.correlator.next_deadline();
            let keepalive_at = self.keepalive.next_probe();
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.close_session().await;
                        break;
                    }
                },
                opened = wait_for_open(&mut self.opening) => {
                    self.opening = None;
                    self.on_opened(opened).await;
                }
                frame = next_frame(&mut self.stream) => self.on_inbound(frame).await,
                _ = sleep_until_deadline(bootstrap_deadline) => self.on_bootstrap_timeout().await,
                _ = sleep_until_deadline(request_deadline) => self.expire_requests(),
                _ = sleep_until_deadline(keepalive_at) => self.send_keepalive().await,
                _ = sleep_until_deadline(reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_attempt().await;
                }
            }
        }

        info!("Session engine stopped");
    }

    /// Returns false when the worker should stop
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { target, done } => {
                self.connect(target).await;
                let _ = done.send(());
            }
            Command::Disconnect { done } => {
                self.disconnect().await;
                let _ = done.send(());
            }
            Command::Call {
                command,
                args,
                reply,
            } => self.call(command, args, reply).await,
            Command::Notify {
                command,
                args,
                reply,
            } => {
                let result = self.notify(&command, args).await;
                let _ = reply.send(result);
            }
            Command::ReconnectIfNeeded { reply } => {
                let started = self.reconnect_if_needed().await;
                let _ = reply.send(started);
            }
            Command::Health { reply } => {
                let _ = reply.send(HealthMonitor::calculate_health_metrics(
                    self.connected_at,
                    self.last_frame_at,
                    self.retry.attempt_count,
                    self.config.keepalive_interval,
                ));
            }
            Command::Shutdown { done } => {
                self.close_session().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    async fn connect(&mut self, target: ConnectionTarget) {
        if self.state.is_active() {
            debug!(state = %self.state, "Connect ignored, session already active");
            return;
        }

        info!(
            host = %target.host,
            port = target.port,
            scheme = target.scheme.as_str(),
            "Connecting"
        );
        self.target = Some(target);
        self.reconnect_at = None;
        self.suppression = None;
        self.retry.reset();
        self.publish.retry.send_replace(self.retry);
        self.publish.terminal.send_replace(None);
        self.publish.credential_required.send_replace(false);

        self.start_attempt().await;
    }

    async fn disconnect(&mut self) {
        info!(state = %self.state, "Disconnecting");
        self.reconnect_at = None;
        self.suppression = Some(Suppression::UserDisconnect);
        self.retry.exhaust();
        self.publish.retry.send_replace(self.retry);

        self.fail_pending(&SessionError::transport("disconnected by client"));
        self.teardown().await;
        self.metrics.connection_lost();
        self.transition(ConnectionEvent::UserDisconnected);
    }

    /// Final teardown before the worker exits
    async fn close_session(&mut self) {
        self.reconnect_at = None;
        self.suppression = Some(Suppression::UserDisconnect);
        self.fail_pending(&SessionError::EngineStopped);
        self.teardown().await;
        self.metrics.connection_lost();
        self.transition(ConnectionEvent::UserDisconnected);
    }

    async fn call(&mut self, command: String, args: Value, reply: Completion) {
        if !HealthMonitor::can_send(&self.state) {
            let _ = reply.send(Err(SessionError::NotConnected));
            return;
        }

        let message_id = self.correlator.allocate_id();
        let frame = match self.protocol.encode_request(&message_id, &command, args) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        self.correlator.register(message_id.clone(), &command, reply);
        debug!(message_id = %message_id, command = %command, "Sending request");
        self.metrics.request_sent();

        if let Err(e) = self.send_frame(frame).await {
            // Resolves the entry registered above along with the rest
            self.on_failure(e).await;
        }
    }

    async fn notify(&mut self, command: &str, args: Value) -> SessionResult<()> {
        if !HealthMonitor::can_send(&self.state) {
            return Err(SessionError::NotConnected);
        }

        let frame = self.protocol.encode_notification(command, args)?;
        match self.send_frame(frame).await {
            Ok(()) => {
                self.metrics.notification_sent();
                Ok(())
            }
            Err(e) => {
                self.on_failure(e.clone()).await;
                Err(e)
            }
        }
    }

    async fn reconnect_if_needed(&mut self) -> bool {
        let idle = matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Error(_)
        );
        if self.target.is_none() || self.suppression.is_some() || !idle {
            debug!(
                state = %self.state,
                suppression = ?self.suppression,
                "Reconnect check: nothing to do"
            );
            return false;
        }

        info!("Reconnect check: redialing now");
        self.reconnect_at = None;
        self.retry.reset();
        self.publish.retry.send_replace(self.retry);
        self.start_attempt().await;
        true
    }

    /// Tear down whatever exists and begin a fresh attempt against the target
    async fn start_attempt(&mut self) {
        let Some(target) = self.target.as_ref() else {
            return;
        };
        let endpoint = target.endpoint(self.protocol.endpoint_path());

        self.teardown().await;

        debug!(url = %endpoint.url, "Opening transport session");
        self.metrics.connection_attempt();
        self.transition(ConnectionEvent::AttemptStarted);
        // Covers the socket open as well as the hello
        self.bootstrap_deadline = Some((
            Instant::now() + self.config.hello_timeout,
            TimeoutKind::Hello,
        ));

        let connector = Arc::clone(&self.connector);
        self.opening = Some(tokio::spawn(
            async move { connector.open(&endpoint).await }.in_current_span(),
        ));
    }

    /// Drop the transport session and every per-connection timer
    async fn teardown(&mut self) {
        if let Some(opening) = self.opening.take() {
            opening.abort();
        }
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            if tokio::time::timeout(CLOSE_TIMEOUT, sink.close())
                .await
                .is_err()
            {
                debug!("Transport close timed out");
            }
        }
        self.keepalive.stop();
        self.bootstrap_deadline = None;
        self.connected_at = None;
        self.protocol.reset();
        self.publish.info.send_replace(None);
    }

    async fn on_opened(&mut self, opened: OpenResult) {
        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return self.on_failure(e).await,
            Err(e) => {
                return self
                    .on_failure(SessionError::transport(format!("open task failed: {e}")))
                    .await
            }
        };

        debug!("Transport session open");
        self.sink = Some(session.sink);
        self.stream = Some(session.stream);

        let frames = match &self.target {
            Some(target) => self.protocol.opening_frames(target),
            None => Ok(Vec::new()),
        };
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => return self.on_failure(e).await,
        };
        for frame in frames {
            if let Err(e) = self.send_frame(frame).await {
                return self.on_failure(e).await;
            }
        }
    }

    async fn on_inbound(&mut self, frame: Option<SessionResult<Frame>>) {
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return self.on_failure(e).await,
            None => {
                return self
                    .on_failure(SessionError::transport("connection closed by server"))
                    .await
            }
        };

        self.last_frame_at = Some(Instant::now());
        self.metrics.frame_received();
        if let Frame::Text(text) = &frame {
            trace!(frame = %redact_secrets(text), "Frame received");
        }

        match self.state {
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                self.on_bootstrap_frame(frame).await
            }
            ConnectionState::Connected => self.on_session_frame(frame).await,
            ConnectionState::Disconnected | ConnectionState::Error(_) => {
                self.metrics.frame_dropped();
            }
        }
    }

    async fn on_bootstrap_frame(&mut self, frame: Frame) {
        let step = match &self.target {
            Some(target) => self.protocol.on_bootstrap_frame(&frame, target),
            None => return,
        };

        match step {
            BootstrapStep::Ignore => {
                self.metrics.frame_dropped();
                debug!("Dropping frame received before bootstrap completed");
            }
            BootstrapStep::Authenticate(auth) => {
                if let Err(e) = self.send_frame(auth).await {
                    return self.on_failure(e).await;
                }
                self.transition(ConnectionEvent::AuthenticationStarted);
                self.bootstrap_deadline = Some((
                    Instant::now() + self.config.request_timeout,
                    TimeoutKind::AuthReply,
                ));
            }
            BootstrapStep::Connected(event) => self.on_established(event),
            BootstrapStep::Fail(e) => self.on_failure(e).await,
        }
    }

    fn on_established(&mut self, event: Option<P::Event>) {
        let now = Instant::now();
        self.bootstrap_deadline = None;
        self.suppression = None;
        self.retry.reset();
        self.publish.retry.send_replace(self.retry);
        self.publish.terminal.send_replace(None);
        self.publish.credential_required.send_replace(false);
        // Info before state so observers of Connected always find it
        self.publish.info.send_replace(self.protocol.session_info());
        self.connected_at = Some(now);
        self.keepalive.start(now);
        self.metrics.connection_established();
        self.transition(ConnectionEvent::SessionEstablished);

        if let Some(event) = event {
            self.publish_event(event);
        }
    }

    async fn on_session_frame(&mut self, frame: Frame) {
        match self.protocol.route(&frame) {
            FrameRoute::Reply {
                message_id,
                result,
                unmatched,
            } => {
                let success = result.is_ok();
                match self.correlator.resolve(&message_id, result) {
                    Some(latency) => self.metrics.request_completed(latency, success),
                    None => match unmatched {
                        Some(event) => self.publish_event(event),
                        None => {
                            self.metrics.frame_dropped();
                            debug!(message_id = %message_id, "Reply for unknown or expired request");
                        }
                    },
                }
            }
            FrameRoute::Event(event) => self.publish_event(event),
            FrameRoute::CredentialRequired(event) => {
                self.publish_event(event);
                self.on_failure(SessionError::Auth(AuthFailure::Required))
                    .await;
            }
            FrameRoute::Drop(reason) => {
                self.metrics.frame_dropped();
                debug!(reason = %reason, "Dropping frame");
            }
        }
    }

    fn publish_event(&mut self, event: P::Event) {
        trace!(?event, "Publishing event");
        self.dispatcher.dispatch(event);
        self.metrics.event_dispatched();
    }

    /// Drive the state machine to Error and apply the recovery policy
    async fn on_failure(&mut self, error: SessionError) {
        self.fail_pending(&error);
        self.teardown().await;
        self.metrics.connection_failed();

        if let SessionError::Auth(failure) = &error {
            self.metrics.auth_failed();
            self.suppression = Some(Suppression::AuthFailure);
            if *failure == AuthFailure::Required {
                self.publish.credential_required.send_replace(true);
            }
            self.publish.terminal.send_replace(Some(error.clone()));
            self.transition(ConnectionEvent::Failure(error.to_string()));
            return;
        }

        self.transition(ConnectionEvent::Failure(error.to_string()));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let decision = HealthMonitor::should_attempt_reconnection(
            &self.retry,
            &self.config.reconnect,
            self.target.is_some(),
            self.suppression,
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay } => {
                self.retry.attempt_count = attempt;
                self.publish.retry.send_replace(self.retry);
                self.reconnect_at = Some(Instant::now() + delay);
                self.metrics.reconnect_scheduled();
                info!(
                    attempt,
                    max_attempts = self.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnection scheduled"
                );
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let error = SessionError::ReconnectExhausted {
                    attempts: self.retry.attempt_count,
                };
                error!(attempts = self.retry.attempt_count, "Giving up on reconnection");
                self.suppression = Some(Suppression::Exhausted);
                self.publish.terminal.send_replace(Some(error.clone()));
                self.transition(ConnectionEvent::Failure(error.to_string()));
            }
            ReconnectionDecision::AbortSuppressed(reason) => {
                debug!(?reason, "Reconnection suppressed");
            }
            ReconnectionDecision::AbortNoTarget => {
                debug!("No target to reconnect to");
            }
        }
    }

    async fn on_bootstrap_timeout(&mut self) {
        let Some((_, kind)) = self.bootstrap_deadline.take() else {
            return;
        };
        warn!(timeout = %kind, "Bootstrap deadline expired");
        self.on_failure(SessionError::Timeout(kind)).await;
    }

    fn expire_requests(&mut self) {
        let expired = self.correlator.expire(Instant::now());
        if expired > 0 {
            self.metrics.requests_timed_out(expired);
            warn!(count = expired, "Requests timed out");
        }
    }

    async fn send_keepalive(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            self.keepalive.stop();
            return;
        };

        match sink.ping().await {
            Ok(()) => {
                self.keepalive.probe_sent(Instant::now());
                self.metrics.keepalive_sent();
                trace!("Keepalive probe sent");
            }
            Err(e) => {
                warn!(error = %e, "Keepalive probe failed");
                self.on_failure(e).await;
            }
        }
    }

    async fn send_frame(&mut self, frame: Frame) -> SessionResult<()> {
        let sink = self.sink.as_mut().ok_or(SessionError::NotConnected)?;
        if let Frame::Text(text) = &frame {
            trace!(frame = %redact_secrets(text), "Sending frame");
        }
        sink.send(frame).await?;
        self.metrics.frame_sent();
        Ok(())
    }

    fn fail_pending(&mut self, error: &SessionError) {
        let failed = self.correlator.fail_all(error);
        if failed > 0 {
            self.metrics.requests_failed(failed);
            warn!(count = failed, error = %error, "Failed pending requests");
        }
    }

    fn transition(&mut self, event: ConnectionEvent) {
        let next = HealthMonitor::determine_next_state(event);
        if next == self.state {
            return;
        }
        HealthMonitor::log_state_transition(self.channel, &self.state, &next);
        self.state = next.clone();
        self.publish.state.send_replace(next);
    }
}

async fn wait_for_open(opening: &mut Option<JoinHandle<SessionResult<TransportSession>>>) -> OpenResult {
    match opening {
        Some(handle) => handle.await,
        None => future::pending().await,
    }
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<SessionResult<Frame>> {
    match stream {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerEvent;
    use crate::session::connection::Scheme;
    use crate::session::protocol::ControlProtocol;
    use crate::testing::{ClientFrame, MockConnector, MockServer, MockServerConnection};
    use serde_json::json;

    type ControlHandle = SessionHandle<ServerEvent, crate::protocol::ServerInfo>;

    fn target() -> ConnectionTarget {
        ConnectionTarget::new("music.local", 8095, Scheme::Http)
    }

    fn spawn() -> (ControlHandle, MockServer) {
        let (connector, server) = MockConnector::new();
        let handle = SessionEngine::spawn(ControlProtocol::new(), connector, EngineConfig::default());
        (handle, server)
    }

    async fn connected(handle: &ControlHandle, server: &mut MockServer) -> MockServerConnection {
        handle.connect(target()).await.unwrap();
        let conn = server.next_connection().await.unwrap();
        conn.send_json(json!({"server_version": "2.0.0", "schema_version": 27}));
        handle.wait_connected(Duration::from_secs(1)).await.unwrap();
        conn
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_disconnected() {
        let (handle, server) = spawn();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(handle.server_info().is_none());
        assert_eq!(handle.retry_state().attempt_count, 0);
        assert_eq!(server.open_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_before_connect_fails_fast() {
        let (handle, _server) = spawn();
        let result = handle.call("players/all", json!({})).await;
        assert_eq!(result, Err(SessionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_connect_and_call() {
        let (handle, mut server) = spawn();
        let mut conn = connected(&handle, &mut server).await;
        assert_eq!(conn.endpoint.url, "ws://music.local:8095/ws");
        assert_eq!(handle.server_info().unwrap().schema_version, 27);

        let caller = handle.clone();
        let call = tokio::spawn(async move { caller.call("players/all", json!({})).await });

        let request = conn.recv_json().await.unwrap();
        assert_eq!(request["command"], "players/all");
        conn.send_json(json!({"message_id": request["message_id"], "result": ["kitchen"]}));

        assert_eq!(call.await.unwrap().unwrap(), json!(["kitchen"]));
        assert_eq!(handle.metrics().traffic.requests_completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent_while_active() {
        let (handle, mut server) = spawn();
        let _conn = connected(&handle, &mut server).await;

        handle.connect(target()).await.unwrap();
        assert_eq!(server.open_count().await, 1);
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_probes_while_connected() {
        let (handle, mut server) = spawn();
        let mut conn = connected(&handle, &mut server).await;

        tokio::time::sleep(Duration::from_secs(41)).await;
        let frames = conn.drain();
        assert_eq!(
            frames.iter().filter(|f| **f == ClientFrame::Ping).count(),
            2
        );
        assert_eq!(handle.metrics().traffic.keepalives_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_worker() {
        let (handle, mut server) = spawn();
        let mut conn = connected(&handle, &mut server).await;

        handle.shutdown().await.unwrap();
        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert_eq!(conn.drain().last(), Some(&ClientFrame::Close));

        assert_eq!(
            handle.call("players/all", json!({})).await,
            Err(SessionError::EngineStopped)
        );
        // Idempotent
        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reports_uptime() {
        let (handle, mut server) = spawn();
        let _conn = connected(&handle, &mut server).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let health = handle.health().await.unwrap();
        assert!(health.is_healthy);
        assert!(health.uptime.unwrap() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_times_out() {
        let (handle, mut server) = spawn();
        handle.connect(target()).await.unwrap();
        let _conn = server.next_connection().await.unwrap();

        let result = handle.wait_connected(Duration::from_secs(1)).await;
        assert_eq!(result, Err(SessionError::Timeout(TimeoutKind::Connect)));
    }
}
