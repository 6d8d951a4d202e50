//! Protocol Engine (§4.E): the per-device state machine driving
//! connect/retry/disconnect, starting/periodic/stopping command
//! scheduling, and status/response emission to sinks.
//!
//! Grounded on the teacher's `state/election.rs` pattern of a generation
//! counter guarding timer-armed transitions against stale callbacks (reused
//! here so a reconnect doesn't race a disconnect that happened in the
//! meantime), and on `network/client.rs`'s per-connection read loop for the
//! inbound chunk pump.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::command::runtime::{self, CompiledCommand};
use crate::command::script::ScriptValue;
use crate::command::{CommandRuntime, CommandSink};
use crate::error::{Error, Result};
use crate::model::{now_ms, Device, Response, Status, StatusCode};
use crate::protocol::driver::{build_transport, RawChunk, Transport};
use crate::protocol::options::ConnectionOptions;
use crate::protocol::framing::FrameAssembler;
use crate::sink::SinkFanout;

const RESPONSE_TIMEOUT_POLL_MS: u64 = 500;

/// Drives one device's connection lifecycle and command schedule (§4.E
/// state table). Constructed fresh per `connect`; disposed on `disconnect`.
pub struct ProtocolEngine {
    device_id: String,
    device: RwLock<Device>,
    transport: Arc<dyn Transport>,
    frames: Arc<FrameAssembler>,
    command_runtime: Arc<CommandRuntime>,
    sinks: Arc<SinkFanout>,
    node_index: u32,
    driver_id: String,

    status: RwLock<StatusCode>,
    command_lock: Mutex<()>,
    generation: AtomicU64,
    disposed: AtomicBool,
    pending_read: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
    last_response_ms: AtomicI64,
    inbound_tx: mpsc::Sender<RawChunk>,
    /// The inbound-chunk pump and emit-frame pump, spawned once in `new()`
    /// and running for the engine's whole lifetime. Only torn down on a
    /// full `disconnect()` — `connection_lost()` must never abort these or
    /// the reconnected device stops draining its own packets.
    lifecycle_tasks: StdMutex<Vec<JoinHandle<()>>>,
    /// Per-connection scheduler tasks (connect retries, starting/periodic
    /// command runners) that are torn down and re-spawned across a
    /// `connection_lost()` -> reconnect cycle.
    scheduler_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtocolEngine {
    pub fn new(
        device: Device,
        node_index: u32,
        driver_id: String,
        command_runtime: Arc<CommandRuntime>,
        sinks: Arc<SinkFanout>,
    ) -> Result<Arc<Self>> {
        let opts = ConnectionOptions::parse(&device.connection_url)?;
        let transport: Arc<dyn Transport> = Arc::from(build_transport(&opts)?);
        let (frames, mut emit_rx) = FrameAssembler::new(opts, None);
        let frames = Arc::new(frames);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(256);

        let engine = Arc::new(Self {
            device_id: device.id.clone(),
            device: RwLock::new(device),
            transport,
            frames,
            command_runtime,
            sinks,
            node_index,
            driver_id,
            status: RwLock::new(StatusCode::Disconnected),
            command_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            pending_read: Mutex::new(None),
            last_response_ms: AtomicI64::new(now_ms()),
            inbound_tx,
            lifecycle_tasks: StdMutex::new(Vec::new()),
            scheduler_tasks: Mutex::new(Vec::new()),
        });

        {
            let engine = Arc::clone(&engine);
            let handle = tokio::spawn(async move {
                while let Some(chunk) = inbound_rx.recv().await {
                    if engine.disposed.load(Ordering::SeqCst) {
                        break;
                    }
                    let frames_out = engine.frames.push(&chunk.remote, chunk.bytes).await;
                    for frame in frames_out {
                        engine.on_frame(frame).await;
                    }
                }
            });
            engine.lifecycle_tasks.lock().unwrap().push(handle);
        }
        {
            let engine = Arc::clone(&engine);
            let handle = tokio::spawn(async move {
                while let Some(frame) = emit_rx.recv().await {
                    if engine.disposed.load(Ordering::SeqCst) {
                        break;
                    }
                    engine.on_frame(frame).await;
                }
            });
            engine.lifecycle_tasks.lock().unwrap().push(handle);
        }
        engine.spawn_response_timeout_supervisor();

        Ok(engine)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn status(&self) -> StatusCode {
        *self.status.read().await
    }

    pub async fn device_snapshot(&self) -> Device {
        self.device.read().await.clone()
    }

    /// §4.E `∅ -> CONNECTING`: compiles commands, emits the first status,
    /// and starts the connect attempt loop.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let device = self.device.read().await.clone();
        self.command_runtime.compile_device(&device).await?;
        self.set_status(StatusCode::Connecting).await;
        self.last_response_ms.store(now_ms(), Ordering::SeqCst);
        let gen = self.generation.load(Ordering::SeqCst);
        self.attempt_connect(gen, 0).await;
        Ok(())
    }

    async fn attempt_connect(self: &Arc<Self>, gen: u64, retry_count: i64) {
        if self.stale(gen) {
            return;
        }
        let connection_command = self.device.read().await.connection_command;
        let result = if connection_command {
            // Connection established lazily per-command; treat as immediately available.
            Ok(())
        } else {
            self.transport.connect(self.inbound_tx.clone()).await
        };
        match result {
            Ok(()) => self.on_connected(gen).await,
            Err(e) => self.on_connect_failed(gen, retry_count, e).await,
        }
    }

    async fn on_connected(self: &Arc<Self>, gen: u64) {
        if self.stale(gen) {
            return;
        }
        self.set_status(StatusCode::Connected).await;
        self.last_response_ms.store(now_ms(), Ordering::SeqCst);
        let device = self.device.read().await.clone();
        let delay_ms = device.initial_command_delay_ms.max(0) as u64;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            if this.stale(gen) {
                return;
            }
            this.run_starting_commands(gen).await;
            this.schedule_periodic_groups(gen).await;
        });
        self.scheduler_tasks.lock().await.push(handle);
    }

    async fn on_connect_failed(self: &Arc<Self>, gen: u64, retry_count: i64, err: Error) {
        if self.stale(gen) {
            return;
        }
        tracing::warn!(device_id = %self.device_id, error = %err, retry_count, "connect attempt failed");
        self.set_status(StatusCode::ConnectionFail).await;
        let device = self.device.read().await.clone();
        let within_budget = device.max_retry_connect < 0 || retry_count < device.max_retry_connect;
        if !within_budget {
            self.set_status(StatusCode::Disconnected).await;
            self.command_runtime.forget_device(&self.device_id).await;
            return;
        }
        let delay = Duration::from_millis(device.retry_connect_delay_ms.max(0) as u64);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.stale(gen) {
                return;
            }
            this.set_status(StatusCode::Connecting).await;
            this.attempt_connect(gen, retry_count + 1).await;
        });
        self.scheduler_tasks.lock().await.push(handle);
    }

    /// §4.E `CONNECTED -> CONNECTION_LOST`: dispose scheduled commands,
    /// disconnect, and retry after `retryConnectDelay`.
    pub async fn connection_lost(self: &Arc<Self>) {
        let gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.abort_tasks().await;
        self.set_status(StatusCode::ConnectionLost).await;
        let _ = self.transport.disconnect().await;
        let device = self.device.read().await.clone();
        let delay = Duration::from_millis(device.retry_connect_delay_ms.max(0) as u64);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.stale(gen) {
                return;
            }
            this.set_status(StatusCode::Connecting).await;
            this.attempt_connect(gen, 0).await;
        });
        self.scheduler_tasks.lock().await.push(handle);
    }

    /// §4.E `any≠DISCONNECTED -> DISCONNECTED`: runs stopping commands if
    /// the device was connected, then tears the transport down.
    pub async fn disconnect(self: &Arc<Self>) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.disposed.store(true, Ordering::SeqCst);
        self.abort_tasks().await;
        self.abort_lifecycle_tasks();

        let was_connected = *self.status.read().await == StatusCode::Connected;
        if was_connected {
            let _guard = self.command_lock.lock().await;
            if let Some(commands) = self.command_runtime.commands_for(&self.device_id).await {
                let stopping = runtime::stopping_commands(&commands);
                if !stopping.is_empty() {
                    let mut responses = Vec::new();
                    if let Err(e) = self
                        .command_runtime
                        .locked_execute_commands(
                            &self.device_id,
                            &stopping,
                            self.as_ref(),
                            ScriptValue::None,
                            true,
                            &mut |r| responses.push(r),
                        )
                        .await
                    {
                        tracing::warn!(device_id = %self.device_id, error = %e, "stopping commands failed");
                    }
                    for r in responses {
                        self.sinks.send_response(&r, &self.driver_id, self.node_index).await;
                    }
                }
            }
        }

        match self.transport.disconnect().await {
            Ok(()) => self.set_status(StatusCode::Disconnected).await,
            Err(e) => {
                tracing::warn!(device_id = %self.device_id, error = %e, "disconnect failed");
                self.set_status(StatusCode::DisconnectionFail).await;
            }
        }
        self.command_runtime.forget_device(&self.device_id).await;
    }

    /// Runs on-demand command execution for a caller-selected id subset
    /// (REST `execute-commands`/`request-commands`, §6).
    pub async fn execute_commands(self: &Arc<Self>, ids: &[String], emit_responses: bool) -> Result<Vec<Response>> {
        let Some(commands) = self.command_runtime.commands_for(&self.device_id).await else {
            return Err(Error::DeviceNotFound(self.device_id.clone()));
        };
        let selected: Vec<CompiledCommand> = commands
            .iter()
            .filter(|c| ids.is_empty() || ids.contains(&c.command.id))
            .cloned()
            .collect();
        let _guard = self.command_lock.lock().await;
        let mut responses = Vec::new();
        self.command_runtime
            .locked_execute_commands(
                &self.device_id,
                &selected,
                self.as_ref(),
                ScriptValue::None,
                emit_responses,
                &mut |r| responses.push(r),
            )
            .await?;
        for r in &responses {
            self.sinks.send_response(r, &self.driver_id, self.node_index).await;
        }
        Ok(responses)
    }

    async fn run_starting_commands(self: &Arc<Self>, gen: u64) {
        let Some(commands) = self.command_runtime.commands_for(&self.device_id).await else { return };
        let starting = runtime::starting_commands(&commands);
        if starting.is_empty() {
            return;
        }
        let _guard = self.command_lock.lock().await;
        if self.stale(gen) {
            return;
        }
        let mut responses = Vec::new();
        let result = self
            .command_runtime
            .locked_execute_commands(
                &self.device_id,
                &starting,
                self.as_ref(),
                ScriptValue::None,
                true,
                &mut |r| responses.push(r),
            )
            .await;
        for r in responses {
            self.sinks.send_response(&r, &self.driver_id, self.node_index).await;
        }
        if let Err(e) = result {
            tracing::warn!(device_id = %self.device_id, error = %e, "starting commands failed");
            self.connection_lost().await;
        }
    }

    async fn schedule_periodic_groups(self: &Arc<Self>, gen: u64) {
        let Some(commands) = self.command_runtime.commands_for(&self.device_id).await else { return };
        let groups = runtime::group_by_effective_period(&commands);
        for (period_ms, group) in groups {
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(period_ms as u64));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if this.stale(gen) {
                        return;
                    }
                    // Overlapping ticks coalesce: if the previous tick's
                    // group is still running, this one is dropped (§9
                    // "backpressure / latest-wins scheduling").
                    let Ok(_guard) = this.command_lock.try_lock() else { continue };
                    if this.stale(gen) {
                        return;
                    }
                    let mut responses = Vec::new();
                    let result = this
                        .command_runtime
                        .locked_execute_commands(
                            &this.device_id,
                            &group,
                            this.as_ref(),
                            ScriptValue::None,
                            true,
                            &mut |r| responses.push(r),
                        )
                        .await;
                    for r in responses {
                        this.sinks.send_response(&r, &this.driver_id, this.node_index).await;
                    }
                    if let Err(e) = result {
                        tracing::warn!(device_id = %this.device_id, error = %e, period_ms, "periodic command group failed");
                        let connection_lost_on_exception = this.device.read().await.connection_lost_on_exception;
                        if connection_lost_on_exception {
                            this.connection_lost().await;
                            return;
                        }
                    }
                }
            });
            self.scheduler_tasks.lock().await.push(handle);
        }
    }

    async fn on_frame(self: &Arc<Self>, frame: Vec<u8>) {
        self.last_response_ms.store(now_ms(), Ordering::SeqCst);
        let pending = self.pending_read.lock().await.take();
        if let Some(tx) = pending {
            let _ = tx.send(frame);
            return;
        }
        let mut responses = Vec::new();
        if let Err(e) = self
            .command_runtime
            .execute_non_periodic_commands(&self.device_id, &frame, now_ms(), &mut |r| responses.push(r))
            .await
        {
            tracing::warn!(device_id = %self.device_id, error = %e, "non-periodic command dispatch failed");
        }
        for r in responses {
            self.sinks.send_response(&r, &self.driver_id, self.node_index).await;
        }
    }

    fn spawn_response_timeout_supervisor(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(RESPONSE_TIMEOUT_POLL_MS)).await;
                if this.disposed.load(Ordering::SeqCst) {
                    return;
                }
                let timeout_ms = this.device.read().await.response_timeout_ms;
                if timeout_ms <= 0 {
                    continue;
                }
                if *this.status.read().await != StatusCode::Connected {
                    continue;
                }
                let elapsed = now_ms() - this.last_response_ms.load(Ordering::SeqCst);
                if elapsed > timeout_ms {
                    tracing::warn!(device_id = %this.device_id, elapsed, timeout_ms, "response timeout elapsed");
                    this.connection_lost().await;
                }
            }
        });
    }

    async fn abort_tasks(&self) {
        let mut tasks = self.scheduler_tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    fn abort_lifecycle_tasks(&self) {
        let mut tasks = self.lifecycle_tasks.lock().unwrap();
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    async fn set_status(&self, code: StatusCode) {
        *self.status.write().await = code;
        let status = Status { device_id: self.device_id.clone(), code, issued_time: now_ms() };
        let sinks = Arc::clone(&self.sinks);
        let driver_id = self.driver_id.clone();
        let node_index = self.node_index;
        tokio::spawn(async move { sinks.send_status(&status, &driver_id, node_index).await });
    }

    fn stale(&self, gen: u64) -> bool {
        self.disposed.load(Ordering::SeqCst) || gen != self.generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandSink for ProtocolEngine {
    async fn send_request(
        &self,
        _cmd_id: &str,
        request_info: ScriptValue,
        timeout_ms: i64,
        is_read: bool,
    ) -> Result<ScriptValue> {
        let bytes = match &request_info {
            ScriptValue::None => Vec::new(),
            ScriptValue::Str(s) => s.clone().into_bytes(),
            other => format!("{other:?}").into_bytes(),
        };

        if !is_read {
            self.transport.send(&bytes).await?;
            return Ok(ScriptValue::None);
        }

        let (tx, rx) = oneshot::channel();
        *self.pending_read.lock().await = Some(tx);
        if let Err(e) = self.transport.send(&bytes).await {
            self.pending_read.lock().await.take();
            return Err(e);
        }

        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(frame)) => Ok(ScriptValue::Str(String::from_utf8_lossy(&frame).into_owned())),
            _ => {
                self.pending_read.lock().await.take();
                Err(Error::ResponseTimeout(self.device_id.clone()))
            }
        }
    }
}
