use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::buffer::{OfflineBuffer, TransmitBuffer, ValueCache};
use crate::config::settings::AgentSettings;
use crate::services::auth::AuthClient;
use crate::services::commands::{
    self, data_update_frame, heartbeat_frame, CommandExecutor, InboundMessage, UpdateEntry,
};
use crate::services::status::StatusReporter;
use crate::services::uploader::BulkUploader;
use crate::services::watcher::{ConfigWatcher, TuningState};
use crate::utils::error::AgentError;

/// How one WebSocket session ended.
enum SessionEnd {
    Closed,
    TokenRefresh,
}

/// The persistent control channel: one WebSocket at a time, with heartbeats,
/// command dispatch, streaming updates, and automatic reconnect. While the
/// channel is down the offline buffer ingests; on every open it drains.
pub struct ControlChannel {
    settings: AgentSettings,
    auth: Arc<AuthClient>,
    agent_id: Arc<RwLock<Option<String>>>,
    channel_open: Arc<AtomicBool>,
    value_cache: Arc<ValueCache>,
    transmit: Arc<TransmitBuffer>,
    offline: Arc<OfflineBuffer>,
    tuning: Arc<TuningState>,
    watcher: Arc<ConfigWatcher>,
    uploader: Arc<BulkUploader>,
    executor: Arc<CommandExecutor>,
    status: Arc<StatusReporter>,
    failures: AtomicU32,
}

impl ControlChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: AgentSettings,
        auth: Arc<AuthClient>,
        agent_id: Arc<RwLock<Option<String>>>,
        channel_open: Arc<AtomicBool>,
        value_cache: Arc<ValueCache>,
        transmit: Arc<TransmitBuffer>,
        offline: Arc<OfflineBuffer>,
        tuning: Arc<TuningState>,
        watcher: Arc<ConfigWatcher>,
        uploader: Arc<BulkUploader>,
        executor: Arc<CommandExecutor>,
        status: Arc<StatusReporter>,
    ) -> Self {
        Self {
            settings,
            auth,
            agent_id,
            channel_open,
            value_cache,
            transmit,
            offline,
            tuning,
            watcher,
            uploader,
            executor,
            status,
            failures: AtomicU32::new(0),
        }
    }

    /// Outer reconnect loop. Never returns; the caller decides process
    /// lifetime.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.session().await {
                Ok(SessionEnd::TokenRefresh) => {
                    // Deliberate cycle, reconnect immediately: the offline
                    // buffer is not engaged for the sub-second gap.
                    info!("🔁 Reconnecting control channel with refreshed token");
                    self.channel_open.store(false, Ordering::SeqCst);
                    continue;
                }
                Ok(SessionEnd::Closed) => warn!("🔌 Control channel closed by peer"),
                Err(e) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    error!("❌ Control channel failure #{}: {}", failures, e);
                }
            }
            self.mark_disconnected().await;
            sleep(Duration::from_secs(self.settings.reconnect_delay_secs)).await;
        }
    }

    async fn mark_disconnected(&self) {
        self.channel_open.store(false, Ordering::SeqCst);
        self.offline.set_buffering(true);
        self.status
            .report(false, self.offline.get_record_count())
            .await;
    }

    /// One connect-serve-teardown pass.
    async fn session(&self) -> Result<SessionEnd, AgentError> {
        // Authenticating: refresh if the token is missing or expiring.
        let jwt = self.auth.current_jwt().await?;

        // Connecting.
        info!("🔗 Connecting control channel: {}", self.settings.ws_url);
        let url = format!("{}?token={}", self.settings.ws_url, jwt);
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| AgentError::TransportError(format!("WebSocket connect failed: {}", e)))?;
        info!("✅ Control channel open");

        let (mut sink, mut stream) = ws_stream.split();

        // Single writer task; every producer sends through this channel so
        // frames never interleave.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Value>(64);
        let writer: JoinHandle<()> = tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Open housekeeping.
        self.failures.store(0, Ordering::SeqCst);
        self.channel_open.store(true, Ordering::SeqCst);
        self.offline.set_buffering(false);
        self.status
            .report(true, self.offline.get_record_count())
            .await;

        let refresh_signal = Arc::new(Notify::new());
        let mut tasks = self.spawn_housekeeping(frame_tx.clone(), Arc::clone(&refresh_signal));
        tasks.push(self.spawn_drain_attempt());
        tasks.push(self.spawn_config_fetch());

        let end = loop {
            tokio::select! {
                _ = refresh_signal.notified() => break SessionEnd::TokenRefresh,
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_inbound(&text, &frame_tx).await,
                    Some(Ok(Message::Close(_))) => break SessionEnd::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("⚠️  WebSocket read error: {}", e);
                        break SessionEnd::Closed;
                    }
                    None => break SessionEnd::Closed,
                }
            }
        };

        for task in tasks {
            task.abort();
        }
        writer.abort();
        Ok(end)
    }

    fn spawn_housekeeping(
        &self,
        frame_tx: mpsc::Sender<Value>,
        refresh_signal: Arc<Notify>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        // Heartbeat.
        {
            let tx = frame_tx.clone();
            let period = Duration::from_secs(self.settings.heartbeat_interval_secs.max(1));
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if tx.send(heartbeat_frame()).await.is_err() {
                        break;
                    }
                    debug!("💓 Heartbeat sent");
                }
            }));
        }

        // Batch transmitter: incremental drains, or a full refresh when due.
        {
            let tx = frame_tx.clone();
            let value_cache = Arc::clone(&self.value_cache);
            let transmit = Arc::clone(&self.transmit);
            let tuning = Arc::clone(&self.tuning);
            tasks.push(tokio::spawn(async move {
                loop {
                    sleep(Duration::from_millis(tuning.batch_window_ms())).await;
                    let frame = if transmit.full_refresh_due() {
                        let updates: Vec<UpdateEntry> = value_cache
                            .snapshot()
                            .into_iter()
                            .map(|entry| UpdateEntry {
                                device_id: entry.device_id,
                                register_id: entry.register_id,
                                value: entry.value,
                            })
                            .collect();
                        transmit.mark_full_refresh();
                        info!("🔄 Full refresh: {} values", updates.len());
                        data_update_frame(true, updates)
                    } else {
                        let samples = transmit.drain();
                        if samples.is_empty() {
                            continue;
                        }
                        let updates: Vec<UpdateEntry> = samples
                            .into_iter()
                            .filter_map(|sample| {
                                sample.value.map(|value| UpdateEntry {
                                    device_id: sample.device_id,
                                    register_id: sample.register_id,
                                    value,
                                })
                            })
                            .collect();
                        data_update_frame(false, updates)
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // Bulk uploader.
        {
            let uploader = Arc::clone(&self.uploader);
            let tuning = Arc::clone(&self.tuning);
            tasks.push(tokio::spawn(async move {
                loop {
                    sleep(Duration::from_millis(tuning.historical_batch_interval_ms())).await;
                    uploader.run_cycle().await;
                }
            }));
        }

        // Config watcher.
        {
            let watcher = Arc::clone(&self.watcher);
            let period = Duration::from_secs(self.settings.config_check_interval_secs.max(1));
            tasks.push(tokio::spawn(async move {
                loop {
                    sleep(period).await;
                    watcher.check_now().await;
                }
            }));
        }

        // Proactive JWT refresh: fetch a fresh token, then cycle the socket
        // so the server sees the new credential.
        {
            let auth = Arc::clone(&self.auth);
            let period = Duration::from_secs(self.settings.jwt_refresh_interval_secs.max(1));
            tasks.push(tokio::spawn(async move {
                loop {
                    sleep(period).await;
                    match auth.refresh().await {
                        Ok(_) => {
                            info!("🔑 JWT refreshed, cycling the control channel");
                            refresh_signal.notify_one();
                            break;
                        }
                        Err(e) => warn!("⚠️  Proactive JWT refresh failed: {}", e),
                    }
                }
            }));
        }

        tasks
    }

    fn spawn_drain_attempt(&self) -> JoinHandle<()> {
        let uploader = Arc::clone(&self.uploader);
        tokio::spawn(async move {
            if let Err(e) = uploader.drain_offline().await {
                warn!("⚠️  Offline drain attempt failed: {}", e);
            }
        })
    }

    fn spawn_config_fetch(&self) -> JoinHandle<()> {
        let watcher = Arc::clone(&self.watcher);
        tokio::spawn(async move { watcher.check_now().await })
    }

    async fn handle_inbound(&self, text: &str, frame_tx: &mpsc::Sender<Value>) {
        let message = match commands::parse_inbound(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️  Dropping malformed frame: {}", e);
                return;
            }
        };

        match message {
            InboundMessage::Connected { agent_id } => {
                info!("🆔 Agent identity: {}", agent_id);
                *self.agent_id.write().await = Some(agent_id);
                // Identity unlocks the initial config fetch, any pending
                // offline drain, and the first status PATCH.
                let _ = self.spawn_config_fetch();
                let _ = self.spawn_drain_attempt();
                let status = Arc::clone(&self.status);
                let buffered = self.offline.get_record_count();
                tokio::spawn(async move { status.report(true, buffered).await });
            }
            InboundMessage::HeartbeatAck => debug!("💓 Heartbeat acknowledged"),
            InboundMessage::Command(command) => {
                let executor = Arc::clone(&self.executor);
                let tx = frame_tx.clone();
                tokio::spawn(async move {
                    let frame = executor.execute(command).await;
                    let _ = tx.send(frame).await;
                });
            }
            InboundMessage::Unknown(kind) => {
                warn!("⚠️  Unknown command '{}', ignoring", kind);
            }
        }
    }
}
