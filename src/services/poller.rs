use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::buffer::{HistoricalBuffer, Sample, TransmitBuffer, ValueCache};
use crate::config::polling::{
    ConnectionParams, PollGroupConfig, PollingConfig, Protocol,
};
use crate::modbus::connection::ConnectionPool;
use crate::modbus::ops::read_holding_block;
use crate::modbus::optimizer::{normalize_address, optimize, ReadBlock, MAX_BLOCK_SIZE};
use crate::utils::error::AgentError;

/// Drives one independent periodic task per `(device, group)` and owns their
/// lifecycle across reconfigurations.
pub struct PollingScheduler {
    pool: Arc<ConnectionPool>,
    value_cache: Arc<ValueCache>,
    transmit: Arc<TransmitBuffer>,
    historical: Arc<HistoricalBuffer>,
    state: Mutex<SchedulerState>,
}

struct SchedulerState {
    config_id: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl PollingScheduler {
    pub fn new(
        pool: Arc<ConnectionPool>,
        value_cache: Arc<ValueCache>,
        transmit: Arc<TransmitBuffer>,
        historical: Arc<HistoricalBuffer>,
    ) -> Self {
        Self {
            pool,
            value_cache,
            transmit,
            historical,
            state: Mutex::new(SchedulerState {
                config_id: None,
                tasks: Vec::new(),
            }),
        }
    }

    /// Tear down the previous schedule and arm one timer per poll group.
    /// Holding the state lock across teardown and re-arm makes the swap
    /// atomic for observers.
    pub async fn apply(&self, config_id: &str, config: &PollingConfig) -> Result<(), AgentError> {
        config.validate()?;

        let mut state = self.state.lock().await;
        Self::teardown(&mut state);
        self.pool.close_all().await;
        self.value_cache.clear();
        self.transmit.clear();
        self.transmit
            .set_full_refresh_interval(config.full_refresh_interval_ms);

        let mut group_count = 0;
        for device in &config.devices {
            for group in &device.poll_groups {
                let runner = GroupRunner {
                    pool: Arc::clone(&self.pool),
                    value_cache: Arc::clone(&self.value_cache),
                    transmit: Arc::clone(&self.transmit),
                    historical: Arc::clone(&self.historical),
                    device_id: device.device_id.clone(),
                    protocol: device.protocol,
                    connection: device.connection.clone(),
                    group: group.clone(),
                };
                state.tasks.push(tokio::spawn(runner.run()));
                group_count += 1;
            }
        }

        state.config_id = Some(config_id.to_string());
        info!(
            "✅ Polling config '{}' applied: {} devices, {} groups",
            config_id,
            config.devices.len(),
            group_count
        );
        Ok(())
    }

    /// Stop all polling and forget the active config.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.config_id.is_some() || !state.tasks.is_empty() {
            info!("🛑 Stopping polling schedule");
        }
        Self::teardown(&mut state);
        state.config_id = None;
        self.pool.close_all().await;
    }

    fn teardown(state: &mut SchedulerState) {
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }

    pub async fn active_config_id(&self) -> Option<String> {
        self.state.lock().await.config_id.clone()
    }

    pub async fn group_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }
}

/// One `(device, group)` polling loop.
struct GroupRunner {
    pool: Arc<ConnectionPool>,
    value_cache: Arc<ValueCache>,
    transmit: Arc<TransmitBuffer>,
    historical: Arc<HistoricalBuffer>,
    device_id: String,
    protocol: Option<Protocol>,
    connection: ConnectionParams,
    group: PollGroupConfig,
}

impl GroupRunner {
    async fn run(self) {
        let blocks = optimize(&self.group.registers, MAX_BLOCK_SIZE);
        info!(
            "⏱️  Group '{}' on device '{}': {} registers in {} blocks every {} ms",
            self.group.group_id,
            self.device_id,
            self.group.registers.len(),
            blocks.len(),
            self.group.interval_ms
        );

        // Re-entrancy gate: a tick arriving while the previous iteration
        // still holds the guard is skipped, never run concurrently.
        let gate = Mutex::new(());
        let mut ticker = interval(Duration::from_millis(self.group.interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let _guard = match gate.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    warn!(
                        "⚠️  [{}/{}] previous iteration still running, skipping tick",
                        self.device_id, self.group.group_id
                    );
                    continue;
                }
            };
            self.poll_iteration(&blocks).await;
        }
    }

    /// One full pass over the group's read blocks. Errors are contained
    /// here; nothing propagates out of the group.
    async fn poll_iteration(&self, blocks: &[ReadBlock]) {
        if blocks.is_empty() {
            return;
        }
        let timestamp = Sample::iteration_timestamp();

        let mut handle = match self.pool.acquire(&self.connection, self.protocol).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(
                    "❌ [{}/{}] connection failed: {}",
                    self.device_id, self.group.group_id, e
                );
                for block in blocks {
                    self.record_block_failure(block, &timestamp);
                }
                return;
            }
        };

        for block in blocks {
            // Health re-check before every request; a handle broken by an
            // earlier block (or another group) gets replaced here.
            if !handle.is_healthy() {
                self.pool.evict(handle.key()).await;
                handle = match self.pool.acquire(&self.connection, self.protocol).await {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        error!(
                            "❌ [{}/{}] reconnect failed: {}",
                            self.device_id, self.group.group_id, e
                        );
                        self.record_block_failure(block, &timestamp);
                        continue;
                    }
                };
            }

            let start = normalize_address(block.start_address);
            match read_holding_block(&handle, start, block.count).await {
                Ok(words) => self.record_block_success(block, &words, &timestamp),
                Err(e) if e.is_connection_error() => {
                    warn!(
                        "🔄 [{}/{}] connection-class read error ({}), evicting and retrying once",
                        self.device_id, self.group.group_id, e
                    );
                    self.pool.evict(handle.key()).await;
                    match self.pool.acquire(&self.connection, self.protocol).await {
                        Ok(fresh) => {
                            handle = fresh;
                            match read_holding_block(&handle, start, block.count).await {
                                Ok(words) => {
                                    self.record_block_success(block, &words, &timestamp)
                                }
                                Err(retry_err) => {
                                    error!(
                                        "❌ [{}/{}] retry failed: {}",
                                        self.device_id, self.group.group_id, retry_err
                                    );
                                    self.record_block_failure(block, &timestamp);
                                }
                            }
                        }
                        Err(reacquire_err) => {
                            error!(
                                "❌ [{}/{}] re-acquire failed: {}",
                                self.device_id, self.group.group_id, reacquire_err
                            );
                            self.record_block_failure(block, &timestamp);
                        }
                    }
                }
                Err(e) => {
                    error!(
                        "❌ [{}/{}] read failed at {}+{}: {}",
                        self.device_id, self.group.group_id, start, block.count, e
                    );
                    self.record_block_failure(block, &timestamp);
                }
            }
        }
    }

    /// Value cache and historical buffer advance in lock-step: every word
    /// yields exactly one good historical sample and, when changed or a full
    /// refresh is due, one transmit sample.
    fn record_block_success(&self, block: &ReadBlock, words: &[u16], timestamp: &str) {
        let full_refresh_due = self.transmit.full_refresh_due();
        for (offset, register) in block.registers.iter().enumerate() {
            let Some(&value) = words.get(offset) else {
                // Short response: the device answered with fewer words than
                // requested. Registers past the end read as bad.
                warn!(
                    "⚠️  [{}/{}] short response: {} words for {} registers",
                    self.device_id,
                    self.group.group_id,
                    words.len(),
                    block.registers.len()
                );
                self.historical.push(Sample::bad(
                    &self.device_id,
                    &register.register_id,
                    timestamp,
                ));
                continue;
            };

            let changed = self
                .value_cache
                .update(&self.device_id, &register.register_id, value);
            let sample = Sample::good(&self.device_id, &register.register_id, value, timestamp);
            self.historical.push(sample.clone());
            if changed || full_refresh_due {
                self.transmit.push(sample);
            }
        }
    }

    fn record_block_failure(&self, block: &ReadBlock, timestamp: &str) {
        self.historical.push_many(
            block
                .registers
                .iter()
                .map(|register| Sample::bad(&self.device_id, &register.register_id, timestamp)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::polling::{DeviceConfig, RegisterConfig};

    fn scheduler() -> PollingScheduler {
        PollingScheduler::new(
            Arc::new(ConnectionPool::new()),
            Arc::new(ValueCache::new()),
            Arc::new(TransmitBuffer::new()),
            Arc::new(HistoricalBuffer::new(100)),
        )
    }

    fn config_with_groups(groups: usize) -> PollingConfig {
        let poll_groups = (0..groups)
            .map(|i| PollGroupConfig {
                group_id: format!("g{}", i),
                interval_ms: 60_000,
                registers: vec![RegisterConfig {
                    register_id: format!("r{}", i),
                    address: 40001 + i as u16,
                    function_code: None,
                }],
            })
            .collect();
        PollingConfig {
            full_refresh_interval_ms: 300_000,
            batch_window_ms: 2_000,
            historical_batch_interval_ms: 60_000,
            devices: vec![DeviceConfig {
                device_id: "dev-1".to_string(),
                protocol: Some(Protocol::Tcp),
                connection: ConnectionParams {
                    ip: Some("127.0.0.1".to_string()),
                    port: Some(1),
                    ..Default::default()
                },
                poll_groups,
            }],
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent_for_task_count() {
        let scheduler = scheduler();
        let config = config_with_groups(3);

        scheduler.apply("cfg-1", &config).await.unwrap();
        assert_eq!(scheduler.group_count().await, 3);

        // Same config again: same set of armed timers, no leaks.
        scheduler.apply("cfg-1", &config).await.unwrap();
        assert_eq!(scheduler.group_count().await, 3);
        assert_eq!(scheduler.active_config_id().await.as_deref(), Some("cfg-1"));

        scheduler.stop().await;
        assert_eq!(scheduler.group_count().await, 0);
        assert_eq!(scheduler.active_config_id().await, None);
    }

    #[tokio::test]
    async fn test_apply_rejects_invalid_config() {
        let scheduler = scheduler();
        let mut config = config_with_groups(1);
        config.devices[0].poll_groups[0].interval_ms = 0;

        assert!(scheduler.apply("cfg-bad", &config).await.is_err());
        assert_eq!(scheduler.group_count().await, 0);
        assert_eq!(scheduler.active_config_id().await, None);
    }
}
