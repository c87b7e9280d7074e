use log::{debug, info, warn};
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout};
use tokio_modbus::client::{rtu, tcp, Client, Context};
use tokio_modbus::Slave;

use crate::config::polling::{ConnectionParams, Protocol};
use crate::utils::error::AgentError;

/// Per-request Modbus read/write ceiling.
pub const MODBUS_TIMEOUT: Duration = Duration::from_secs(10);

const ESTABLISH_ATTEMPTS: u32 = 3;
const ESTABLISH_BACKOFF: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const KEEPALIVE_IDLE: Duration = Duration::from_secs(1);

/// A live Modbus session. The context mutex serializes requests so at most
/// one Modbus transaction is outstanding per handle.
#[derive(Debug)]
pub struct PooledConnection {
    key: String,
    protocol: Protocol,
    context: Mutex<Context>,
    broken: AtomicBool,
}

impl PooledConnection {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_healthy(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }

    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub async fn context(&self) -> MutexGuard<'_, Context> {
        self.context.lock().await
    }
}

/// Keyed cache of live Modbus sessions. Creates on miss, reuses on hit,
/// evicts on observed failure. One mutex guards the map; establishment runs
/// under it so concurrent acquires of the same key never double-connect.
pub struct ConnectionPool {
    inner: Mutex<HashMap<String, Arc<PooledConnection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Return a healthy handle for the canonical key, establishing one if
    /// needed (3 attempts, 2 s linear backoff).
    pub async fn acquire(
        &self,
        params: &ConnectionParams,
        protocol: Option<Protocol>,
    ) -> Result<Arc<PooledConnection>, AgentError> {
        let protocol = params.resolve_protocol(protocol)?;
        let key = params.canonical_key(protocol);

        let mut pool = self.inner.lock().await;
        if let Some(handle) = pool.get(&key) {
            if handle.is_healthy() {
                debug!("Reusing pooled connection {}", key);
                return Ok(Arc::clone(handle));
            }
            pool.remove(&key);
        }

        let handle = Arc::new(self.establish(&key, protocol, params).await?);
        pool.insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop a handle after a connection-class failure. In-flight requests on
    /// other tasks finish against the dead session and fail on their own.
    pub async fn evict(&self, key: &str) {
        let mut pool = self.inner.lock().await;
        if let Some(handle) = pool.remove(key) {
            handle.mark_broken();
            warn!("🔌 Evicted connection {} from pool", key);
        }
    }

    pub async fn close_all(&self) {
        let mut pool = self.inner.lock().await;
        let count = pool.len();
        for (_, handle) in pool.drain() {
            handle.mark_broken();
            if let Ok(mut context) = handle.context.try_lock() {
                let _ = context.disconnect().await;
            }
        }
        if count > 0 {
            info!("🔌 Closed {} pooled connections", count);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    async fn establish(
        &self,
        key: &str,
        protocol: Protocol,
        params: &ConnectionParams,
    ) -> Result<PooledConnection, AgentError> {
        let unit = Slave(params.unit_id.unwrap_or(1));
        let mut last_error =
            AgentError::ConnectionError(format!("no connection attempt made for {}", key));

        for attempt in 1..=ESTABLISH_ATTEMPTS {
            if attempt > 1 {
                sleep(ESTABLISH_BACKOFF).await;
                info!(
                    "🔄 Connection attempt {}/{} for {}",
                    attempt, ESTABLISH_ATTEMPTS, key
                );
            }

            match protocol {
                Protocol::Tcp => match self.connect_tcp(params, unit).await {
                    Ok(context) => {
                        info!("✅ Modbus TCP connection established: {}", key);
                        return Ok(PooledConnection {
                            key: key.to_string(),
                            protocol,
                            context: Mutex::new(context),
                            broken: AtomicBool::new(false),
                        });
                    }
                    Err(e) => {
                        warn!("❌ Modbus TCP connect failed for {}: {}", key, e);
                        self.probe_reachability(params).await;
                        last_error = e;
                    }
                },
                Protocol::Rtu => match self.open_rtu(params, unit) {
                    Ok(context) => {
                        info!("✅ Modbus RTU port opened: {}", key);
                        return Ok(PooledConnection {
                            key: key.to_string(),
                            protocol,
                            context: Mutex::new(context),
                            broken: AtomicBool::new(false),
                        });
                    }
                    Err(e) => {
                        warn!("❌ Modbus RTU open failed for {}: {}", key, e);
                        last_error = e;
                    }
                },
            }
        }
        Err(last_error)
    }

    async fn connect_tcp(
        &self,
        params: &ConnectionParams,
        unit: Slave,
    ) -> Result<Context, AgentError> {
        let ip = params
            .ip
            .as_deref()
            .ok_or_else(|| AgentError::ConfigError("tcp device has no ip".to_string()))?;
        let port = params.port.unwrap_or(502);
        let addr = format!("{}:{}", ip, port);

        let stream = timeout(MODBUS_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                AgentError::ConnectionError(format!("connect to {} timed out", addr))
            })?
            .map_err(|e| AgentError::ConnectionError(format!("connect to {} failed: {}", addr, e)))?;

        // Aggressive keep-alive so a silently dead peer surfaces quickly.
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("⚠️  Failed to set TCP keep-alive on {}: {}", addr, e);
        }
        let _ = stream.set_nodelay(true);

        Ok(tcp::attach_slave(stream, unit))
    }

    fn open_rtu(&self, params: &ConnectionParams, unit: Slave) -> Result<Context, AgentError> {
        let path = params
            .serial_port
            .as_deref()
            .ok_or_else(|| AgentError::ConfigError("rtu device has no serialPort".to_string()))?;
        let baud_rate = params.baud_rate.unwrap_or(9600);

        let builder = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .timeout(MODBUS_TIMEOUT);

        let serial = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            AgentError::ConnectionError(format!("Port Not Open: {} ({})", path, e))
        })?;

        Ok(rtu::attach_slave(serial, unit))
    }

    /// Bare-TCP probe after a failed Modbus connect, to tell network
    /// problems apart from a device that answers TCP but not Modbus.
    async fn probe_reachability(&self, params: &ConnectionParams) {
        let Some(ip) = params.ip.as_deref() else {
            return;
        };
        let addr = format!("{}:{}", ip, params.port.unwrap_or(502));
        match timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => info!("🔍 Probe: {} accepts TCP connections", addr),
            Ok(Err(e)) => warn!("🔍 Probe: {} rejected TCP connect: {}", addr, e),
            Err(_) => warn!("🔍 Probe: {} unreachable within {:?}", addr, PROBE_TIMEOUT),
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_fails_without_address_fields() {
        let pool = ConnectionPool::new();
        let params = ConnectionParams::default();
        let err = pool.acquire(&params, None).await.unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn test_evict_unknown_key_is_noop() {
        let pool = ConnectionPool::new();
        pool.evict("tcp:10.0.0.1:502:1").await;
        assert_eq!(pool.len().await, 0);
    }
}
