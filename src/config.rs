use std::net::SocketAddr;
use std::time::Duration;

/// Settings for the dispatch worker.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Submit attempts against one executor before giving up on it.
    pub retry_count: u32,
    /// Sleep before re-queueing a flow when no executor is registered.
    pub no_executor_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            no_executor_backoff: Duration::from_secs(5),
        }
    }
}

/// Timeouts used by the master when calling executors.
#[derive(Debug, Clone)]
pub struct ExecutorClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for ExecutorClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    /// Host written to the master record. Defaults to the listen IP.
    pub advertise_host: String,
    pub dispatch: DispatchConfig,
    pub executor_client: ExecutorClientConfig,
    /// Time the dispatch worker gets to finish its current flow on shutdown.
    pub shutdown_grace: Duration,
    /// Upper bound on runs materialized by one backfill request.
    pub max_backfill_runs: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8090"
                .parse()
                .expect("default listen address is valid"),
            advertise_host: "127.0.0.1".to_string(),
            dispatch: DispatchConfig::default(),
            executor_client: ExecutorClientConfig::default(),
            shutdown_grace: Duration::from_secs(10),
            max_backfill_runs: 10_000,
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            advertise_host: listen_addr.ip().to_string(),
            ..Default::default()
        }
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = host.into();
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.dispatch.retry_count = retry_count;
        self
    }

    pub fn with_no_executor_backoff(mut self, backoff: Duration) -> Self {
        self.dispatch.no_executor_backoff = backoff;
        self
    }
}

/// Settings for the bundled executor agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_addr: SocketAddr,
    /// Host reported to the master; the master dials `advertise_host:port`.
    pub advertise_host: String,
    /// Master address in `http://host:port` form.
    pub master_addr: String,
    pub heartbeat_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:9000"
                .parse()
                .expect("default listen address is valid"),
            advertise_host: "127.0.0.1".to_string(),
            master_addr: "http://127.0.0.1:8090".to_string(),
            heartbeat_interval: Duration::from_secs(3),
        }
    }
}

impl AgentConfig {
    pub fn new(listen_addr: SocketAddr, master_addr: impl Into<String>) -> Self {
        Self {
            listen_addr,
            advertise_host: listen_addr.ip().to_string(),
            master_addr: master_addr.into(),
            ..Default::default()
        }
    }

    pub fn advertise_port(&self) -> u16 {
        self.listen_addr.port()
    }
}
