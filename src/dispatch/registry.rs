use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::AddrParseError;

/// Network identity of an executor server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutorAddr {
    pub host: String,
    pub port: u16,
}

impl ExecutorAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// URI used to open a channel to the executor.
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ExecutorAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ExecutorAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddrParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddrParseError::MissingHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| AddrParseError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Latest inventory reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartBeatSnapshot {
    pub reported_at: DateTime<Utc>,
    /// Executions the executor believes it is running.
    pub exec_ids: BTreeSet<i64>,
}

impl HeartBeatSnapshot {
    pub fn new(reported_at: DateTime<Utc>, exec_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            reported_at,
            exec_ids: exec_ids.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorServerInfo {
    pub addr: ExecutorAddr,
    pub registered_at: DateTime<Utc>,
    pub heartbeat: Option<HeartBeatSnapshot>,
}

impl ExecutorServerInfo {
    pub fn new(addr: ExecutorAddr, registered_at: DateTime<Utc>) -> Self {
        Self {
            addr,
            registered_at,
            heartbeat: None,
        }
    }

    /// Execution ids from the last heartbeat, empty if none arrived yet.
    pub fn running_exec_ids(&self) -> Vec<i64> {
        self.heartbeat
            .as_ref()
            .map(|hb| hb.exec_ids.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Live executor set.
///
/// Liveness is reactive: entries are only removed by [`evict`](Self::evict),
/// which the dispatch worker calls after a transport failure. There is no
/// heartbeat timeout.
#[derive(Debug, Default)]
pub struct ExecutorRegistry {
    executors: BTreeMap<ExecutorAddr, ExecutorServerInfo>,
    cursor: usize,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor, or refresh the registration time of a known one.
    pub fn register_executor(&mut self, addr: ExecutorAddr, registered_at: DateTime<Utc>) {
        match self.executors.get_mut(&addr) {
            Some(info) => {
                info.registered_at = registered_at;
                tracing::info!(executor = %addr, "Executor re-registered");
            }
            None => {
                tracing::info!(executor = %addr, "Executor registered");
                self.executors
                    .insert(addr.clone(), ExecutorServerInfo::new(addr, registered_at));
            }
        }
    }

    /// Record a heartbeat. Unknown executors are registered on the fly.
    pub fn report_heartbeat(&mut self, addr: ExecutorAddr, snapshot: HeartBeatSnapshot) {
        if !self.executors.contains_key(&addr) {
            // Auto-register on heartbeat
            self.register_executor(addr.clone(), snapshot.reported_at);
        }
        if let Some(info) = self.executors.get_mut(&addr) {
            tracing::trace!(
                executor = %addr,
                running = snapshot.exec_ids.len(),
                "Executor heartbeat"
            );
            info.heartbeat = Some(snapshot);
        }
    }

    /// Next executor in round-robin order, or `None` when the set is empty.
    pub fn pick_executor(&mut self) -> Option<ExecutorServerInfo> {
        if self.executors.is_empty() {
            return None;
        }
        let index = self.cursor % self.executors.len();
        self.cursor = self.cursor.wrapping_add(1);
        self.executors.values().nth(index).cloned()
    }

    /// Remove an executor and hand back its last known state.
    ///
    /// Returns `None` if it was already evicted, so concurrent failures
    /// against the same executor evict (and fail over) exactly once.
    pub fn evict(&mut self, addr: &ExecutorAddr) -> Option<ExecutorServerInfo> {
        let removed = self.executors.remove(addr);
        if removed.is_some() {
            tracing::warn!(executor = %addr, "Executor evicted");
        }
        removed
    }

    pub fn get(&self, addr: &ExecutorAddr) -> Option<&ExecutorServerInfo> {
        self.executors.get(addr)
    }

    pub fn all_executors(&self) -> Vec<&ExecutorServerInfo> {
        self.executors.values().collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
