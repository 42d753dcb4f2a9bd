use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Port the master pod serves range allocations on.
pub const MASTER_PORT: u16 = 8080;

/// Exchange every fanout listener binds its queue to.
pub const DEFAULT_EXCHANGE: &str = "batch";

/// Configuration for the range-allocation master.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], MASTER_PORT)),
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }
}

/// Configuration for a worker pulling ranges from the master.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Base URL of the master, e.g. `http://10.0.0.4:8080`
    pub master_url: String,
    /// Fixed delay between failed range requests
    pub retry_delay: Duration,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            master_url: format!("http://127.0.0.1:{}", MASTER_PORT),
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl PullConfig {
    /// Build the config from the master pod IP, using the well-known master port.
    pub fn for_master_ip(master_ip: &str) -> Self {
        Self {
            master_url: format!("http://{}:{}", master_ip, MASTER_PORT),
            ..Default::default()
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Pod identity and broker settings for a fanout listener.
///
/// Deserialized from the listener payload. `range_start`/`range_end` are the
/// inclusive bounds of this pod's slice of the cluster-wide CPU numbering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(alias = "amqp_url")]
    pub broker_url: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    pub queue_name: String,
    pub range_start: usize,
    pub range_end: usize,
    pub num_cpus_cluster: usize,
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_string()
}

impl ListenerConfig {
    pub fn new(
        queue_name: impl Into<String>,
        range_start: usize,
        range_end: usize,
        num_cpus_cluster: usize,
    ) -> Self {
        Self {
            broker_url: "redis://127.0.0.1:6379".to_string(),
            exchange: default_exchange(),
            queue_name: queue_name.into(),
            range_start,
            range_end,
            num_cpus_cluster,
        }
    }

    pub fn with_broker_url(mut self, broker_url: impl Into<String>) -> Self {
        self.broker_url = broker_url.into();
        self
    }
}

/// Tuning knobs for the completion-tracking engine.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Maximum number of concurrent status/result fetches per polling pass
    pub pool_size: usize,
    /// Sleep between polling passes
    pub poll_interval: Duration,
    /// How often a storage monitor lists available statuses
    pub monitor_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            pool_size: 128,
            poll_interval: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration for the shell command that executes invocations.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Command run through `sh -c`; receives the job payload as JSON on stdin
    pub command: String,
    /// Extra environment variables for the spawned process
    pub env: HashMap<String, String>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            command: "cat > /dev/null".to_string(),
            env: HashMap::new(),
        }
    }
}

impl HandlerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}
