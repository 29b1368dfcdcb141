const DEFAULT_HOST: &str = "localhost";
const DEFAULT_SHARDING_QUEUE_CAPACITY: usize = 256;
const DEFAULT_RECOVERY_QUEUE_CAPACITY: usize = 16;

/// Configuration for a namespace sharding controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Host value written into the leadership marker. Must be unique per
    /// process contending for leadership in a namespace.
    pub host: String,
    /// Capacity of the sharding worker's event queue. Events arriving while the
    /// queue is full are dropped; the next event re-shards everything anyway.
    pub sharding_queue_capacity: usize,
    /// Capacity of the connection-loss handler's action queue.
    pub recovery_queue_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            sharding_queue_capacity: DEFAULT_SHARDING_QUEUE_CAPACITY,
            recovery_queue_capacity: DEFAULT_RECOVERY_QUEUE_CAPACITY,
        }
    }
}

impl ControllerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn with_sharding_queue_capacity(mut self, capacity: usize) -> Self {
        self.sharding_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_recovery_queue_capacity(mut self, capacity: usize) -> Self {
        self.recovery_queue_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_config_default() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.sharding_queue_capacity, 256);
        assert_eq!(cfg.recovery_queue_capacity, 16);
    }

    #[test]
    fn controller_config_new_keeps_defaults() {
        let cfg = ControllerConfig::new("host-A");
        assert_eq!(cfg.host, "host-A");
        assert_eq!(cfg.sharding_queue_capacity, 256);
        assert_eq!(cfg.recovery_queue_capacity, 16);
    }

    #[test]
    fn controller_config_builders() {
        let cfg = ControllerConfig::new("host-B")
            .with_sharding_queue_capacity(8)
            .with_recovery_queue_capacity(4);
        assert_eq!(cfg.sharding_queue_capacity, 8);
        assert_eq!(cfg.recovery_queue_capacity, 4);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cfg = ControllerConfig::default()
            .with_sharding_queue_capacity(0)
            .with_recovery_queue_capacity(0);
        assert_eq!(cfg.sharding_queue_capacity, 1);
        assert_eq!(cfg.recovery_queue_capacity, 1);
    }
}
