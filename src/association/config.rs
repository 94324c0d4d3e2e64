//! Association configuration.

use crate::core::{
    Error, Result, COMMON_HEADER_SIZE, DATA_CHUNK_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_MAX_SEND_BUFFER_SIZE, INITIAL_MTU, INITIAL_RECV_BUF_SIZE, MIN_INIT_A_RWND, RTO_INITIAL,
    RTO_MAX, RTO_MIN,
};

/// When SACKs are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Delay SACKs unless loss, duplicates or the I flag ask for one now.
    #[default]
    Normal,
    /// Acknowledge every packet immediately.
    NoDelay,
    /// Always wait for the delayed-ack timer.
    AlwaysDelay,
}

/// Association configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name used as a prefix in log records.
    pub name: String,

    /// Receive buffer size; also the a_rwnd advertised in INIT.
    pub max_receive_buffer_size: u32,

    /// Largest message `Stream::write` accepts.
    pub max_message_size: u32,

    /// Retransmission timeout before the first RTT sample, in milliseconds.
    pub rto_initial: f64,

    /// Lower bound of the retransmission timeout, in milliseconds.
    pub rto_min: f64,

    /// Upper bound of the retransmission timeout, in milliseconds.
    pub rto_max: f64,

    /// Path MTU used to size packets.
    pub mtu: u32,

    /// Outbound bytes (queued plus in flight) before writers wait.
    pub max_send_buffer_size: usize,

    /// SACK policy.
    pub ack_mode: AckMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_receive_buffer_size: INITIAL_RECV_BUF_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            rto_initial: RTO_INITIAL,
            rto_min: RTO_MIN,
            rto_max: RTO_MAX,
            mtu: INITIAL_MTU,
            max_send_buffer_size: DEFAULT_MAX_SEND_BUFFER_SIZE,
            ack_mode: AckMode::Normal,
        }
    }
}

impl Config {
    /// Largest user payload carried by one DATA chunk.
    pub fn max_payload_size(&self) -> usize {
        (self.mtu as usize).saturating_sub(COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE)
    }

    /// Check the values an association cannot run with.
    pub fn validate(&self) -> Result<()> {
        if (self.mtu as usize) <= COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE {
            return Err(Error::Config(format!("mtu {} too small", self.mtu)));
        }
        if self.max_receive_buffer_size < MIN_INIT_A_RWND {
            return Err(Error::Config(format!(
                "max_receive_buffer_size {} below {MIN_INIT_A_RWND}",
                self.max_receive_buffer_size
            )));
        }
        if self.max_message_size == 0 {
            return Err(Error::Config("max_message_size must be positive".into()));
        }
        if !(self.rto_min > 0.0 && self.rto_min <= self.rto_max) {
            return Err(Error::Config(format!(
                "rto bounds [{}, {}] must be positive and ordered",
                self.rto_min, self.rto_max
            )));
        }
        if self.rto_initial <= 0.0 {
            return Err(Error::Config("rto_initial must be positive".into()));
        }
        Ok(())
    }
}

/// Builder for [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the receive buffer size.
    pub fn max_receive_buffer_size(mut self, size: u32) -> Self {
        self.config.max_receive_buffer_size = size;
        self
    }

    /// Set the maximum message size.
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the RTO used before the first RTT sample, in milliseconds.
    pub fn rto_initial(mut self, rto_initial: f64) -> Self {
        self.config.rto_initial = rto_initial;
        self
    }

    /// Set the RTO lower bound in milliseconds.
    pub fn rto_min(mut self, rto_min: f64) -> Self {
        self.config.rto_min = rto_min;
        self
    }

    /// Set the RTO upper bound in milliseconds.
    pub fn rto_max(mut self, rto_max: f64) -> Self {
        self.config.rto_max = rto_max;
        self
    }

    /// Set the path MTU.
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the outbound buffer limit.
    pub fn max_send_buffer_size(mut self, size: usize) -> Self {
        self.config.max_send_buffer_size = size;
        self
    }

    /// Set the SACK policy.
    pub fn ack_mode(mut self, mode: AckMode) -> Self {
        self.config.ack_mode = mode;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_receive_buffer_size, 1024 * 1024);
        assert_eq!(config.max_message_size, 65536);
        assert_eq!(config.rto_initial, 3000.0);
        assert_eq!(config.rto_min, 1000.0);
        assert_eq!(config.rto_max, 60000.0);
        assert_eq!(config.mtu, 1228);
        assert_eq!(config.max_payload_size(), 1200);
        assert_eq!(config.ack_mode, AckMode::Normal);
    }

    #[test]
    fn test_builder() {
        let config = ConfigBuilder::new()
            .name("client")
            .max_receive_buffer_size(64 * 1024)
            .mtu(1200)
            .ack_mode(AckMode::NoDelay)
            .build()
            .unwrap();
        assert_eq!(config.name, "client");
        assert_eq!(config.max_receive_buffer_size, 64 * 1024);
        assert_eq!(config.max_payload_size(), 1172);
        assert_eq!(config.ack_mode, AckMode::NoDelay);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(matches!(
            ConfigBuilder::new().mtu(28).build(),
            Err(Error::Config(_))
        ));
        assert!(ConfigBuilder::new().max_receive_buffer_size(100).build().is_err());
        assert!(ConfigBuilder::new().max_message_size(0).build().is_err());
        assert!(ConfigBuilder::new().rto_max(0.0).build().is_err());
        assert!(ConfigBuilder::new().rto_min(0.0).build().is_err());
        assert!(ConfigBuilder::new().rto_max(500.0).build().is_err());
        assert!(ConfigBuilder::new().rto_initial(-1.0).build().is_err());
    }

    #[test]
    fn test_rto_knobs() {
        let config = ConfigBuilder::new()
            .rto_initial(400.0)
            .rto_min(100.0)
            .rto_max(5000.0)
            .build()
            .unwrap();
        assert_eq!((config.rto_initial, config.rto_min, config.rto_max), (400.0, 100.0, 5000.0));
    }

    #[test]
    fn test_tiny_mtu_is_rejected_not_underflowed() {
        let config = Config {
            mtu: 20,
            ..Config::default()
        };
        assert_eq!(config.max_payload_size(), 0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
