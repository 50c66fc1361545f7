use super::error::LinkError;
use super::framing::HEADER_SIZE;

/// How packets are delimited on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Framing {
    /// Packets sent back to back; the header's length field delimits them.
    #[default]
    Tlv,
    /// SLIP: escaped packets terminated by `END`.
    Slip,
}

/// Sizing and framing of a [`SerialLink`](super::SerialLink).
///
/// All sizes are fixed for the lifetime of the link.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Receive ring size in bytes (the DMA target).
    pub rx_buffer_size: usize,
    /// Transmit ring size in bytes.
    pub tx_buffer_size: usize,
    /// Capacity of the ready-packet descriptor ring.
    pub max_packets: usize,
    /// Number of pool blocks for reassembly. Packets held by the consumer
    /// keep their block until dropped.
    pub pool_blocks: usize,
    /// Block size, i.e. the largest packet including its header.
    pub block_size: usize,
    pub framing: Framing,
}

impl LinkConfig {
    pub const fn new(framing: Framing) -> Self {
        Self {
            rx_buffer_size: 2048,
            tx_buffer_size: 2048,
            max_packets: 8,
            pool_blocks: 10,
            block_size: 512,
            framing,
        }
    }

    pub const fn with_rx_buffer_size(mut self, size: usize) -> Self {
        self.rx_buffer_size = size;
        self
    }

    pub const fn with_tx_buffer_size(mut self, size: usize) -> Self {
        self.tx_buffer_size = size;
        self
    }

    pub const fn with_packets(mut self, max_packets: usize, pool_blocks: usize) -> Self {
        self.max_packets = max_packets;
        self.pool_blocks = pool_blocks;
        self
    }

    pub const fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Largest payload a single packet can carry.
    pub const fn max_payload(&self) -> usize {
        self.block_size.saturating_sub(HEADER_SIZE)
    }

    pub fn validate(&self) -> Result<(), LinkError> {
        if self.rx_buffer_size == 0 {
            return Err(LinkError::InvalidConfig("rx buffer must not be empty"));
        }
        if self.tx_buffer_size == 0 {
            return Err(LinkError::InvalidConfig("tx buffer must not be empty"));
        }
        if self.max_packets == 0 || self.pool_blocks == 0 {
            return Err(LinkError::InvalidConfig("need at least one packet slot"));
        }
        if self.block_size <= HEADER_SIZE {
            return Err(LinkError::InvalidConfig("block cannot hold a packet header"));
        }
        if self.pool_blocks.checked_mul(self.block_size).is_none() {
            return Err(LinkError::InvalidConfig("pool arena too large"));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new(Framing::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(LinkConfig::default().validate(), Ok(()));
        assert_eq!(LinkConfig::default().max_payload(), 507);
    }

    #[test]
    fn header_sized_block_is_rejected() {
        let config = LinkConfig::new(Framing::Slip).with_block_size(HEADER_SIZE);
        assert!(matches!(config.validate(), Err(LinkError::InvalidConfig(_))));
    }

    #[test]
    fn overflowing_pool_is_rejected() {
        let config = LinkConfig::default().with_packets(8, usize::MAX / 16);
        assert!(matches!(config.validate(), Err(LinkError::InvalidConfig(_))));
    }
}
