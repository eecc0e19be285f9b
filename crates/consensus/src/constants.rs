//! Protocol-wide constants.

/// Current P2P protocol version spoken by this node.
pub const PROTOCOL_VERSION: i32 = 70015;

/// Minimum peer protocol version we will talk to.
pub const PROTOCOL_MINIMUM: i32 = 31800;

/// Protocol version at which header announcements became available (BIP130).
pub const SENDHEADERS_VERSION: i32 = 70012;

pub const MAX_BLOCK_SIZE: usize = 1_000_000;
pub const MAX_BLOCK_SIGOPS: usize = 20_000;
pub const MAX_SCRIPT_SIZE: usize = 10_000;
pub const MAX_TX_SIZE: usize = 1_000_000;

pub const COINBASE_MATURITY: u32 = 100;

/// Headers per `headers` message.
pub const MAX_GET_HEADERS: usize = 2000;

/// Inventory entries per `getblocks` response.
pub const MAX_GET_BLOCKS: usize = 500;

/// Median-time-past window, in headers.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum future drift of a header timestamp, in seconds.
pub const MAX_TIME_OFFSET: u32 = 2 * 60 * 60;

/// Locator entries for a chain of height `top`: ten dense, then doubling,
/// genesis always last.
pub fn block_locator_size(top: u32) -> usize {
    let mut size = 10usize.min(top as usize + 1);
    let mut step = 1u32;
    let mut height = top.saturating_sub(10);
    while height > 0 {
        step = step.saturating_mul(2);
        size += 1;
        height = height.saturating_sub(step);
    }
    size + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_size_grows_logarithmically() {
        assert_eq!(block_locator_size(0), 2);
        assert!(block_locator_size(2000) <= 23);
        assert!(block_locator_size(800_000) <= 33);
    }
}
