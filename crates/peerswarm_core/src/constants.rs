/// Default size of a block, the unit actually requested from peers.
pub const BLOCK_SIZE: u32 = 16384;
