/// Number of out-of-order blocks the receive reassembler keeps, which is also
/// the number of holes the SACK scoreboard tracks on the send side.
pub const ASSEMBLER_MAX_SEGMENT_COUNT: usize = 4;

/// Number of SACK blocks carried by one segment. Four blocks and the two
/// aligning NOPs take 36 of the 40 option octets.
pub const SACK_MAX_BLOCK_COUNT: usize = 4;

/// Default size of the send and receive rings of a connection, in octets.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default number of connections a listener queues when no backlog is given.
pub const DEFAULT_BACKLOG: usize = 5;
