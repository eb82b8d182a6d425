/// Rows in a public key set, one per key sixteenth.
pub const KEY_SIXTEENTHS: usize = 16;
/// Points in each row: the key sixteenth followed by the parts derived from it.
pub const ROW_LENGTH: usize = 4;
/// A key quarter is four consecutive rows.
pub const KEY_QUARTERS: usize = 4;
pub const SIXTEENTHS_PER_QUARTER: usize = KEY_SIXTEENTHS / KEY_QUARTERS;

pub const KEY_QUARTER_HOLDERS: usize = 4;
pub const KEY_SIXTEENTH_HOLDERS: usize = 16;

/// Other relays that must exist before holders can be assigned to a relay.
pub const MINIMUM_OTHER_RELAYS_FOR_ASSIGNMENT: usize =
    KEY_QUARTER_HOLDERS + 2 * KEY_SIXTEENTH_HOLDERS;
/// Of which this many must have joined after it.
pub const MINIMUM_LATER_JOINERS_FOR_ASSIGNMENT: usize = 3;

/// How long, in microseconds, a relay has to respond before it is presumed dead.
pub const RESPONSE_WAIT_TIME: u64 = 8_000_000;

/// How many relays must have joined after a departing relay for it to leave in good standing.
pub const GOOD_STANDING_AGE: u64 = 1440;

/// How many epochs an admission anchor may lag behind the latest one.
pub const ADMISSION_EPOCH_WINDOW: u64 = 3;

/// Draws from a hash chain before a deterministic choice gives up.
pub const MAX_SELECTION_ATTEMPTS: usize = 4096;

/// Messages a node holds back, waiting for a dependency or for the network
/// to catch up, before it starts dropping new ones.
pub const MAX_HELD_MESSAGES: usize = 1024;
