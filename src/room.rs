pub mod roster;
pub mod state;

pub use roster::{RoomSummary, RosterStore};
pub use state::{JoinOutcome, Room};
