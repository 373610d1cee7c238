//! Contracts shared by the search core and its collaborators.
//!
//! This crate owns the boundary types: the chess position wrapper (rules
//! delegated to shakmaty), the compact move encoding used by tree nodes,
//! value conventions, time controls, and the tablebase capability trait.
//! It deliberately contains no search logic.

pub mod moves;
pub mod position;
pub mod tablebase;
pub mod time;
pub mod value;

pub use moves::{policy_index, EncodedMove, MOVE_NONE, POLICY_SIZE};
pub use position::{ChessPosition, InputPlanes, PositionError, INPUT_PLANE_COUNT};
pub use tablebase::{NullTablebase, Tablebase, TablebaseVerdict, WdlBound};
pub use time::TimeControl;
pub use value::{
    flip_value, flip_value_across, value_to_centipawns, VALUE_DRAW, VALUE_LOSS, VALUE_WIN,
};

// Collaborators speak shakmaty types at the seam.
pub use shakmaty::{Color, Move, MoveList};
