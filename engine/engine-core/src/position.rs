//! The position boundary between the search core and the rules of chess.
//!
//! All legality questions are answered by shakmaty. This wrapper adds the
//! two things the search needs on top: a Zobrist fingerprint per reached
//! position, and Stockfish-style repetition distances computed from the
//! fingerprint history (shakmaty positions do not remember how they were
//! reached).

use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{CastlingMode, CastlingSide, Chess, Color, EnPassantMode, Move, MoveList, Role};
use shakmaty::Position as _;
use thiserror::Error;

use crate::moves::{policy_index, EncodedMove};

/// Number of input bitboard planes fed to the evaluator.
pub const INPUT_PLANE_COUNT: usize = 18;

/// Packed-bitboard network input: 12 piece planes, side to move, four
/// castling rights, en passant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPlanes {
    pub planes: [u64; INPUT_PLANE_COUNT],
}

impl Default for InputPlanes {
    fn default() -> Self {
        InputPlanes {
            planes: [0; INPUT_PLANE_COUNT],
        }
    }
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("invalid FEN: {0}")]
    InvalidFen(String),

    #[error("illegal move: {0}")]
    IllegalMove(String),

    #[error("invalid SAN: {0}")]
    InvalidSan(String),
}

#[derive(Clone, Copy)]
struct StateEntry {
    fingerprint: u64,
    halfmove_clock: u32,
    /// Plies back to the previous occurrence of this position inside the
    /// fifty-move window, 0 if none; negative when that earlier occurrence
    /// was itself a repetition (so this one is at least the third).
    repetition: i32,
}

/// A chess position plus the history needed for repetition detection.
///
/// Cloning is cheap enough to do once per MCTS simulation: shakmaty's
/// `Chess` is a flat value and the state history is one small entry per
/// played ply.
#[derive(Clone)]
pub struct ChessPosition {
    inner: Chess,
    states: Vec<StateEntry>,
}

impl ChessPosition {
    /// The standard starting position.
    pub fn new() -> Self {
        Self::from_inner(Chess::default())
    }

    pub fn from_fen(fen: &str) -> Result<Self, PositionError> {
        let parsed: Fen = fen
            .trim()
            .parse()
            .map_err(|_| PositionError::InvalidFen(fen.to_string()))?;
        let inner: Chess = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|_| PositionError::InvalidFen(fen.to_string()))?;
        Ok(Self::from_inner(inner))
    }

    fn from_inner(inner: Chess) -> Self {
        let mut position = ChessPosition {
            inner,
            states: Vec::with_capacity(64),
        };
        let entry = position.make_entry();
        position.states.push(entry);
        position
    }

    fn make_entry(&self) -> StateEntry {
        let Zobrist64(fingerprint) = self.inner.zobrist_hash::<Zobrist64>(EnPassantMode::Legal);
        let halfmove_clock = self.inner.halfmoves();
        let count = self.states.len();
        let mut repetition = 0i32;
        let mut back = 2usize;
        while back <= count && back as u32 <= halfmove_clock {
            let earlier = &self.states[count - back];
            if earlier.fingerprint == fingerprint {
                repetition = if earlier.repetition != 0 {
                    -(back as i32)
                } else {
                    back as i32
                };
                break;
            }
            back += 2;
        }
        StateEntry {
            fingerprint,
            halfmove_clock,
            repetition,
        }
    }

    pub fn legal_moves(&self) -> MoveList {
        self.inner.legal_moves()
    }

    pub fn apply_move(&mut self, m: &Move) {
        self.inner.play_unchecked(m);
        let entry = self.make_entry();
        self.states.push(entry);
    }

    /// Resolve an encoded move against this position and apply it.
    pub fn apply_encoded(&mut self, encoded: EncodedMove) -> Result<Move, PositionError> {
        let m = self
            .legal_moves()
            .iter()
            .find(|m| EncodedMove::encode(m) == encoded)
            .cloned()
            .ok_or_else(|| PositionError::IllegalMove(format!("{:#06x}", encoded.0)))?;
        self.apply_move(&m);
        Ok(m)
    }

    /// Resolve a UCI move token ("e2e4", "e7e8q") against the legal moves.
    pub fn parse_uci_move(&self, token: &str) -> Option<Move> {
        self.legal_moves()
            .iter()
            .find(|m| m.to_uci(CastlingMode::Standard).to_string() == token)
            .cloned()
    }

    pub fn move_to_uci(m: &Move) -> String {
        m.to_uci(CastlingMode::Standard).to_string()
    }

    pub fn parse_san(&self, s: &str) -> Result<Move, PositionError> {
        let san: San = s
            .parse()
            .map_err(|_| PositionError::InvalidSan(s.to_string()))?;
        san.to_move(&self.inner)
            .map_err(|_| PositionError::InvalidSan(s.to_string()))
    }

    pub fn fen(&self) -> String {
        Fen::from_position(self.inner.clone(), EnPassantMode::Legal).to_string()
    }

    #[inline]
    pub fn fingerprint(&self) -> u64 {
        self.states[self.states.len() - 1].fingerprint
    }

    #[inline]
    pub fn side_to_move(&self) -> Color {
        self.inner.turn()
    }

    #[inline]
    pub fn in_check(&self) -> bool {
        self.inner.is_check()
    }

    #[inline]
    pub fn halfmove_clock(&self) -> u32 {
        self.states[self.states.len() - 1].halfmove_clock
    }

    /// Plies back to the previous occurrence of the current position, 0 if
    /// unrepeated; negative for a threefold (see `StateEntry::repetition`).
    #[inline]
    pub fn repetition_distance(&self) -> i32 {
        self.states[self.states.len() - 1].repetition
    }

    /// Plies played from the initial position of this instance.
    #[inline]
    pub fn ply(&self) -> u32 {
        (self.states.len() - 1) as u32
    }

    /// Total men on the board, kings included.
    #[inline]
    pub fn piece_count(&self) -> u32 {
        u64::from(self.inner.board().occupied()).count_ones()
    }

    /// Non-pawn material of both sides in pawn units.
    pub fn non_pawn_material(&self) -> u32 {
        let board = self.inner.board();
        let count = |role: Role| u64::from(board.by_role(role)).count_ones();
        count(Role::Knight) * 3 + count(Role::Bishop) * 3 + count(Role::Rook) * 5
            + count(Role::Queen) * 9
    }

    /// How far into the endgame this position is, 0.0 (opening material)
    /// to 1.0 (bare kings and pawns).
    pub fn endgame_proportion(&self) -> f32 {
        const STARTING_NON_PAWN_MATERIAL: f32 = 62.0;
        (1.0 - self.non_pawn_material() as f32 / STARTING_NON_PAWN_MATERIAL).clamp(0.0, 1.0)
    }

    pub fn policy_index(&self, m: &Move) -> u16 {
        policy_index(m)
    }

    /// Fill the evaluator input planes for the current position.
    pub fn generate_image(&self, out: &mut InputPlanes) {
        let board = self.inner.board();
        let mut plane = 0;
        for color in [Color::White, Color::Black] {
            for role in [
                Role::Pawn,
                Role::Knight,
                Role::Bishop,
                Role::Rook,
                Role::Queen,
                Role::King,
            ] {
                out.planes[plane] = u64::from(board.by_color(color) & board.by_role(role));
                plane += 1;
            }
        }
        out.planes[12] = if self.inner.turn() == Color::Black {
            u64::MAX
        } else {
            0
        };
        let castles = self.inner.castles();
        let rights = [
            (Color::White, CastlingSide::KingSide),
            (Color::White, CastlingSide::QueenSide),
            (Color::Black, CastlingSide::KingSide),
            (Color::Black, CastlingSide::QueenSide),
        ];
        for (i, (color, side)) in rights.into_iter().enumerate() {
            out.planes[13 + i] = if castles.has(color, side) { u64::MAX } else { 0 };
        }
        out.planes[17] = self
            .inner
            .ep_square(EnPassantMode::Legal)
            .map(|sq| 1u64 << (sq as u32))
            .unwrap_or(0);
    }
}

impl Default for ChessPosition {
    fn default() -> Self {
        Self::new()
    }
}
