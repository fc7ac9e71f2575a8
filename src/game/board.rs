//! Board Definitions
//!
//! The fixed 3x3 grid, its cells and the two player symbols.
//! Positions are indices 0..=8, row-major from the top-left corner.

use serde::{Deserialize, Serialize};

/// Number of cells on the board.
pub const BOARD_CELLS: usize = 9;

/// The 8 winning triples: 3 rows, 3 columns, 2 diagonals.
pub const WIN_LINES: [[usize; 3]; 8] = [
    // Rows
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    // Columns
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    // Diagonals
    [0, 4, 8],
    [2, 4, 6],
];

// =============================================================================
// SYMBOL
// =============================================================================

/// Mark assigned to a participant. First entrant plays `X`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Symbol {
    /// First player.
    X,
    /// Second player.
    O,
}

impl Symbol {
    /// The symbol of the opposing player.
    pub fn opponent(self) -> Self {
        match self {
            Symbol::X => Symbol::O,
            Symbol::O => Symbol::X,
        }
    }
}

// =============================================================================
// CELL
// =============================================================================

/// A single board cell. Serializes as `""`, `"X"` or `"O"`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cell {
    /// Nobody has played here.
    #[default]
    #[serde(rename = "")]
    Empty,
    /// Holds `X`.
    X,
    /// Holds `O`.
    O,
}

impl Cell {
    /// Check if the cell is empty.
    #[inline]
    pub fn is_empty(self) -> bool {
        self == Cell::Empty
    }

    /// The symbol in this cell, if any.
    pub fn symbol(self) -> Option<Symbol> {
        match self {
            Cell::Empty => None,
            Cell::X => Some(Symbol::X),
            Cell::O => Some(Symbol::O),
        }
    }
}

impl From<Symbol> for Cell {
    fn from(symbol: Symbol) -> Self {
        match symbol {
            Symbol::X => Cell::X,
            Symbol::O => Cell::O,
        }
    }
}

// =============================================================================
// BOARD
// =============================================================================

/// The 3x3 grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Board([Cell; BOARD_CELLS]);

impl Board {
    /// Create an empty board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cell at `position`, or `None` if out of range.
    pub fn get(&self, position: usize) -> Option<Cell> {
        self.0.get(position).copied()
    }

    /// Write `symbol` into `position`.
    ///
    /// Callers validate range and emptiness first; the engine never
    /// overwrites an occupied cell.
    pub(crate) fn place(&mut self, position: usize, symbol: Symbol) {
        debug_assert!(self.0[position].is_empty());
        self.0[position] = Cell::from(symbol);
    }

    /// All cells in position order.
    pub fn cells(&self) -> &[Cell; BOARD_CELLS] {
        &self.0
    }

    /// Number of occupied cells.
    pub fn occupied(&self) -> usize {
        self.0.iter().filter(|c| !c.is_empty()).count()
    }

    /// Check if every cell is occupied.
    pub fn is_full(&self) -> bool {
        self.0.iter().all(|c| !c.is_empty())
    }

    /// Symbol holding a complete line, if any.
    pub fn winning_symbol(&self) -> Option<Symbol> {
        for [a, b, c] in WIN_LINES {
            let cell = self.0[a];
            if !cell.is_empty() && cell == self.0[b] && cell == self.0[c] {
                return cell.symbol();
            }
        }
        None
    }
}
