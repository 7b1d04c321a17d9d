//! Puzzle board controller: maps pointer positions onto grid cells and
//! tracks the tile picked for the next swap.

use puzzle_proto::SwapRequest;

/// Side length the server renders puzzle images at.
pub const IMAGE_SIDE_PX: f64 = 512.0;

/// On-screen rectangle occupied by the puzzle image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Square image anchored at the origin.
    pub fn square(side: f64) -> Self {
        Self::new(0.0, 0.0, side, side)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerEvent {
    pub x: f64,
    pub y: f64,
}

/// Cell under the pointer, or `None` when the position falls outside the
/// grid (including exactly on the right/bottom edge).
pub fn cell_index(pointer: PointerEvent, bounds: Bounds, grid_size: usize) -> Option<usize> {
    if grid_size == 0 || bounds.width <= 0.0 || bounds.height <= 0.0 {
        return None;
    }
    let n = grid_size as f64;
    let column = ((pointer.x - bounds.left) / bounds.width * n).floor();
    let row = ((pointer.y - bounds.top) / bounds.height * n).floor();
    if !(0.0..n).contains(&column) || !(0.0..n).contains(&row) {
        return None;
    }
    Some(row as usize * grid_size + column as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
    /// Outside the grid, or a swap is still in flight.
    Ignored,
    /// First pick; the tile is shown dimmed.
    Selected(usize),
    /// Same tile picked twice; selection dropped without a swap.
    Deselected(usize),
    /// Two distinct tiles picked; swap them in click order.
    Swap(SwapRequest),
}

#[derive(Debug, Clone)]
pub struct BoardController {
    bounds: Bounds,
    grid_size: usize,
    selected: Option<usize>,
    pending: Option<SwapRequest>,
}

impl BoardController {
    pub fn new(bounds: Bounds) -> Self {
        Self {
            bounds,
            grid_size: 0,
            selected: None,
            pending: None,
        }
    }

    /// Arms the board for a freshly shuffled N×N grid.
    pub fn enable(&mut self, grid_size: usize) {
        self.grid_size = grid_size;
        self.selected = None;
        self.pending = None;
    }

    pub fn reset(&mut self) {
        self.enable(0);
    }

    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    pub fn cell_count(&self) -> usize {
        self.grid_size * self.grid_size
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn pending(&self) -> Option<SwapRequest> {
        self.pending
    }

    pub fn click(&mut self, pointer: PointerEvent) -> ClickOutcome {
        match cell_index(pointer, self.bounds, self.grid_size) {
            Some(index) => self.select_cell(index),
            None => ClickOutcome::Ignored,
        }
    }

    /// Picks a cell by index, as if its centre had been clicked.
    pub fn select_cell(&mut self, index: usize) -> ClickOutcome {
        if self.pending.is_some() || index >= self.cell_count() {
            return ClickOutcome::Ignored;
        }
        match self.selected.take() {
            None => {
                self.selected = Some(index);
                ClickOutcome::Selected(index)
            }
            Some(first) if first == index => ClickOutcome::Deselected(index),
            Some(first) => {
                let request = SwapRequest {
                    index1: first,
                    index2: index,
                };
                self.pending = Some(request);
                ClickOutcome::Swap(request)
            }
        }
    }

    /// Called once the swap reply (or failure) arrives.
    pub fn finish_swap(&mut self) -> Option<SwapRequest> {
        self.selected = None;
        self.pending.take()
    }
}
