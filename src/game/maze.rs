//! Procedural maze: a grid of rooms whose walls never disconnect the grid

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fraction of the grid's room count used as the interior wall target
pub const WALL_DENSITY: f64 = 0.75;

/// Wall side of a room. Discriminants match the probe order used by the
/// generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    MinusX = 0,
    PlusX = 1,
    MinusY = 2,
    PlusY = 3,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::MinusX, Side::PlusX, Side::MinusY, Side::PlusY];

    pub fn from_index(index: usize) -> Side {
        Self::ALL[index % 4]
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::MinusX => Side::PlusX,
            Side::PlusX => Side::MinusX,
            Side::MinusY => Side::PlusY,
            Side::PlusY => Side::MinusY,
        }
    }

    /// (column, row) offset of the neighbouring room on this side
    pub fn offset(self) -> (isize, isize) {
        match self {
            Side::MinusX => (-1, 0),
            Side::PlusX => (1, 0),
            Side::MinusY => (0, -1),
            Side::PlusY => (0, 1),
        }
    }
}

/// One maze cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub plus_x: bool,
    pub minus_x: bool,
    pub plus_y: bool,
    pub minus_y: bool,
    pub num_walls: u8,
}

impl Room {
    pub fn has_wall(&self, side: Side) -> bool {
        match side {
            Side::MinusX => self.minus_x,
            Side::PlusX => self.plus_x,
            Side::MinusY => self.minus_y,
            Side::PlusY => self.plus_y,
        }
    }

    fn set_wall(&mut self, side: Side, present: bool) {
        match side {
            Side::MinusX => self.minus_x = present,
            Side::PlusX => self.plus_x = present,
            Side::MinusY => self.minus_y = present,
            Side::PlusY => self.plus_y = present,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MazeError {
    #[error("Maze step must be positive")]
    InvalidStep,

    #[error("Maze of {width}x{height} with step {step} has no rooms")]
    NoRooms { width: u32, height: u32, step: u32 },

    #[error("Maze has {rooms} rooms, cannot seat {vehicles} vehicles")]
    TooFewRooms { rooms: usize, vehicles: usize },
}

/// Rectangular grid of rooms, indexed `rooms[row][column]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Maze {
    pub width: u32,
    pub height: u32,
    pub step: u32,
    pub rooms_wide: usize,
    pub rooms_high: usize,
    pub rooms: Vec<Vec<Room>>,
}

impl Maze {
    /// Grid with only the border walls present
    pub fn open(width: u32, height: u32, step: u32) -> Result<Self, MazeError> {
        if step == 0 {
            return Err(MazeError::InvalidStep);
        }
        let rooms_wide = (width / step) as usize;
        let rooms_high = (height / step) as usize;
        if rooms_wide == 0 || rooms_high == 0 {
            return Err(MazeError::NoRooms { width, height, step });
        }

        let mut maze = Self {
            width,
            height,
            step,
            rooms_wide,
            rooms_high,
            rooms: vec![vec![Room::default(); rooms_wide]; rooms_high],
        };
        maze.reset_to_border();
        Ok(maze)
    }

    /// Build a fresh connected maze
    pub fn generate<R: Rng + ?Sized>(
        width: u32,
        height: u32,
        step: u32,
        rng: &mut R,
    ) -> Result<Self, MazeError> {
        let mut maze = Self::open(width, height, step)?;
        maze.create_walls(rng);
        Ok(maze)
    }

    pub fn room_count(&self) -> usize {
        self.rooms_wide * self.rooms_high
    }

    pub fn room(&self, column: usize, row: usize) -> Option<&Room> {
        self.rooms.get(row).and_then(|r| r.get(column))
    }

    /// Room containing a world position
    pub fn locate(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let step = f64::from(self.step);
        let column = (x / step) as usize;
        let row = (y / step) as usize;
        (column < self.rooms_wide && row < self.rooms_high).then_some((column, row))
    }

    /// Neighbour of (column, row) across `side`, if inside the grid
    pub fn neighbor(&self, column: usize, row: usize, side: Side) -> Option<(usize, usize)> {
        let (dc, dr) = side.offset();
        let column = column.checked_add_signed(dc)?;
        let row = row.checked_add_signed(dr)?;
        (column < self.rooms_wide && row < self.rooms_high).then_some((column, row))
    }

    /// Most interior walls a grid can hold while staying connected
    pub fn max_interior_walls(&self) -> usize {
        (self.rooms_wide - 1) * (self.rooms_high - 1)
    }

    /// Interior wall target for generation
    pub fn wall_target(&self) -> usize {
        let target = (self.room_count() as f64 * WALL_DENSITY).round() as usize;
        target.min(self.max_interior_walls())
    }

    fn reset_to_border(&mut self) {
        for row in self.rooms.iter_mut() {
            for room in row.iter_mut() {
                *room = Room::default();
            }
        }

        let (wide, high) = (self.rooms_wide, self.rooms_high);
        for column in 0..wide {
            self.add_border(column, 0, Side::MinusY);
            self.add_border(column, high - 1, Side::PlusY);
        }
        for row in 0..high {
            self.add_border(0, row, Side::MinusX);
            self.add_border(wide - 1, row, Side::PlusX);
        }
    }

    fn add_border(&mut self, column: usize, row: usize, side: Side) {
        let room = &mut self.rooms[row][column];
        room.set_wall(side, true);
        room.num_walls += 1;
    }

    /// Add random interior walls until the wall target is reached, keeping
    /// every room reachable from (0, 0).
    pub fn create_walls<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.reset_to_border();

        let target = self.wall_target();
        let mut placed = 0;
        while placed < target {
            let row = rng.gen_range(0..self.rooms_high);
            let column = rng.gen_range(0..self.rooms_wide);

            // A fourth wall would seal the room
            if self.rooms[row][column].num_walls >= 3 {
                continue;
            }

            let start = rng.gen_range(0..4);
            let Some(side) = (start..start + 4)
                .map(Side::from_index)
                .find(|side| !self.rooms[row][column].has_wall(*side))
            else {
                continue;
            };
            let Some((n_column, n_row)) = self.neighbor(column, row, side) else {
                continue;
            };

            self.rooms[row][column].set_wall(side, true);
            self.rooms[n_row][n_column].set_wall(side.opposite(), true);

            if self.is_connected() {
                self.rooms[row][column].num_walls += 1;
                self.rooms[n_row][n_column].num_walls += 1;
                placed += 1;
            } else {
                self.rooms[row][column].set_wall(side, false);
                self.rooms[n_row][n_column].set_wall(side.opposite(), false);
            }
        }
    }

    /// Flood fill from (0, 0) through open sides; true iff every room is reached
    pub fn is_connected(&self) -> bool {
        let mut visited = vec![vec![false; self.rooms_wide]; self.rooms_high];
        let mut stack = vec![(0usize, 0usize)];
        let mut reached = 0;

        while let Some((column, row)) = stack.pop() {
            if visited[row][column] {
                continue;
            }
            visited[row][column] = true;
            reached += 1;

            let room = &self.rooms[row][column];
            for side in Side::ALL {
                if room.has_wall(side) {
                    continue;
                }
                if let Some((c, r)) = self.neighbor(column, row, side) {
                    if !visited[r][c] {
                        stack.push((c, r));
                    }
                }
            }
        }

        reached == self.room_count()
    }

    /// Remove the wall on `side` of (column, row) and its mirror. Returns
    /// false when there is no wall or the side faces the border.
    pub fn remove_wall(&mut self, column: usize, row: usize, side: Side) -> bool {
        let Some((n_column, n_row)) = self.neighbor(column, row, side) else {
            return false;
        };
        if !self.rooms[row][column].has_wall(side) {
            return false;
        }

        let room = &mut self.rooms[row][column];
        room.set_wall(side, false);
        room.num_walls = room.num_walls.saturating_sub(1);

        let other = &mut self.rooms[n_row][n_column];
        other.set_wall(side.opposite(), false);
        other.num_walls = other.num_walls.saturating_sub(1);
        true
    }

    /// World-space center of a room
    pub fn room_center(&self, column: usize, row: usize) -> (f64, f64) {
        let step = f64::from(self.step);
        ((column as f64 + 0.5) * step, (row as f64 + 0.5) * step)
    }

    /// Interior walls currently present (each counted once)
    pub fn interior_wall_count(&self) -> usize {
        let mut count = 0;
        for row in 0..self.rooms_high {
            for column in 0..self.rooms_wide {
                let room = &self.rooms[row][column];
                if column + 1 < self.rooms_wide && room.plus_x {
                    count += 1;
                }
                if row + 1 < self.rooms_high && room.plus_y {
                    count += 1;
                }
            }
        }
        count
    }
}
