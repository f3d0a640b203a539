use serde::{Deserialize, Serialize};

pub mod codec;

pub use codec::{encode, FrameDecoder, ProtocolError, MAX_FRAME_LEN};

pub const DEFAULT_PORT: u16 = 65444;
pub const PLACEHOLDER_NAME: &str = "Unnamed Player";

/// Every packet that crosses the wire, in either direction.
///
/// Clients only ever send `Event(Nick)` and `Event(Dir)`. The server answers
/// with a `Snapshot` every tick and a single `Event(Dead)` once the player's
/// snake is gone.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Event(Event),
    Snapshot(Snapshot),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Event {
    /// Rename the sending player.
    Nick(String),
    /// Steer the sending player's snake.
    Dir(Direction),
    /// Sent by the server with the final score when the player dies.
    Dead(u32),
}

/// Play-field metadata shared with clients. Fixed for the lifetime of a session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub version: u32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: u32,
    pub name: String,
    pub score: u32,
}

impl Player {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: PLACEHOLDER_NAME.to_string(),
            score: 0,
        }
    }
}

/// A unit step on the grid. Valid directions have exactly one nonzero
/// component, and that component is `-1` or `1`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Direction {
    pub dx: i8,
    pub dy: i8,
}

impl Direction {
    pub const UP: Direction = Direction { dx: 0, dy: -1 };
    pub const DOWN: Direction = Direction { dx: 0, dy: 1 };
    pub const LEFT: Direction = Direction { dx: -1, dy: 0 };
    pub const RIGHT: Direction = Direction { dx: 1, dy: 0 };

    /// Returns `None` unless `(dx, dy)` is one of the four unit vectors.
    pub fn new(dx: i8, dy: i8) -> Option<Self> {
        let direction = Self { dx, dy };
        direction.is_valid().then_some(direction)
    }

    pub fn is_valid(&self) -> bool {
        matches!((self.dx, self.dy), (0, -1) | (0, 1) | (-1, 0) | (1, 0))
    }

    pub fn opposite(&self) -> Self {
        Self {
            dx: -self.dx,
            dy: -self.dy,
        }
    }

    pub fn is_opposite(&self, other: &Direction) -> bool {
        self.opposite() == *other
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SnakeSegment {
    pub id: u32,
    /// Owning player's id.
    pub player: u32,
    pub index: u32,
    pub x: i32,
    pub y: i32,
    pub is_head: bool,
}

impl SnakeSegment {
    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Apple {
    pub id: u32,
    pub x: i32,
    pub y: i32,
}

impl Apple {
    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }
}

/// Anything that occupies a single cell of the play field.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Entity {
    SnakeSegment(SnakeSegment),
    Apple(Apple),
}

impl Entity {
    pub fn id(&self) -> u32 {
        match self {
            Entity::SnakeSegment(segment) => segment.id,
            Entity::Apple(apple) => apple.id,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        match self {
            Entity::SnakeSegment(segment) => segment.position(),
            Entity::Apple(apple) => apple.position(),
        }
    }
}

/// Full state of one session at one tick.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Snapshot {
    pub meta: ServerInfo,
    pub players: Vec<Player>,
    pub entities: Vec<Entity>,
}

impl Snapshot {
    pub fn apples(&self) -> impl Iterator<Item = &Apple> {
        self.entities.iter().filter_map(|entity| match entity {
            Entity::Apple(apple) => Some(apple),
            _ => None,
        })
    }

    pub fn segments_of(&self, player_id: u32) -> impl Iterator<Item = &SnakeSegment> {
        self.entities.iter().filter_map(move |entity| match entity {
            Entity::SnakeSegment(segment) if segment.player == player_id => Some(segment),
            _ => None,
        })
    }

    pub fn player(&self, player_id: u32) -> Option<&Player> {
        self.players.iter().find(|player| player.id == player_id)
    }
}
