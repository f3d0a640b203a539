//! Authoritative snake simulation for a single session.
//!
//! `GameState` knows nothing about sockets or time. The session drives it one
//! tick at a time and turns the outcome into network traffic.

use crate::config::SessionConfig;
use crate::error::ServerError;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{Apple, Direction, Entity, Player, ServerInfo, SnakeSegment, Snapshot};
use std::collections::HashSet;

/// Random candidates tried before apple placement gives up with `NoSpace`.
pub const MAX_PLACEMENT_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeathCause {
    Wall,
    SelfCollision,
    Collision { with: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Death {
    pub player: Player,
    pub cause: DeathCause,
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub deaths: Vec<Death>,
    pub apples_eaten: usize,
}

#[derive(Debug, Clone)]
pub struct Snake {
    pub player: Player,
    /// Head first. Never empty.
    pub segments: Vec<SnakeSegment>,
    pub direction: Direction,
    pub pending_direction: Option<Direction>,
}

impl Snake {
    pub fn head(&self) -> &SnakeSegment {
        &self.segments[0]
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn occupies(&self, position: (i32, i32)) -> bool {
        self.segments.iter().any(|s| s.position() == position)
    }

    /// Moves every segment onto its predecessor's pre-move cell, then steps the head.
    fn advance(&mut self) {
        let previous: Vec<(i32, i32)> = self.segments.iter().map(SnakeSegment::position).collect();

        for (segment, &(x, y)) in self.segments.iter_mut().skip(1).zip(previous.iter()) {
            segment.x = x;
            segment.y = y;
        }

        let head = &mut self.segments[0];
        head.x += self.direction.dx as i32;
        head.y += self.direction.dy as i32;
    }

    /// Stacks a new segment on the tail. The next `advance` leaves it behind
    /// on that cell while the old tail moves on.
    fn grow(&mut self, segment_id: u32) {
        let (x, y) = self.segments[self.segments.len() - 1].position();
        self.segments.push(SnakeSegment {
            id: segment_id,
            player: self.player.id,
            index: self.segments.len() as u32,
            x,
            y,
            is_head: false,
        });
    }
}

#[derive(Debug)]
pub struct GameState {
    pub tick: u64,
    info: ServerInfo,
    starting_segments: usize,
    apple_count: usize,
    snakes: Vec<Snake>,
    apples: Vec<Apple>,
    next_entity_id: u32,
    rng: StdRng,
}

impl GameState {
    pub fn new(config: &SessionConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: &SessionConfig, rng: StdRng) -> Self {
        Self {
            tick: 0,
            info: config.server_info(),
            starting_segments: config.starting_segments,
            apple_count: config.apple_count,
            snakes: Vec::new(),
            apples: Vec::new(),
            next_entity_id: 1,
            rng,
        }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    pub fn snakes(&self) -> &[Snake] {
        &self.snakes
    }

    pub fn snake(&self, player_id: u32) -> Option<&Snake> {
        self.snakes.iter().find(|s| s.player.id == player_id)
    }

    pub fn apples(&self) -> &[Apple] {
        &self.apples
    }

    pub fn player_count(&self) -> usize {
        self.snakes.len()
    }

    pub fn contains(&self, player_id: u32) -> bool {
        self.snake(player_id).is_some()
    }

    /// Spawns a horizontal snake heading right in the first interior row with room for it.
    pub fn add_player(&mut self, player: Player) -> Result<(), ServerError> {
        let length = self.starting_segments as i32;
        let occupied = self.occupied_cells();

        let row = (1..self.info.height - 1)
            .find(|&y| (1..=length).all(|x| !occupied.contains(&(x, y))))
            .ok_or(ServerError::NoSpace {
                attempts: (self.info.height - 2).max(0) as usize,
            })?;

        // Head at x = length, tail at x = 1.
        let positions: Vec<(i32, i32)> = (0..length).map(|i| (length - i, row)).collect();
        info!(
            "Added player {} ({}) with head at ({}, {})",
            player.id, player.name, length, row
        );
        self.insert_snake(player, &positions, Direction::RIGHT);
        self.top_up_apples();
        Ok(())
    }

    fn insert_snake(&mut self, player: Player, positions: &[(i32, i32)], direction: Direction) {
        let segments = positions
            .iter()
            .enumerate()
            .map(|(index, &(x, y))| SnakeSegment {
                id: self.allocate_entity_id(),
                player: player.id,
                index: index as u32,
                x,
                y,
                is_head: index == 0,
            })
            .collect::<Vec<_>>();

        self.snakes.push(Snake {
            player,
            segments,
            direction,
            pending_direction: None,
        });
    }

    pub fn remove_player(&mut self, player_id: u32) -> Option<Player> {
        let index = self.snakes.iter().position(|s| s.player.id == player_id)?;
        let snake = self.snakes.remove(index);
        info!("Removed player {}", player_id);
        Some(snake.player)
    }

    pub fn set_nickname(&mut self, player_id: u32, name: String) -> bool {
        match self.snakes.iter_mut().find(|s| s.player.id == player_id) {
            Some(snake) => {
                debug!("Player {} renamed to {:?}", player_id, name);
                snake.player.name = name;
                true
            }
            None => false,
        }
    }

    /// Queues a heading change for the next tick. Reversals onto the neck and
    /// non-unit vectors are refused.
    pub fn set_direction(&mut self, player_id: u32, direction: Direction) -> bool {
        if !direction.is_valid() {
            return false;
        }

        match self.snakes.iter_mut().find(|s| s.player.id == player_id) {
            Some(snake) if !direction.is_opposite(&snake.direction) => {
                snake.pending_direction = Some(direction);
                true
            }
            _ => false,
        }
    }

    /// Advances the simulation by one tick.
    pub fn tick(&mut self) -> TickOutcome {
        self.tick += 1;
        let mut outcome = TickOutcome::default();

        for snake in &mut self.snakes {
            if let Some(direction) = snake.pending_direction.take() {
                snake.direction = direction;
            }
        }

        for snake in &mut self.snakes {
            snake.advance();
        }

        // Every snake has moved; judge all of them against the same positions.
        let mut dead = Vec::new();
        for snake in &self.snakes {
            if let Some(cause) = self.collision_for(snake) {
                dead.push((snake.player.id, cause));
            }
        }

        for (player_id, cause) in dead {
            if let Some(index) = self.snakes.iter().position(|s| s.player.id == player_id) {
                let snake = self.snakes.remove(index);
                info!(
                    "Player {} died ({:?}) with score {}",
                    player_id, cause, snake.player.score
                );
                outcome.deaths.push(Death {
                    player: snake.player,
                    cause,
                });
            }
        }

        for index in 0..self.snakes.len() {
            let head = self.snakes[index].head().position();
            let Some(apple_index) = self.apples.iter().position(|a| a.position() == head) else {
                continue;
            };

            self.apples.remove(apple_index);
            let segment_id = self.allocate_entity_id();
            let snake = &mut self.snakes[index];
            snake.player.score += 1;
            snake.grow(segment_id);
            outcome.apples_eaten += 1;
            debug!(
                "Player {} ate an apple at ({}, {}), score {}",
                snake.player.id, head.0, head.1, snake.player.score
            );

            if let Err(e) = self.spawn_apple() {
                warn!("Could not replace eaten apple: {}", e);
            }
        }

        self.top_up_apples();
        debug_assert!(self.validate_snakes().is_ok());

        outcome
    }

    fn collision_for(&self, snake: &Snake) -> Option<DeathCause> {
        let (x, y) = snake.head().position();

        if x <= 0 || x >= self.info.width - 1 || y <= 0 || y >= self.info.height - 1 {
            return Some(DeathCause::Wall);
        }

        if snake.segments[1..].iter().any(|s| s.position() == (x, y)) {
            return Some(DeathCause::SelfCollision);
        }

        self.snakes
            .iter()
            .filter(|other| other.player.id != snake.player.id)
            .find(|other| other.occupies((x, y)))
            .map(|other| DeathCause::Collision {
                with: other.player.id,
            })
    }

    fn occupied_cells(&self) -> HashSet<(i32, i32)> {
        self.snakes
            .iter()
            .flat_map(|s| s.segments.iter().map(SnakeSegment::position))
            .chain(self.apples.iter().map(Apple::position))
            .collect()
    }

    /// Places an apple on a random free interior cell, giving up after
    /// `MAX_PLACEMENT_ATTEMPTS` occupied candidates.
    pub fn spawn_apple(&mut self) -> Result<Apple, ServerError> {
        let occupied = self.occupied_cells();

        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let x = self.rng.gen_range(1..self.info.width - 1);
            let y = self.rng.gen_range(1..self.info.height - 1);
            if !occupied.contains(&(x, y)) {
                return Ok(self.place_apple(x, y));
            }
        }

        Err(ServerError::NoSpace {
            attempts: MAX_PLACEMENT_ATTEMPTS,
        })
    }

    /// Puts an apple at an exact cell without any occupancy check.
    pub fn place_apple(&mut self, x: i32, y: i32) -> Apple {
        let apple = Apple {
            id: self.allocate_entity_id(),
            x,
            y,
        };
        debug!("Spawned apple {} at ({}, {})", apple.id, x, y);
        self.apples.push(apple.clone());
        apple
    }

    fn top_up_apples(&mut self) {
        while self.apples.len() < self.apple_count {
            if let Err(e) = self.spawn_apple() {
                debug!("Apple top-up stopped: {}", e);
                break;
            }
        }
    }

    fn allocate_entity_id(&mut self) -> u32 {
        let id = self.next_entity_id;
        self.next_entity_id += 1;
        id
    }

    pub fn snapshot(&self) -> Snapshot {
        let entities = self
            .snakes
            .iter()
            .flat_map(|s| s.segments.iter().cloned().map(Entity::SnakeSegment))
            .chain(self.apples.iter().cloned().map(Entity::Apple))
            .collect();

        Snapshot {
            meta: self.info.clone(),
            players: self.snakes.iter().map(|s| s.player.clone()).collect(),
            entities,
        }
    }

    /// Checks the per-snake invariants: one head at index 0, contiguous
    /// indices, correct owner, and no two segments on the same cell except a
    /// freshly grown tail still stacked on the one before it.
    pub fn validate_snakes(&self) -> Result<(), String> {
        for snake in &self.snakes {
            let id = snake.player.id;
            if snake.segments.is_empty() {
                return Err(format!("snake {} has no segments", id));
            }

            let mut cells = HashSet::new();
            for (index, segment) in snake.segments.iter().enumerate() {
                if segment.index as usize != index {
                    return Err(format!("snake {} segment {} has index {}", id, index, segment.index));
                }
                if segment.is_head != (index == 0) {
                    return Err(format!("snake {} has a misplaced head at {}", id, index));
                }
                if segment.player != id {
                    return Err(format!("snake {} owns a segment of {}", id, segment.player));
                }
                let stacked_tail = index + 1 == snake.segments.len()
                    && index > 0
                    && snake.segments[index - 1].position() == segment.position();
                if !cells.insert(segment.position()) && !stacked_tail {
                    return Err(format!(
                        "snake {} overlaps itself at ({}, {})",
                        id, segment.x, segment.y
                    ));
                }
            }
        }
        Ok(())
    }
}
