use crate::error::ServerError;
use shared::ServerInfo;
use std::time::Duration;

/// Parameters every session is created with. Built once by the process entry
/// point and shared read-only by all sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub name: String,
    pub version: u32,
    pub width: i32,
    pub height: i32,
    /// Ticks per second.
    pub tick_rate: u32,
    pub max_players: usize,
    /// Length of a freshly spawned snake.
    pub starting_segments: usize,
    /// Number of apples kept on the field.
    pub apple_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "SnekBox".to_string(),
            version: 0,
            width: 128,
            height: 32,
            tick_rate: 15,
            max_players: 5,
            starting_segments: 10,
            apple_count: 1,
        }
    }
}

impl SessionConfig {
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: self.name.clone(),
            version: self.version,
            width: self.width,
            height: self.height,
        }
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.tick_rate == 0 {
            return Err(ServerError::Config("tick rate must be positive".into()));
        }
        if self.max_players == 0 {
            return Err(ServerError::Config("max players must be positive".into()));
        }
        if self.width < 4 || self.height < 4 {
            return Err(ServerError::Config(format!(
                "play field {}x{} is too small",
                self.width, self.height
            )));
        }
        if self.starting_segments == 0 {
            return Err(ServerError::Config(
                "snakes need at least one segment".into(),
            ));
        }
        // The tail sits at x = 1 and the head must stay clear of the right wall.
        if self.starting_segments as i32 >= self.width - 1 {
            return Err(ServerError::Config(format!(
                "a snake of {} segments does not fit in a field {} cells wide",
                self.starting_segments, self.width
            )));
        }
        Ok(())
    }
}
