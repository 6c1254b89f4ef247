use std::fmt;

/// Operating mode of the exclusive sensor.
///
/// Only one of `Enrolling` / `Authenticating` may be active; requests that
/// would start a second one are rejected while the sensor is not `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SensorState {
    #[default]
    Idle,
    Enrolling,
    Authenticating,
}

impl SensorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorState::Idle => "idle",
            SensorState::Enrolling => "enrolling",
            SensorState::Authenticating => "authenticating",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, SensorState::Idle)
    }
}

impl fmt::Display for SensorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
