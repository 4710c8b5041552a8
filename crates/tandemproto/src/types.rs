//! Identifier and capability types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identity of a sensor node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a recording session.
///
/// Time-derived so that ids sort by creation time; the random suffix keeps
/// two sessions armed within the same millisecond apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Generate a new unique session ID
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let random = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("session-{}-{}", stamp, &random[..8]))
    }

    /// Safe to use as a single path component.
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && self.0 != "."
            && self.0 != ".."
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of sensor a node can declare in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Camera,
    Thermal,
    /// Galvanic skin response
    Gsr,
    /// Photoplethysmography
    Ppg,
    Audio,
    Imu,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Camera => "camera",
            SensorKind::Thermal => "thermal",
            SensorKind::Gsr => "gsr",
            SensorKind::Ppg => "ppg",
            SensorKind::Audio => "audio",
            SensorKind::Imu => "imu",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown sensor kind: {0}")]
pub struct UnknownSensorKind(pub String);

impl FromStr for SensorKind {
    type Err = UnknownSensorKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Ok(SensorKind::Camera),
            "thermal" => Ok(SensorKind::Thermal),
            "gsr" => Ok(SensorKind::Gsr),
            "ppg" => Ok(SensorKind::Ppg),
            "audio" => Ok(SensorKind::Audio),
            "imu" => Ok(SensorKind::Imu),
            other => Err(UnknownSensorKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_path_safe() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("session-"));
        assert!(a.is_path_safe());
    }

    #[test]
    fn traversal_is_not_path_safe() {
        assert!(!SessionId::new("..").is_path_safe());
        assert!(!SessionId::new("a/b").is_path_safe());
        assert!(!SessionId::new("").is_path_safe());
    }

    #[test]
    fn sensor_kind_parse() {
        assert_eq!("Thermal".parse::<SensorKind>().unwrap(), SensorKind::Thermal);
        assert_eq!(" ppg ".parse::<SensorKind>().unwrap(), SensorKind::Ppg);
        assert!("lidar".parse::<SensorKind>().is_err());
    }
}
