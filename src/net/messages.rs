// JSON message type definitions
// Handshake, stream subscription and per-tick stream messages

use nalgebra::{Matrix4, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::MalformedTickError;
use crate::pose::{Pose, Register, ToolReading, TrackingTick};

/// Handshake status value meaning the session was granted.
pub const STATUS_OK: &str = "ok";

/// Capability negotiation request: which tools, at what rate, for which case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub case_id: String,
    pub tools: Vec<String>,
    pub frequency_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HandshakeResponse {
    pub fn granted(stream_address: String, session_id: String) -> Self {
        HandshakeResponse {
            status: STATUS_OK.to_string(),
            stream_address: Some(stream_address),
            session_id: Some(session_id),
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        HandshakeResponse {
            status: "error".to_string(),
            stream_address: None,
            session_id: None,
            reason: Some(reason.into()),
        }
    }
}

/// Commands a client sends on the stream channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    /// First line on a new stream connection
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Move the simulated motion center (mm)
    SetCenter { center: [f64; 3] },
}

/// Messages received on the stream channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    /// Greeting sent once when the stream opens
    Connection {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<String>,
    },

    Tick(TickMessage),

    /// Any other message type; ignored
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickMessage {
    pub timestamp: f64,
    pub frame_number: u64,
    pub tools: BTreeMap<String, ToolMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMessage {
    pub visible: bool,
    pub quality_score: f64,
    pub pose: PoseMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoseMessage {
    pub position_mm: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_deg: Option<[f64; 3]>,
    /// Row-major
    #[serde(default, rename = "matrix4x4", skip_serializing_if = "Option::is_none")]
    pub matrix: Option<[[f64; 4]; 4]>,
}

fn check_finite<'a>(
    values: impl IntoIterator<Item = &'a f64>,
    what: &str,
    tool: &str,
) -> Result<(), MalformedTickError> {
    if values.into_iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(MalformedTickError::Invalid(format!("{what} of tool {tool} is not finite")))
    }
}

impl TickMessage {
    /// Validate and convert into a register-frame tick
    pub fn into_tick(self) -> Result<TrackingTick, MalformedTickError> {
        if !self.timestamp.is_finite() {
            return Err(MalformedTickError::Invalid("timestamp is not finite".to_string()));
        }

        let mut tick = TrackingTick::new(self.frame_number, self.timestamp);
        for (name, tool) in self.tools {
            if !(0.0..=1.0).contains(&tool.quality_score) {
                return Err(MalformedTickError::Invalid(format!(
                    "quality score {} of tool {name} is outside [0, 1]",
                    tool.quality_score
                )));
            }
            check_finite(&tool.pose.position_mm, "position", &name)?;

            let mut pose = Pose::<Register>::from_array(tool.pose.position_mm);
            if let Some(rot) = tool.pose.rotation_deg {
                check_finite(&rot, "rotation", &name)?;
                pose = pose.with_rotation(Vector3::from(rot));
            }
            if let Some(rows) = tool.pose.matrix {
                check_finite(rows.iter().flatten(), "matrix", &name)?;
                pose = pose.with_matrix(Matrix4::from_fn(|r, c| rows[r][c]));
            }

            tick.tools.insert(
                name,
                ToolReading {
                    pose,
                    visible: tool.visible,
                    quality_score: tool.quality_score,
                },
            );
        }
        Ok(tick)
    }

    pub fn from_tick(tick: &TrackingTick) -> Self {
        let tools = tick
            .tools
            .iter()
            .map(|(name, reading)| {
                let pose = &reading.pose;
                let message = ToolMessage {
                    visible: reading.visible,
                    quality_score: reading.quality_score,
                    pose: PoseMessage {
                        position_mm: pose.position_array(),
                        rotation_deg: pose.rotation_deg.map(|r| [r.x, r.y, r.z]),
                        matrix: pose
                            .matrix
                            .map(|m| std::array::from_fn(|r| std::array::from_fn(|c| m[(r, c)]))),
                    },
                };
                (name.clone(), message)
            })
            .collect();

        TickMessage {
            timestamp: tick.timestamp,
            frame_number: tick.frame_number,
            tools,
        }
    }
}

/// Parse one stream line. `Ok(None)` for non-tick messages.
pub fn parse_stream_line(line: &str) -> Result<Option<TrackingTick>, MalformedTickError> {
    match serde_json::from_str::<StreamMessage>(line)? {
        StreamMessage::Tick(tick) => tick.into_tick().map(Some),
        StreamMessage::Connection { .. } | StreamMessage::Unknown => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: &str = r#"{
        "type": "tick",
        "timestamp": 1700000000.25,
        "frameNumber": 42,
        "tools": {
            "pointer": {
                "visible": true,
                "qualityScore": 0.93,
                "pose": {
                    "positionMm": [75.2, 0.1, -20.0],
                    "rotationDeg": [0.0, 15.0, 90.0],
                    "matrix4x4": [[1,0,0,75.2],[0,1,0,0.1],[0,0,1,-20.0],[0,0,0,1]]
                }
            },
            "reference": {
                "visible": false,
                "qualityScore": 0.0,
                "pose": { "positionMm": [0, 0, 0] }
            }
        }
    }"#;

    #[test]
    fn test_parse_tick() {
        let tick = parse_stream_line(TICK).unwrap().unwrap();
        assert_eq!(tick.frame_number, 42);
        assert_eq!(tick.timestamp, 1700000000.25);
        assert_eq!(tick.tools.len(), 2);

        let pointer = tick.tool("pointer").unwrap();
        assert!(pointer.visible);
        assert_eq!(pointer.pose.position_array(), [75.2, 0.1, -20.0]);
        assert_eq!(pointer.pose.rotation_deg, Some(Vector3::new(0.0, 15.0, 90.0)));
        assert_eq!(pointer.pose.matrix.unwrap()[(0, 3)], 75.2);

        let reference = tick.tool("reference").unwrap();
        assert!(!reference.visible);
        assert!(reference.pose.rotation_deg.is_none());
        assert!(reference.pose.matrix.is_none());
    }

    #[test]
    fn test_connection_and_unknown_are_not_ticks() {
        let greeting = r#"{"type":"connection","status":"connected","server":"sim"}"#;
        assert!(parse_stream_line(greeting).unwrap().is_none());
        assert!(parse_stream_line(r#"{"type":"pong","timestamp":1.0}"#).unwrap().is_none());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(parse_stream_line("{not json"), Err(MalformedTickError::Json(_))));
        assert!(matches!(parse_stream_line(r#"{"frameNumber": 1}"#), Err(MalformedTickError::Json(_))));

        let missing_pose = r#"{"type":"tick","timestamp":1.0,"frameNumber":1,
            "tools":{"pointer":{"visible":true,"qualityScore":0.5}}}"#;
        assert!(matches!(parse_stream_line(missing_pose), Err(MalformedTickError::Json(_))));

        let bad_quality = r#"{"type":"tick","timestamp":1.0,"frameNumber":1,
            "tools":{"pointer":{"visible":true,"qualityScore":1.5,"pose":{"positionMm":[0,0,0]}}}}"#;
        assert!(matches!(parse_stream_line(bad_quality), Err(MalformedTickError::Invalid(_))));
    }

    #[test]
    fn test_tick_message_from_tick() {
        let tick = parse_stream_line(TICK).unwrap().unwrap();
        let json = serde_json::to_string(&StreamMessage::Tick(TickMessage::from_tick(&tick))).unwrap();
        assert!(json.contains("\"type\":\"tick\""));
        assert!(json.contains("\"frameNumber\":42"));
        assert!(json.contains("\"matrix4x4\""));
        assert_eq!(parse_stream_line(&json).unwrap().unwrap(), tick);
    }

    #[test]
    fn test_handshake_wire_format() {
        let req = HandshakeRequest {
            case_id: "case-7".to_string(),
            tools: vec!["pointer".to_string()],
            frequency_hz: 100.0,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"caseId":"case-7","tools":["pointer"],"frequencyHz":100.0}"#);

        let resp: HandshakeResponse =
            serde_json::from_str(r#"{"streamAddress":"127.0.0.1:9000","sessionId":"s1","status":"ok"}"#).unwrap();
        assert_eq!(resp, HandshakeResponse::granted("127.0.0.1:9000".into(), "s1".into()));

        let denied = serde_json::to_string(&HandshakeResponse::denied("no tools")).unwrap();
        assert_eq!(denied, r#"{"status":"error","reason":"no tools"}"#);
    }

    #[test]
    fn test_subscribe_command() {
        let cmd = ClientCommand::Subscribe { session_id: "s1".to_string() };
        assert_eq!(serde_json::to_string(&cmd).unwrap(), r#"{"command":"subscribe","sessionId":"s1"}"#);

        let cmd: ClientCommand = serde_json::from_str(r#"{"command":"set_center","center":[1,2.5,-3]}"#).unwrap();
        assert_eq!(cmd, ClientCommand::SetCenter { center: [1.0, 2.5, -3.0] });
        assert!(serde_json::from_str::<ClientCommand>(r#"{"command":"set_center","center":[1,2]}"#).is_err());
    }
}
