// JSON payloads carried in frame bodies and upload responses

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Destination for device status reports
pub const STATUS_DESTINATION: &str = "/app/device/status";

/// Destination for the post-handshake device registration
pub const REGISTER_DESTINATION: &str = "/app/device/register";

/// Private command queue for a device
pub fn command_destination(device_id: &str) -> String {
    format!("/queue/device/command/{}", device_id)
}

/// Remote command pushed by the backend in a MESSAGE frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    /// Open map so future commands can carry arguments this build ignores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl CommandPayload {
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// Status block reported to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub is_service_running: bool,
    /// Seconds between scheduled captures
    pub capture_interval: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_camera_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusUpdate {
    pub device_id: String,
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub device_id: String,
}

/// Upload response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoDto {
    pub photo_id: String,
    pub device_id: String,
    pub url: String,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_payload_without_details() {
        let payload = CommandPayload::from_json(r#"{"command":"take_picture"}"#).unwrap();
        assert_eq!(payload.command, "take_picture");
        assert!(payload.details.is_none());
    }

    #[test]
    fn test_command_payload_with_details() {
        let payload =
            CommandPayload::from_json(r#"{"command":"take_picture","details":{"camera":"1","burst":3}}"#)
                .unwrap();
        let details = payload.details.unwrap();
        assert_eq!(details.get("camera"), Some(&Value::String("1".into())));
        assert_eq!(details.get("burst"), Some(&Value::from(3)));
    }

    #[test]
    fn test_command_payload_malformed() {
        assert!(CommandPayload::from_json("{not json").is_err());
        assert!(CommandPayload::from_json(r#"{"details":{}}"#).is_err());
    }

    #[test]
    fn test_status_update_wire_shape() {
        let update = DeviceStatusUpdate {
            device_id: "dev-1".into(),
            status: DeviceStatus {
                is_service_running: true,
                capture_interval: 30,
                selected_camera_id: Some("0".into()),
            },
        };

        let json: Value = serde_json::to_value(&update).unwrap();
        assert_eq!(json["deviceId"], "dev-1");
        assert_eq!(json["status"]["isServiceRunning"], true);
        assert_eq!(json["status"]["captureInterval"], 30);
        assert_eq!(json["status"]["selectedCameraId"], "0");
    }

    #[test]
    fn test_status_omits_absent_camera() {
        let status = DeviceStatus {
            is_service_running: false,
            capture_interval: 5,
            selected_camera_id: None,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("selectedCameraId"));
    }

    #[test]
    fn test_command_destination() {
        assert_eq!(command_destination("abc"), "/queue/device/command/abc");
    }
}
