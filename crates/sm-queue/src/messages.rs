use serde_json::{json, Value};

/// Build the payload for an outbound command queue row.
pub fn create_command_message(command_type: &str, parameters: Value) -> Value {
    json!({
        "command_type": command_type,
        "parameters": parameters,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_message_shape() {
        let msg = create_command_message("reboot_system", json!({}));
        assert_eq!(msg["command_type"], "reboot_system");
        assert!(msg["parameters"].is_object());
        assert!(msg["timestamp"].is_string());
    }
}
