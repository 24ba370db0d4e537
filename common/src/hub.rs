use serde::Serialize;

/// Payloads and endpoints for the home-automation hub's REST API. The
/// runtimes own the actual POSTs; everything here is pure and testable.

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceCall<'a> {
    pub entity_id: &'a str,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BrightnessAttributes {
    pub unit_of_measurement: &'static str,
    pub state_class: &'static str,
    pub device_class: &'static str,
}

/// State update for the ambient-brightness entity.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BrightnessState {
    pub state: u32,
    pub attributes: BrightnessAttributes,
}

impl BrightnessState {
    pub fn illuminance(lux: u32) -> Self {
        Self {
            state: lux,
            attributes: BrightnessAttributes {
                unit_of_measurement: "lx",
                state_class: "measurement",
                device_class: "illuminance",
            },
        }
    }
}

pub fn service_url(base_url: &str, domain: &str, action: &str) -> String {
    format!(
        "{}/api/services/{domain}/{action}",
        base_url.trim_end_matches('/')
    )
}

pub fn state_url(base_url: &str, entity: &str) -> String {
    format!("{}/api/states/{entity}", base_url.trim_end_matches('/'))
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builds_service_and_state_urls() {
        assert_eq!(
            service_url("http://hub.local:8123/", "input_boolean", "turn_on"),
            "http://hub.local:8123/api/services/input_boolean/turn_on"
        );
        assert_eq!(
            state_url("http://hub.local:8123", "sensor.mobile_brightness_detector"),
            "http://hub.local:8123/api/states/sensor.mobile_brightness_detector"
        );
    }

    #[test]
    fn brightness_payload_shape() {
        let payload = serde_json::to_value(BrightnessState::illuminance(412)).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "state": 412,
                "attributes": {
                    "unit_of_measurement": "lx",
                    "state_class": "measurement",
                    "device_class": "illuminance"
                }
            })
        );
    }

    #[test]
    fn service_call_serializes_the_entity() {
        let body = serde_json::to_string(&ServiceCall {
            entity_id: "input_boolean.mobile_motion_sensor",
        })
        .unwrap();
        assert_eq!(body, r#"{"entity_id":"input_boolean.mobile_motion_sensor"}"#);
    }
}
