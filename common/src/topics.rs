pub const TOPIC_SENSOR_CLIMATE: &str = "pico/sensor/temperaturenhumidity";
pub const TOPIC_NODE_STATUS: &str = "pico/node/status";
