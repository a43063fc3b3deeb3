//! MQTT transport for the command surface and the door latch.

mod endpoint;
pub mod mqtt;

pub use endpoint::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint};
pub use mqtt::{
    connect_mqtt, run_command_loop, CommandTopics, MqttDoorLock, MqttSettings,
    DEFAULT_TOPIC_PREFIX,
};
