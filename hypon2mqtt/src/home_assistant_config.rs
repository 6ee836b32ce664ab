use serde::Serialize;

/// `DeviceConfig` is used to define the configuration for a Home Assistant device
/// in the MQTT discovery protocol and is used to group entities together.
///
#[derive(Serialize, Clone, Debug)]
pub struct DeviceConfig {
    pub name: String,
    model: String,
    pub identifiers: Vec<String>,
    manufacturer: String,
    sw_version: String, // Software version of the application that supplies the discovered MQTT item.
}

impl DeviceConfig {
    pub fn new(name: String, identifiers: Vec<String>) -> Self {
        Self {
            name,
            model: "Hypon Inverter".to_string(),
            identifiers,
            manufacturer: "Hypon".to_string(),
            // Rust compiler sets the CARGO_PKG_VERSION environment from the Cargo.toml .
            sw_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// `SensorConfig` is used to define the configuration for a Home Assistant sensor entity
/// in the MQTT discovery protocol.
///
/// More information about the MQTT discovery protocol can be found here:
/// https://www.home-assistant.io/docs/mqtt/discovery/
///
/// More information about the Home assistant sensor entities can be found here:
/// https://developers.home-assistant.io/docs/core/entity/sensor/
///
#[derive(Serialize, Clone, Debug)]
pub struct SensorConfig {
    pub unique_id: String,  //  A globally unique identifier for the sensor.
    name: String,           // The name of the sensor.
    state_topic: String,    // The MQTT topic where sensor readings will be published.
    value_template: String, // A template to extract a value from the mqtt message.
    device: DeviceConfig, // The device that the sensor belongs to, used to group entities together.
    availability_topic: String, // Where the bridge announces online/offline.
    payload_available: String,
    payload_not_available: String,
    // exclude optional if they are not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<String>, // The unit of measurement of the sensor.
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<String>, // The type/class of the sensor, e.g. energy, power, temperature, etc.
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<String>, // The type/class of the state, e.g. measurement, total_increasing, etc.
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<String>,
}

/// Where a sensor publishes and which device it belongs to.
pub struct SensorTopics<'a> {
    pub state_topic: &'a str,
    pub availability_topic: &'a str,
    pub device: &'a DeviceConfig,
}

impl SensorConfig {
    fn new_sensor(topics: &SensorTopics, key: &str, name: &str) -> Self {
        let value_template = format!("{{{{ value_json.{} }}}}", key);
        let unique_id = format!("{}_{}", topics.device.identifiers[0], key);
        SensorConfig {
            unique_id,
            name: name.to_string(),
            state_topic: topics.state_topic.to_string(),
            value_template,
            device: topics.device.clone(),
            availability_topic: topics.availability_topic.to_string(),
            payload_available: "online".to_string(),
            payload_not_available: "offline".to_string(),
            unit_of_measurement: None,
            device_class: None,
            state_class: None,
            icon: None,
        }
    }

    fn with(
        mut self,
        device_class: Option<&str>,
        unit_of_measurement: Option<&str>,
        state_class: Option<&str>,
    ) -> Self {
        self.device_class = device_class.map(str::to_string);
        self.unit_of_measurement = unit_of_measurement.map(str::to_string);
        self.state_class = state_class.map(str::to_string);
        self
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.to_string());
        self
    }

    pub fn count(topics: &SensorTopics, name: &str, key: &str) -> Self {
        Self::new_sensor(topics, key, name).with(None, None, Some("measurement"))
    }

    pub fn power(topics: &SensorTopics, name: &str, key: &str) -> Self {
        Self::new_sensor(topics, key, name).with(Some("power"), Some("W"), Some("measurement"))
    }

    pub fn energy(topics: &SensorTopics, name: &str, key: &str) -> Self {
        Self::new_sensor(topics, key, name).with(
            Some("energy"),
            Some("kWh"),
            Some("total_increasing"),
        )
    }

    pub fn battery(topics: &SensorTopics, name: &str, key: &str) -> Self {
        Self::new_sensor(topics, key, name).with(Some("battery"), Some("%"), Some("measurement"))
    }

    pub fn percentage(topics: &SensorTopics, name: &str, key: &str) -> Self {
        Self::new_sensor(topics, key, name).with(None, Some("%"), Some("measurement"))
    }

    pub fn amount(topics: &SensorTopics, name: &str, key: &str, unit: &str) -> Self {
        Self::new_sensor(topics, key, name).with(None, Some(unit), Some("total_increasing"))
    }

    pub fn monetary(topics: &SensorTopics, name: &str, key: &str) -> Self {
        Self::new_sensor(topics, key, name)
            .with(Some("monetary"), None, Some("total"))
            .with_icon("mdi:currency-usd")
    }
}
