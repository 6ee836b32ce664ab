use crate::home_assistant_config::{DeviceConfig, SensorConfig, SensorTopics};
use crate::mqtt_wrapper::{MqttWrapper, QoS};

use log::{debug, error};

/// Topics and naming shared by all discovery messages of one bridge.
#[derive(Clone, Debug)]
pub struct Discovery {
    pub prefix: String,
    pub base_topic: String,
    pub availability_topic: String,
    pub device_name: String,
}

impl Discovery {
    /// Topic Home Assistant announces itself on after a restart.
    pub fn birth_topic(&self) -> String {
        format!("{}/status", self.prefix)
    }

    pub fn is_birth_message(&self, topic: &str, payload: &[u8]) -> bool {
        topic == self.birth_topic() && payload == b"online"
    }

    /// Discovery topic and payload for every field a merged record of
    /// `system_id` may carry.
    pub fn messages(&self, system_id: &str) -> Vec<(String, SensorConfig)> {
        let node_id = format!("hypon_{system_id}");
        let device = DeviceConfig::new(
            format!("{} {}", self.device_name, system_id),
            Vec::from([node_id.clone()]),
        );
        let state_topic = format!("{}/{}", self.base_topic, system_id);
        let topics = SensorTopics {
            state_topic: &state_topic,
            availability_topic: &self.availability_topic,
            device: &device,
        };

        sensor_configs(&topics)
            .into_iter()
            .map(|(key, sensor)| {
                let topic = format!("{}/sensor/{node_id}/{key}/config", self.prefix);
                (topic, sensor)
            })
            .collect()
    }

    /// Publishes the retained discovery messages of one system.
    pub fn publish<M: MqttWrapper>(&self, client: &mut M, system_id: &str) {
        // configs let home assistant know what sensors are available and where to find them
        for (topic, sensor) in self.messages(system_id) {
            let payload = match serde_json::to_string(&sensor) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize discovery for {}: {e}", sensor.unique_id);
                    continue;
                }
            };
            debug!("Publishing discovery to {topic}");
            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, true, payload) {
                error!("Failed to publish discovery message: {e:?}");
            }
        }
    }
}

// when modifying the merged fields, modify this table accordingly
fn sensor_configs(topics: &SensorTopics) -> Vec<(&'static str, SensorConfig)> {
    Vec::from([
        (
            "percent",
            SensorConfig::percentage(topics, "Capacity Percentage", "percent")
                .with_icon("mdi:percent"),
        ),
        ("w_cha", SensorConfig::power(topics, "Charging Power", "w_cha")),
        ("power_pv", SensorConfig::power(topics, "PV Power", "power_pv")),
        ("soc", SensorConfig::battery(topics, "State of Charge", "soc")),
        ("meter_power", SensorConfig::power(topics, "Meter Power", "meter_power")),
        ("power_load", SensorConfig::power(topics, "Power Load", "power_load")),
        (
            "micro",
            SensorConfig::count(topics, "Microinverters", "micro").with_icon("mdi:chip"),
        ),
        (
            "today_generation",
            SensorConfig::energy(topics, "Today Generation", "today_generation"),
        ),
        (
            "month_generation",
            SensorConfig::energy(topics, "Month Generation", "month_generation"),
        ),
        (
            "year_generation",
            SensorConfig::energy(topics, "Year Generation", "year_generation"),
        ),
        (
            "total_generation",
            SensorConfig::energy(topics, "Total Generation", "total_generation"),
        ),
        (
            "co2",
            SensorConfig::amount(topics, "CO2 Saved", "co2", "kg").with_icon("mdi:molecule-co2"),
        ),
        (
            "tree",
            SensorConfig::amount(topics, "Trees Planted", "tree", "trees").with_icon("mdi:tree"),
        ),
        (
            "diesel",
            SensorConfig::amount(topics, "Diesel Saved", "diesel", "L").with_icon("mdi:barrel"),
        ),
        (
            "today_revenue",
            SensorConfig::monetary(topics, "Today Revenue", "today_revenue"),
        ),
        (
            "month_revenue",
            SensorConfig::monetary(topics, "Month Revenue", "month_revenue"),
        ),
        (
            "total_revenue",
            SensorConfig::monetary(topics, "Total Revenue", "total_revenue"),
        ),
        (
            "gateway_online",
            SensorConfig::count(topics, "Gateways Online", "gateway_online"),
        ),
        (
            "gateway_offline",
            SensorConfig::count(topics, "Gateways Offline", "gateway_offline"),
        ),
        (
            "inverter_online",
            SensorConfig::count(topics, "Inverters Online", "inverter_online"),
        ),
        (
            "inverter_normal",
            SensorConfig::count(topics, "Inverters Normal", "inverter_normal"),
        ),
        (
            "inverter_offline",
            SensorConfig::count(topics, "Inverters Offline", "inverter_offline"),
        ),
        (
            "inverter_fault",
            SensorConfig::count(topics, "Inverters Faulted", "inverter_fault")
                .with_icon("mdi:alert"),
        ),
        (
            "inverter_wait",
            SensorConfig::count(topics, "Inverters Waiting", "inverter_wait"),
        ),
    ])
}
