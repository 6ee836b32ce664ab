use serde_json::{Map, Value};

/// Flat JSON object published per system and cycle.
pub type MergedRecord = Map<String, Value>;

pub const MONITOR_FIELDS: [&str; 7] = [
    "percent",
    "w_cha",
    "power_pv",
    "soc",
    "meter_power",
    "power_load",
    "micro",
];

pub const PRODUCTION_FIELDS: [&str; 10] = [
    "today_generation",
    "month_generation",
    "year_generation",
    "total_generation",
    "co2",
    "tree",
    "diesel",
    "today_revenue",
    "month_revenue",
    "total_revenue",
];

pub const GATEWAY_FIELDS: [&str; 2] = ["online", "offline"];

pub const INVERTER_FIELDS: [&str; 5] = ["online", "normal", "offline", "fault", "wait"];

/// Combines whichever endpoint payloads are present into one flat record.
/// Fields missing from a payload are left out rather than set to null.
pub fn merge(
    monitor: Option<&Value>,
    production: Option<&Value>,
    status: Option<&Value>,
) -> MergedRecord {
    let mut merged = MergedRecord::new();

    if let Some(data) = monitor.and_then(payload_data) {
        copy_fields(&mut merged, data, "", &MONITOR_FIELDS);
    }
    if let Some(data) = production.and_then(payload_data) {
        copy_fields(&mut merged, data, "", &PRODUCTION_FIELDS);
    }
    if let Some(data) = status.and_then(payload_data) {
        // nested status blocks become prefixed scalars, e.g. gateway_online
        if let Some(gateway) = data.get("gateway") {
            copy_fields(&mut merged, gateway, "gateway_", &GATEWAY_FIELDS);
        }
        if let Some(inverter) = data.get("inverter") {
            copy_fields(&mut merged, inverter, "inverter_", &INVERTER_FIELDS);
        }
    }

    merged
}

fn payload_data(payload: &Value) -> Option<&Value> {
    payload.get("data").filter(|data| data.is_object())
}

fn copy_fields(merged: &mut MergedRecord, source: &Value, prefix: &str, fields: &[&str]) {
    for field in fields {
        match source.get(*field) {
            Some(Value::Null) | None => {}
            Some(value) => {
                merged.insert(format!("{prefix}{field}"), value.clone());
            }
        }
    }
}
