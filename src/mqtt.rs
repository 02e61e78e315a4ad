use anyhow::{Context, Result};
use log::*;
use paho_mqtt as mqtt;
use save_vtr_lib::device::DeviceHandle;
use save_vtr_lib::state::DeviceState;
use serde::Deserialize;
use std::fs::File;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub entity_id: Option<String>,
    /// Quality of service code to use
    #[serde(default)]
    qos: u8,
}

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "mqtt.yaml";

    pub fn load(path: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Cannot open MQTT config {path}"))?;
        serde_yaml::from_reader(file).with_context(|| format!("Cannot parse MQTT config {path}"))
    }

    pub fn qos(&self) -> i32 {
        self.qos.min(2) as i32
    }
}

const MQTT_APPENDIX_AVAILABILITY: &str = "availability";

fn get_topic(entity_id: Option<&str>, appendix: &str) -> String {
    if let Some(entity_id) = entity_id {
        format!("save_vtr/{entity_id}/{appendix}")
    } else {
        format!("save_vtr/{appendix}")
    }
}

/// Topic and payload of every known value of `state`.
fn messages(entity_id: Option<&str>, state: &DeviceState) -> Vec<(String, String)> {
    let mut messages = Vec::new();
    let mut push = |appendix: &str, payload: String| {
        messages.push((get_topic(entity_id, appendix), payload));
    };
    let temperatures = [
        ("room_temperature", state.room_temperature),
        ("setpoint", state.setpoint),
        ("outdoor_air_temperature", state.outdoor_air_temperature),
        ("supply_air_temperature", state.supply_air_temperature),
        ("extract_air_temperature", state.extract_air_temperature),
    ];
    for (appendix, value) in temperatures {
        if let Some(value) = value {
            push(appendix, format!("{value:.1}"));
        }
    }
    if let Some(percent) = state.heat_demand {
        push("heat_demand", format!("{percent:.0}"));
    }
    for (appendix, flow) in [
        ("supply_air_flow", state.supply_air_flow),
        ("extract_air_flow", state.extract_air_flow),
    ] {
        if let Some(flow) = flow {
            push(&format!("{appendix}/percent"), format!("{:.0}", flow.percent));
            push(&format!("{appendix}/volume"), format!("{:.0}", flow.volume));
        }
    }
    if let Some(mode) = state.fan_mode {
        push("fan_mode", mode.to_string());
    }
    for alarm in &state.alarms {
        if let Some(alarm_state) = alarm.state {
            push(&format!("alarm/{}", alarm.name), alarm_state.to_string());
        }
    }
    for flag in &state.flags {
        if let Some(value) = flag.value {
            push(&format!("flag/{}", flag.name), value.to_string());
        }
    }
    for counter in &state.counters {
        if let Some(value) = counter.value {
            push(&format!("counter/{}", counter.name), value.to_string());
        }
    }
    messages
}

async fn availability(client: &mqtt::AsyncClient, config: &MqttConfig, status: &str) -> Result<()> {
    let msg = mqtt::Message::new_retained(
        get_topic(config.entity_id.as_deref(), MQTT_APPENDIX_AVAILABILITY),
        status,
        config.qos(),
    );
    client
        .publish(msg)
        .await
        .with_context(|| "Cannot publish mqtt message")
}

async fn go_online(client: &mqtt::AsyncClient, config: &MqttConfig) -> Result<()> {
    availability(client, config, "online").await
}

async fn go_offline(client: &mqtt::AsyncClient, config: &MqttConfig) -> Result<()> {
    availability(client, config, "offline").await
}

async fn publish_state(
    client: &mqtt::AsyncClient,
    config: &MqttConfig,
    state: &DeviceState,
) -> Result<()> {
    trace!("Publishing cycle {}", state.cycle);
    let tokens: Vec<_> = messages(config.entity_id.as_deref(), state)
        .into_iter()
        .map(|(topic, payload)| client.publish(mqtt::Message::new(topic, payload, config.qos())))
        .collect();
    for token in tokens {
        token
            .await
            .with_context(|| "Cannot publish mqtt message")?;
    }
    Ok(())
}

async fn connect(config: &MqttConfig) -> Result<mqtt::AsyncClient> {
    let client_id = format!("save_vtr_{:04x}", rand::random::<u16>());
    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(config.url.clone())
        .client_id(client_id)
        .finalize();
    let client =
        mqtt::AsyncClient::new(create_opts).with_context(|| "Error creating mqtt client")?;

    let will = mqtt::Message::new_retained(
        get_topic(config.entity_id.as_deref(), MQTT_APPENDIX_AVAILABILITY),
        "offline",
        config.qos(),
    );
    let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
    let mut conn_builder = conn_builder
        .keep_alive_interval(Duration::from_secs(20))
        .clean_session(true)
        .will_message(will);
    if let Some(user_name) = &config.username {
        conn_builder = conn_builder.user_name(user_name);
    }
    if let Some(password) = &config.password {
        conn_builder = conn_builder.password(password);
    }
    client
        .connect(conn_builder.finalize())
        .await
        .with_context(|| "Mqtt client unable to connect")?;
    Ok(client)
}

/// Publishes every snapshot until Ctrl-C.
pub async fn run_daemon(handle: &DeviceHandle, config_file: &str) -> Result<()> {
    let config = MqttConfig::load(config_file)?;
    debug!("MQTT config: {config:?}");
    let client = connect(&config).await?;
    go_online(&client, &config).await?;

    let mut snapshots = handle.subscribe();
    let state = crate::refresh_all(handle).await?;
    snapshots.borrow_and_update();
    publish_state(&client, &config, &state).await?;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = snapshots.borrow_and_update().clone();
                publish_state(&client, &config, &state).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                break;
            }
        }
    }

    go_offline(&client, &config).await?;
    client
        .disconnect(None)
        .await
        .with_context(|| "Error disconnect mqtt client")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use save_vtr_lib::protocol::{AlarmState, FanMode};
    use save_vtr_lib::register_map::RegisterMap;
    use save_vtr_lib::state::AirFlow;
    use assert_matches::assert_matches;

    #[test]
    fn topics_with_and_without_entity() {
        assert_eq!(get_topic(Some("attic"), "setpoint"), "save_vtr/attic/setpoint");
        assert_eq!(get_topic(None, "availability"), "save_vtr/availability");
    }

    #[test]
    fn only_known_values_are_published() {
        let mut state = DeviceState::new(&RegisterMap::save_vtr());
        state.setpoint = Some(21.5);
        state.fan_mode = Some(FanMode::Crowded);
        state.supply_air_flow = Some(AirFlow::from_percent(40.0, 3.0));
        state.alarms[0].state = Some(AlarmState::Active);

        let messages = messages(Some("unit"), &state);
        assert_eq!(
            messages,
            vec![
                ("save_vtr/unit/setpoint".to_string(), "21.5".to_string()),
                ("save_vtr/unit/supply_air_flow/percent".to_string(), "40".to_string()),
                ("save_vtr/unit/supply_air_flow/volume".to_string(), "120".to_string()),
                ("save_vtr/unit/fan_mode".to_string(), "CROWDED".to_string()),
                ("save_vtr/unit/alarm/alarm_saf_ctrl".to_string(), "Active".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn publishing_without_a_broker_fails_without_blocking() {
        let config = MqttConfig {
            url: "tcp://127.0.0.1:1".to_string(),
            username: None,
            password: None,
            entity_id: None,
            qos: 1,
        };
        let client = mqtt::AsyncClient::new(config.url.clone()).unwrap();
        let mut state = DeviceState::new(&RegisterMap::save_vtr());
        state.setpoint = Some(20.0);

        let published = tokio::time::timeout(
            Duration::from_secs(5),
            publish_state(&client, &config, &state),
        )
        .await;
        assert_matches!(published, Ok(Err(..)));
    }
}
