pub const PLUGIN_TOPIC: &str = "plugin/ikea_tradfri/";
pub const EVENT_TOPIC: &str = "event/";
pub const TEMPERATURE_TOPIC: &str = "temperature/";

pub const CMD_TURN_ON: &str = "turnOn";
pub const CMD_TURN_OFF: &str = "turnOff";
pub const CMD_STATE: &str = "state";

/// Incoming message on one of the subscribed topics, relative to the base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRoute<'a> {
    TurnOn,
    TurnOff,
    State,
    Event(&'a str),
    Temperature(&'a str),
}

pub fn plugin_wildcard(base: &str) -> String {
    format!("{base}{PLUGIN_TOPIC}#")
}

pub fn event_wildcard(base: &str) -> String {
    format!("{base}{EVENT_TOPIC}#")
}

pub fn temperature_wildcard(base: &str) -> String {
    format!("{base}{TEMPERATURE_TOPIC}#")
}

pub fn device_state_topic(base: &str, device_id: &str) -> String {
    format!("{base}{PLUGIN_TOPIC}state/{device_id}")
}

pub fn message_topic(base: &str, kind: &str) -> String {
    format!("{base}{PLUGIN_TOPIC}message/{kind}")
}

pub fn route<'a>(base: &str, topic: &'a str) -> Option<TopicRoute<'a>> {
    let relative = topic.strip_prefix(base)?;

    if let Some(command) = relative.strip_prefix(PLUGIN_TOPIC) {
        return match command {
            CMD_TURN_ON => Some(TopicRoute::TurnOn),
            CMD_TURN_OFF => Some(TopicRoute::TurnOff),
            CMD_STATE => Some(TopicRoute::State),
            _ => None,
        };
    }
    if let Some(event) = relative.strip_prefix(EVENT_TOPIC) {
        return (!event.is_empty()).then_some(TopicRoute::Event(event));
    }
    if let Some(tool) = relative.strip_prefix(TEMPERATURE_TOPIC) {
        return (!tool.is_empty()).then_some(TopicRoute::Temperature(tool));
    }
    None
}
