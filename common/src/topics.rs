pub const TOPIC_COMMANDS: &str = "classroom/switch/commands";
pub const TOPIC_CONFIG: &str = "classroom/switch/config";

pub const TOPIC_STATE: &str = "classroom/switch/state";
pub const TOPIC_TELEMETRY: &str = "classroom/switch/telemetry";

pub const SUBSCRIBE_TOPICS: &[&str] = &[TOPIC_COMMANDS, TOPIC_CONFIG];
