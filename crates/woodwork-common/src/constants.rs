//! System-wide constants and defaults.

/// Application name used in CLI output.
pub const APP_NAME: &str = "woodwork";

/// File extension for Woodwork configuration files.
pub const WW_EXTENSION: &str = ".ww";

/// Default configuration file looked up by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "main.ww";

/// Component kind whose declaration configures the message bus instead of
/// describing a component.
pub const MESSAGE_BUS_KIND: &str = "message_bus";

/// Config key listing extra topics a component subscribes to.
pub const SUBSCRIBE_KEY: &str = "subscribe";

/// Input read that ends the main loop.
pub const DEFAULT_EXIT_TOKEN: &str = "exit";

/// Default number of concurrent lifecycle workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Topic emitted by the main loop for every input read.
pub const TOPIC_INPUT_RECEIVED: &str = "input_received";

/// Topic carrying a complete response payload.
pub const TOPIC_AGENT_RESPONSE: &str = "agent_response";

/// Topic announcing a newly opened output stream.
pub const TOPIC_STREAM_STARTED: &str = "stream_started";

/// Environment variable overriding the lifecycle worker count.
pub const ENV_WORKERS: &str = "WOODWORK_WORKERS";

/// Environment variable overriding the exit token.
pub const ENV_EXIT_TOKEN: &str = "WOODWORK_EXIT_TOKEN";

/// Environment variable forcing an orchestration mode.
pub const ENV_MODE: &str = "WOODWORK_MODE";
