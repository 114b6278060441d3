//! Default TOML config template with inline documentation comments.

/// Generate the default TOML config content with comments.
pub(crate) fn default_config_toml() -> String {
    r##"# meshcall configuration
# Only override what you want to change -- missing fields use defaults.

[realtime]
# host = "wss://ws.meshcall.dev"
# app_key = ""
# auth_endpoint = "https://api.meshcall.dev/broadcasting/auth"
# token = ""                  # bearer credential; prefer MESHCALL_TOKEN
# heartbeat_interval = 30      # seconds, 5-300
# connect_timeout = 15         # seconds, 1-120
# reconnect_base_ms = 1000     # 10-60000, doubled per attempt
# max_reconnect_attempts = 5   # 0-16

[room]
# start_with_camera = true
# start_with_mic = true
# signal_event = "signal"      # sent on the wire as client-signal

[logging]
# level = "info"               # trace | debug | info | warn | error
"##
    .to_string()
}
