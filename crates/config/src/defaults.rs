pub fn default_enabled() -> bool {
    true
}

pub fn default_service_name() -> String {
    "orderledger".to_string()
}

pub fn default_version() -> String {
    "1.0.0".to_string()
}

pub fn default_max_connections() -> u32 {
    20
}

pub fn default_connection_timeout() -> u64 {
    30
}

pub fn default_topic() -> String {
    "input".to_string()
}

pub fn default_publish_timeout_ms() -> u64 {
    5000
}

pub fn default_notifier_buffer() -> usize {
    256
}

pub fn default_reread_attempts() -> u32 {
    3
}

pub fn default_reread_backoff_ms() -> u64 {
    50
}

pub fn default_allow_negative_holdings() -> bool {
    true
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn default_metrics_port() -> u16 {
    9090
}
