pub fn default_client_name() -> String {
    "storefront".to_string()
}

pub fn default_max_attempts() -> u32 {
    3
}

pub fn default_retry_delay_ms() -> u64 {
    3000
}

pub fn default_max_delay_ms() -> u64 {
    30_000
}

pub fn default_stable_after_ms() -> u64 {
    30_000
}

pub fn default_event_capacity() -> usize {
    64
}

pub fn default_mailbox_capacity() -> usize {
    256
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_metrics_port() -> u16 {
    9090
}
