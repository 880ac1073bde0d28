const DEFAULT_API_PORT: u16 = 4028;

pub fn get_default_api_port() -> u16 {
    DEFAULT_API_PORT
}

const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

pub fn get_default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
