use std::env;
use std::net::{IpAddr, Ipv4Addr};

pub const PORT_ENV: &str = "DRINK_CAM_RELAY_PORT";
pub const BIND_ENV: &str = "DRINK_CAM_RELAY_BIND";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env::var(BIND_ENV)
                .ok()
                .and_then(|addr| addr.parse().ok())
                .unwrap_or(defaults.bind),
            port: env::var(PORT_ENV)
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8787,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn reads_port_and_bind() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var(PORT_ENV, "9000");
            env::set_var(BIND_ENV, "127.0.0.1");
        }
        let config = Config::from_env();
        unsafe {
            env::remove_var(PORT_ENV);
            env::remove_var(BIND_ENV);
        }
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var(PORT_ENV, "eighty");
            env::remove_var(BIND_ENV);
        }
        let config = Config::from_env();
        unsafe {
            env::remove_var(PORT_ENV);
        }
        assert_eq!(config, Config::default());
    }
}
