use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use tungsten::{BUFFER_POOL_INIT_SIZE, MAX_LOCAL_THREADS};

pub const DEFAULT_PORT: u16 = 9000;

#[derive(Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub io_threads: usize,
    pub local_threads: usize,
    pub pool_init: usize,
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: DEFAULT_PORT,
            io_threads: 2,
            local_threads: MAX_LOCAL_THREADS,
            pool_init: BUFFER_POOL_INIT_SIZE,
            stats_interval_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_through_toml() {
        let toml = serdeconv::to_toml_string(&ServerConfig::default()).unwrap();
        let decoded: ServerConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(decoded.port, DEFAULT_PORT);
        assert_eq!(decoded.io_threads, 2);
        assert_eq!(decoded.local_threads, MAX_LOCAL_THREADS);
        assert_eq!(decoded.stats_interval_secs, 10);
    }
}
