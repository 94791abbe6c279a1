use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for the store, key files and transport runtime.
    pub data_dir: PathBuf,
    pub control_addr: String,
    pub socks_host: String,
    pub socks_port: u16,
    /// Spawn and own the transport runtime when set; attach otherwise.
    pub tor_binary: Option<PathBuf>,
    /// Inbound messages require a Verified sender (default on).
    pub strict_verified: bool,
    /// Enables debug routes, direct-HTTP sends and the plaintext loopback.
    pub debug: bool,
    /// Virtual port the hidden service exposes.
    pub virtual_port: u16,
    /// Store unlock PIN, when PIN mode is enabled.
    pub pin: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./murmure-data"),
            control_addr: "127.0.0.1:9051".to_string(),
            socks_host: "127.0.0.1".to_string(),
            socks_port: 9050,
            tor_binary: None,
            strict_verified: true,
            debug: false,
            virtual_port: 80,
            pin: None,
        }
    }
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dirs) = directories::ProjectDirs::from("org", "murmure", "murmure") {
            config.data_dir = dirs.data_dir().to_path_buf();
        }

        if let Ok(dir) = std::env::var("MURMURE_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        if let Ok(addr) = std::env::var("MURMURE_CONTROL_ADDR") {
            config.control_addr = addr;
        }

        if let Ok(addr) = std::env::var("MURMURE_SOCKS_ADDR") {
            match addr.rsplit_once(':').and_then(|(host, port)| {
                port.parse::<u16>().ok().map(|p| (host.to_string(), p))
            }) {
                Some((host, port)) => {
                    config.socks_host = host;
                    config.socks_port = port;
                }
                None => {
                    tracing::warn!(value = %addr, "Invalid MURMURE_SOCKS_ADDR, using default");
                }
            }
        }

        if let Ok(bin) = std::env::var("MURMURE_TOR_BINARY") {
            if !bin.is_empty() {
                config.tor_binary = Some(PathBuf::from(bin));
            }
        }

        if let Ok(val) = std::env::var("MURMURE_STRICT_VERIFIED") {
            config.strict_verified = val != "false" && val != "0";
        }

        if let Ok(val) = std::env::var("MURMURE_DEBUG") {
            config.debug = val == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("MURMURE_VIRTUAL_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                config.virtual_port = port;
            }
        }

        if let Ok(pin) = std::env::var("MURMURE_PIN") {
            if !pin.is_empty() {
                config.pin = Some(pin);
            }
        }

        config
    }

    pub fn device_key_path(&self) -> PathBuf {
        self.data_dir.join("device.key")
    }

    pub fn store_key_path(&self) -> PathBuf {
        self.data_dir.join("store.key")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("murmure.db")
    }

    pub fn prefs_path(&self) -> PathBuf {
        self.data_dir.join("prefs.json")
    }

    pub fn runtime_snapshot_path(&self) -> PathBuf {
        self.data_dir.join("runtime.json")
    }

    pub fn tor_config(&self) -> murmure_tor::TorConfig {
        let mut tor = murmure_tor::TorConfig::new(self.data_dir.clone());
        tor.control_addr = self.control_addr.clone();
        tor.socks_host = self.socks_host.clone();
        tor.socks_port = self.socks_port;
        tor.tor_binary = self.tor_binary.clone();
        tor
    }
}
