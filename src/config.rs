use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Error raised while loading a service configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "malformed config file: {}", e),
        }
    }
}

/// Load a JSON configuration file into the given service config type.
pub fn load<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let file = File::open(path).map_err(ConfigError::Io)?;
    serde_json::from_reader(BufReader::new(file)).map_err(ConfigError::Parse)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration for the Kernel service.
#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    #[serde(rename = "IP_KERNEL")]
    pub ip: String,
    #[serde(rename = "PUERTO_KERNEL")]
    pub port: u16,
    #[serde(rename = "IP_MEMORIA")]
    pub memory_ip: String,
    #[serde(rename = "PUERTO_MEMORIA")]
    pub memory_port: u16,
    #[serde(rename = "ALGORITMO_CORTO_PLAZO")]
    pub sts_algorithm: String,
    #[serde(rename = "ALGORITMO_INGRESO_A_READY")]
    pub lts_algorithm: String,
    #[serde(rename = "ALFA")]
    pub alpha: f64,
    #[serde(rename = "ESTIMACION_INICIAL")]
    pub initial_estimate: u64,
    #[serde(rename = "TIEMPO_SUSPENSION")]
    pub suspension_time: u64,
    #[serde(rename = "GRADO_MULTIPROGRAMACION")]
    pub multiprogramming: usize,
    #[serde(rename = "LOG_LEVEL", default = "default_log_level")]
    pub log_level: String,
}

/// Configuration for the Memory service.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(rename = "IP_MEMORIA")]
    pub ip: String,
    #[serde(rename = "PUERTO_MEMORIA")]
    pub port: u16,
    #[serde(rename = "TAM_MEMORIA")]
    pub memory_size: usize,
    #[serde(rename = "TAM_PAGINA")]
    pub page_size: usize,
    #[serde(rename = "ENTRADAS_POR_TABLA")]
    pub entries_per_table: usize,
    #[serde(rename = "CANTIDAD_NIVELES")]
    pub levels: usize,
    #[serde(rename = "RETARDO_MEMORIA")]
    pub memory_delay: u64,
    #[serde(rename = "RETARDO_SWAP")]
    pub swap_delay: u64,
    #[serde(rename = "SWAPFILE_PATH")]
    pub swapfile_path: String,
    #[serde(rename = "DUMP_PATH")]
    pub dump_path: String,
    #[serde(rename = "SCRIPTS_PATH")]
    pub scripts_path: String,
    #[serde(rename = "LOG_LEVEL", default = "default_log_level")]
    pub log_level: String,
}

/// Configuration for a CPU worker.
#[derive(Debug, Clone, Deserialize)]
pub struct CpuConfig {
    #[serde(rename = "IP_CPU")]
    pub ip: String,
    #[serde(rename = "PUERTO_CPU")]
    pub port: u16,
    #[serde(rename = "IP_MEMORIA")]
    pub memory_ip: String,
    #[serde(rename = "PUERTO_MEMORIA")]
    pub memory_port: u16,
    #[serde(rename = "IP_KERNEL")]
    pub kernel_ip: String,
    #[serde(rename = "PUERTO_KERNEL")]
    pub kernel_port: u16,
    #[serde(rename = "ENTRADAS_TLB")]
    pub tlb_entries: usize,
    #[serde(rename = "REEMPLAZO_TLB")]
    pub tlb_replacement: String,
    #[serde(rename = "ENTRADAS_CACHE")]
    pub cache_entries: usize,
    #[serde(rename = "REEMPLAZO_CACHE")]
    pub cache_replacement: String,
    #[serde(rename = "RETARDO_CACHE")]
    pub cache_delay: u64,
    #[serde(rename = "LOG_LEVEL", default = "default_log_level")]
    pub log_level: String,
}

/// Configuration for an I/O device.
#[derive(Debug, Clone, Deserialize)]
pub struct IoConfig {
    #[serde(rename = "IP_IO")]
    pub ip: String,
    #[serde(rename = "PUERTO_IO")]
    pub port: u16,
    #[serde(rename = "IP_KERNEL")]
    pub kernel_ip: String,
    #[serde(rename = "PUERTO_KERNEL")]
    pub kernel_port: u16,
    #[serde(rename = "RETARDO_BASE", default)]
    pub base_delay: u64,
    #[serde(rename = "LOG_LEVEL", default = "default_log_level")]
    pub log_level: String,
}
