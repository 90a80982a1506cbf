#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Binary capacity units accepted for the local mirror limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CapacityUnit {
    Gb,
    Tb,
}

impl CapacityUnit {
    pub fn bytes_per_unit(&self) -> u64 {
        match self {
            CapacityUnit::Gb => 1024u64.pow(3),
            CapacityUnit::Tb => 1024u64.pow(4),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CapacityUnit::Gb => "GB",
            CapacityUnit::Tb => "TB",
        }
    }
}
