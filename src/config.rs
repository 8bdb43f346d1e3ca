use std::str::FromStr;

use log::warn;

/// Default chunk size for device-local memory types, in MiB.
const DEFAULT_DEVICE_CHUNK_MIB: u64 = 320;

/// Default chunk size for everything else (host-visible staging
/// memory, mostly), in MiB.
const DEFAULT_HOST_CHUNK_MIB: u64 = 128;

/// Default bound on command buffers queued between the
/// submission and finish threads before `submit` starts
/// blocking its caller.
const DEFAULT_MAX_QUEUED_CMD_BUFFERS: usize = 18;

/// Default fraction of a heap's capacity usable on
/// unified-memory systems, in percent. GPU and CPU share the
/// same physical pool there, so taking everything would starve
/// the rest of the process.
const DEFAULT_HEAP_BUDGET_PERCENT: u32 = 80;

/// Tunables consumed by the allocator and the submission queue.
/// Values come from the environment when set, with warnings and
/// defaults for anything unparsable, so a bad override can never
/// keep the device from coming up.
#[derive(Clone, Copy, Debug)]
pub struct CoreConfig {
    /// Chunk size for device-local memory types, in bytes.
    pub device_chunk_size: u64,
    /// Chunk size for all other memory types, in bytes.
    pub host_chunk_size: u64,
    /// Maximum number of command buffers in flight between the
    /// submit and finish queues before `submit` applies
    /// backpressure to the calling thread.
    pub max_queued_command_buffers: usize,
    /// Fraction of each heap usable as a soft budget on
    /// unified-memory systems, in [0, 1].
    pub heap_budget_fraction: f32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            device_chunk_size: DEFAULT_DEVICE_CHUNK_MIB << 20,
            host_chunk_size: DEFAULT_HOST_CHUNK_MIB << 20,
            max_queued_command_buffers: DEFAULT_MAX_QUEUED_CMD_BUFFERS,
            heap_budget_fraction: DEFAULT_HEAP_BUDGET_PERCENT as f32 / 100.0,
        }
    }
}

impl CoreConfig {
    /// Builds a configuration from the environment, falling
    /// back to the defaults for any variable that is unset or
    /// invalid.
    pub fn from_env() -> Self {
        let device_chunk_mib = parse_var("PROSPERO_DEVICE_CHUNK_MIB", DEFAULT_DEVICE_CHUNK_MIB);
        let host_chunk_mib = parse_var("PROSPERO_HOST_CHUNK_MIB", DEFAULT_HOST_CHUNK_MIB);
        let max_queued = parse_var(
            "PROSPERO_MAX_QUEUED_CMD_BUFFERS",
            DEFAULT_MAX_QUEUED_CMD_BUFFERS,
        );
        let budget_percent = parse_var(
            "PROSPERO_HEAP_BUDGET_PERCENT",
            DEFAULT_HEAP_BUDGET_PERCENT,
        )
        .min(100);

        Self {
            device_chunk_size: device_chunk_mib << 20,
            host_chunk_size: host_chunk_mib << 20,
            max_queued_command_buffers: max_queued.max(1),
            heap_budget_fraction: budget_percent as f32 / 100.0,
        }
    }
}

/// Reads and parses one environment variable, warning and
/// returning the default when the value does not parse.
fn parse_var<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => parse_value(name, &value, default),
        Err(_) => default,
    }
}

fn parse_value<T: FromStr + Copy>(name: &str, value: &str, default: T) -> T {
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!("Ignoring invalid value '{value}' for {name}.");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.device_chunk_size, 320 << 20);
        assert_eq!(config.host_chunk_size, 128 << 20);
        assert_eq!(config.max_queued_command_buffers, 18);
        assert!((config.heap_budget_fraction - 0.8).abs() < 1e-6);
    }

    #[test]
    fn parses_valid_values() {
        assert_eq!(parse_value("X", "64", 320u64), 64);
        assert_eq!(parse_value("X", " 8 ", 18usize), 8);
    }

    #[test]
    fn rejects_invalid_values() {
        assert_eq!(parse_value("X", "lots", 320u64), 320);
        assert_eq!(parse_value("X", "", 18usize), 18);
        assert_eq!(parse_value("X", "-3", 18usize), 18);
    }
}
