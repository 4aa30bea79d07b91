//! Layer configuration, layered over defaults through the `config` crate.

use std::path::PathBuf;

/// Log severities surfaced to the user callback.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LogSeverityMask(pub u32);

impl LogSeverityMask {
    pub const INFO: u32 = 1 << 0;
    pub const WARNING: u32 = 1 << 1;
    pub const ERROR: u32 = 1 << 2;

    pub fn all() -> LogSeverityMask {
        LogSeverityMask(Self::INFO | Self::WARNING | Self::ERROR)
    }
}

/// Report/device creation settings. Everything is optional with defaults;
/// see the configuration section of the host interface.
#[derive(Clone, Debug)]
pub struct LayerSettings {
    /// Export copy-back may run on the exclusive transfer queue.
    pub async_transfer: bool,
    /// Trade messages for PCIE load.
    pub latent_transfers: bool,
    /// Ring growth default and ceiling, in messages.
    pub command_buffer_message_count_default: u32,
    pub command_buffer_message_count_limit: u32,
    /// Export ring chunk, in bytes.
    pub chunked_working_set_byte_size: u32,
    /// Frames to stall on `begin` for filtering completion.
    pub throttle_threshold_default: u32,
    pub throttle_threshold_limit: u32,
    pub shader_compiler_worker_count: u32,
    pub pipeline_compiler_worker_count: u32,
    pub cache_file_path: Option<PathBuf>,
    pub strip_folders: bool,
    pub log_severity_mask: LogSeverityMask,
    /// Interval of report steps, in seconds.
    pub step_interval_seconds: f64,
}

impl Default for LayerSettings {
    fn default() -> LayerSettings {
        LayerSettings {
            async_transfer: true,
            latent_transfers: false,
            command_buffer_message_count_default: 4096,
            command_buffer_message_count_limit: 1 << 20,
            chunked_working_set_byte_size: 1 << 20,
            throttle_threshold_default: 3,
            throttle_threshold_limit: 32,
            shader_compiler_worker_count: 2,
            pipeline_compiler_worker_count: 1,
            cache_file_path: None,
            strip_folders: false,
            log_severity_mask: LogSeverityMask::all(),
            step_interval_seconds: 1.0,
        }
    }
}

impl LayerSettings {
    /// Message area of the export ring, in words.
    pub fn ring_limit_words(&self) -> u32 {
        // Roughly eight words per message.
        (self.command_buffer_message_count_default * 8)
            .min(self.chunked_working_set_byte_size / 4)
    }

    /// Load settings from the `AEGIS_*` environment and an optional config
    /// file, over the defaults.
    pub fn load() -> LayerSettings {
        let mut settings = LayerSettings::default();

        let mut source = config::Config::new();
        let _ = source.merge(config::Environment::with_prefix("AEGIS"));
        if let Ok(path) = std::env::var("AEGIS_CONFIG") {
            let _ = source.merge(config::File::with_name(&path).required(false));
        }

        if let Ok(value) = source.get_bool("async_transfer") {
            settings.async_transfer = value;
        }
        if let Ok(value) = source.get_bool("latent_transfers") {
            settings.latent_transfers = value;
        }
        if let Ok(value) = source.get_int("message_count_default") {
            settings.command_buffer_message_count_default = value as u32;
        }
        if let Ok(value) = source.get_int("message_count_limit") {
            settings.command_buffer_message_count_limit = value as u32;
        }
        if let Ok(value) = source.get_int("chunked_working_set_byte_size") {
            settings.chunked_working_set_byte_size = value as u32;
        }
        if let Ok(value) = source.get_int("shader_compiler_worker_count") {
            settings.shader_compiler_worker_count = value as u32;
        }
        if let Ok(value) = source.get_int("pipeline_compiler_worker_count") {
            settings.pipeline_compiler_worker_count = value as u32;
        }
        if let Ok(value) = source.get_str("cache_file_path") {
            settings.cache_file_path = Some(PathBuf::from(value));
        }
        if let Ok(value) = source.get_bool("strip_folders") {
            settings.strip_folders = value;
        }
        if let Ok(value) = source.get_float("step_interval_seconds") {
            settings.step_interval_seconds = value;
        }

        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = LayerSettings::default();
        assert!(settings.ring_limit_words() > 0);
        assert!(settings.shader_compiler_worker_count >= 1);
    }
}
