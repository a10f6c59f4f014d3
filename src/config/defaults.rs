use super::*;

pub(super) fn capability() -> String {
    "float".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/helios.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            mqtt: None,
            poll_interval_ms: 5000,
            providers: BTreeMap::new(),
        }
    }
}
