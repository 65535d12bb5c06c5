use crate::config::{LogFormat, LogLevel, LogOutputType, LogTarget, LoggingConfig};
use chrono::{DateTime, Utc};
use log::{LevelFilter, Record};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

pub struct CustomLogger {
    level: LogLevel,
    targets: Vec<LogTarget>,
    format: LogFormat,
    writers: Vec<Mutex<BufWriter<Box<dyn Write + Send>>>>,
}

impl CustomLogger {
    pub fn new(config: LoggingConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let level = config.level.unwrap_or_default();
        let format = config.format.unwrap_or_default();
        let targets = config.targets.unwrap_or_else(|| {
            vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]
        });

        let mut writers = Vec::new();

        for target in &targets {
            let writer: Box<dyn Write + Send> = match target.output_type {
                LogOutputType::Stdout => Box::new(std::io::stdout()),
                LogOutputType::File => {
                    let path = target.path.as_ref()
                        .ok_or("File output type requires path")?;
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?;
                    Box::new(file)
                }
            };
            writers.push(Mutex::new(BufWriter::new(writer)));
        }

        Ok(Self {
            level,
            targets,
            format,
            writers,
        })
    }

    pub fn init(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
        let logger = Self::new(config)?;
        let max_level = logger.max_level_filter();
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max_level);
        Ok(())
    }

    /// Most verbose level any target accepts.
    pub fn max_level_filter(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|target| self.effective_level(target).to_level_filter())
            .max()
            .unwrap_or(LevelFilter::Off)
    }

    fn effective_level(&self, target: &LogTarget) -> LogLevel {
        target.level.unwrap_or(self.level)
    }

    fn should_log(&self, level: log::Level, target: &LogTarget) -> bool {
        level <= self.effective_level(target).to_level_filter()
    }

    fn format_text(&self, record: &Record) -> String {
        let timestamp: DateTime<Utc> = Utc::now();
        format!(
            "{} [{}] [{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level().to_string().to_uppercase(),
            record.target(),
            record.args()
        )
    }

    fn format_json(&self, record: &Record) -> String {
        json_line(record)
    }
}

fn json_line(record: &Record) -> String {
    let timestamp: DateTime<Utc> = Utc::now();
    let timestamp_str = timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
    let log_entry = json!({
        "timestamp": timestamp_str,
        "level": record.level().to_string().to_lowercase(),
        "target": record.target(),
        "module": record.module_path().unwrap_or("unknown"),
        "message": record.args().to_string(),
    });

    serde_json::to_string(&log_entry).unwrap_or_else(|_| {
        json!({"error": "Failed to serialize log entry", "raw_message": record.args().to_string()})
            .to_string()
    })
}

impl log::Log for CustomLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.targets
            .iter()
            .any(|target| self.should_log(metadata.level(), target))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let message = match self.format {
            LogFormat::Text => self.format_text(record),
            LogFormat::Json => self.format_json(record),
        };

        for (i, target) in self.targets.iter().enumerate() {
            if self.should_log(record.level(), target) {
                if let Ok(mut writer) = self.writers[i].lock() {
                    let _ = writeln!(writer, "{}", message);
                    let _ = writer.flush();
                }
            }
        }
    }

    fn flush(&self) {
        for writer in &self.writers {
            if let Ok(mut w) = writer.lock() {
                let _ = w.flush();
            }
        }
    }
}

// Fallback to env_logger if custom logging configuration is not provided
pub fn init_fallback(log_level: Option<&str>, log_format: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let level = log_level.unwrap_or("info");
    let format = parse_log_format(log_format.unwrap_or("text"))?;

    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if format == LogFormat::Json {
        builder.format(|buf, record| writeln!(buf, "{}", json_line(record)));
    }
    builder.try_init()?;

    Ok(())
}

pub fn parse_log_level(s: &str) -> Result<LogLevel, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => Err(format!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", s).into()),
    }
}

pub fn parse_log_format(s: &str) -> Result<LogFormat, Box<dyn std::error::Error>> {
    match s.to_lowercase().as_str() {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!("Invalid log format: {}. Must be one of: text, json", s).into()),
    }
}
