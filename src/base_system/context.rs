//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `downloader.yml` 的字段元信息。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::config::{ConfigError, ConfigSpec, FieldMeta};
use super::file_paths::default_download_dir;
use crate::download::plan::DEFAULT_MIN_SEGMENT_SIZE;

const MAX_THREADS: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 网络配置
    #[serde(default = "default_threads")]
    pub default_threads: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_min_wait_time")]
    pub min_wait_time: u64,
    #[serde(default = "default_max_wait_time")]
    pub max_wait_time: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // 分段配置
    #[serde(default = "default_min_segment_size")]
    pub min_segment_size: u64,

    // 路径配置
    #[serde(default)]
    pub save_path: String,

    // 界面与日志
    #[serde(default = "default_true")]
    pub show_progress: bool,
    #[serde(default = "default_true")]
    pub archive_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_threads: default_threads(),
            max_retries: default_max_retries(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            min_wait_time: default_min_wait_time(),
            max_wait_time: default_max_wait_time(),
            max_redirects: default_max_redirects(),
            user_agent: default_user_agent(),
            min_segment_size: default_min_segment_size(),
            save_path: String::new(),
            show_progress: default_true(),
            archive_logs: default_true(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "downloader.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 12] = [
            FieldMeta {
                name: "default_threads",
                description: "默认并发分段数（命令行 -t 优先）",
            },
            FieldMeta {
                name: "max_retries",
                description: "单个分段的最大尝试次数",
            },
            FieldMeta {
                name: "request_timeout",
                description: "请求/读取超时时间（秒）",
            },
            FieldMeta {
                name: "connect_timeout",
                description: "连接超时时间（秒）",
            },
            FieldMeta {
                name: "min_wait_time",
                description: "重试最小等待时间, 单位ms",
            },
            FieldMeta {
                name: "max_wait_time",
                description: "重试最大等待时间, 单位ms",
            },
            FieldMeta {
                name: "max_redirects",
                description: "最多跟随的重定向次数",
            },
            FieldMeta {
                name: "user_agent",
                description: "请求使用的 User-Agent",
            },
            FieldMeta {
                name: "min_segment_size",
                description: "单个分段的最小字节数（小文件会自动减少分段）",
            },
            FieldMeta {
                name: "save_path",
                description: "保存路径（留空使用系统下载目录）",
            },
            FieldMeta {
                name: "show_progress",
                description: "是否在终端显示进度条",
            },
            FieldMeta {
                name: "archive_logs",
                description: "退出时是否将日志压缩归档",
            },
        ];
        &FIELDS
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if !(1..=MAX_THREADS).contains(&self.default_threads) {
            return invalid("default_threads", "must be between 1 and 64");
        }
        if self.max_retries == 0 {
            return invalid("max_retries", "must be at least 1");
        }
        if self.request_timeout == 0 {
            return invalid("request_timeout", "must be at least 1 second");
        }
        if self.connect_timeout == 0 {
            return invalid("connect_timeout", "must be at least 1 second");
        }
        if self.max_wait_time < self.min_wait_time {
            return invalid("max_wait_time", "must not be smaller than min_wait_time");
        }
        if self.min_segment_size == 0 {
            return invalid("min_segment_size", "must be at least 1 byte");
        }
        Ok(())
    }
}

impl Config {
    /// 命令行未指定目录时使用的保存目录。
    pub fn default_save_dir(&self) -> PathBuf {
        if self.save_path.trim().is_empty() {
            default_download_dir()
        } else {
            PathBuf::from(&self.save_path)
        }
    }

    pub fn threads_or_default(&self, requested: Option<usize>) -> usize {
        match requested {
            Some(n) if n > 0 => n,
            _ => self.default_threads.max(1),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_threads() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_min_wait_time() -> u64 {
    1000
}

fn default_max_wait_time() -> u64 {
    8000
}

fn default_max_redirects() -> usize {
    5
}

fn default_user_agent() -> String {
    format!("swift-downloader/{}", env!("CARGO_PKG_VERSION"))
}

fn default_min_segment_size() -> u64 {
    DEFAULT_MIN_SEGMENT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_metadata_matches_serialized_keys() {
        let value = serde_yaml::to_value(Config::default()).unwrap();
        let serde_yaml::Value::Mapping(map) = value else {
            panic!("config must be a mapping");
        };
        assert_eq!(map.len(), Config::fields().len());
        for field in Config::fields() {
            assert!(
                map.contains_key(serde_yaml::Value::String(field.name.to_string())),
                "missing {}",
                field.name
            );
        }
    }

    #[test]
    fn thread_resolution() {
        let cfg = Config::default();
        assert_eq!(cfg.threads_or_default(None), 8);
        assert_eq!(cfg.threads_or_default(Some(0)), 8);
        assert_eq!(cfg.threads_or_default(Some(3)), 3);
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(Config::default().validate().is_ok());

        let cfg = Config {
            min_wait_time: 500,
            max_wait_time: 100,
            ..Config::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                field: "max_wait_time",
                ..
            })
        ));
    }
}
