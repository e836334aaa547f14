//! YAML 配置文件：首次运行生成带注释的默认文件，之后与默认值合并。
//!
//! 用户文件缺少的字段会补写回去（保留用户已有的值），未知字段只告警不报错。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("config serialization failed: {0}")]
    Serialize(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

/// 可落盘的配置类型：字段顺序与注释来自 `fields()`。
pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;

    fn fields() -> &'static [FieldMeta];

    /// 合并后的取值检查。
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// 配置文件位置：显式路径 > `base_dir/FILE_NAME` > 当前目录下的 `FILE_NAME`。
pub fn config_path<T: ConfigSpec>(explicit: Option<&Path>, base_dir: Option<&Path>) -> PathBuf {
    match (explicit, base_dir) {
        (Some(p), _) => p.to_path_buf(),
        (None, Some(base)) => base.join(T::FILE_NAME),
        (None, None) => PathBuf::from(T::FILE_NAME),
    }
}

pub fn load_or_create<T: ConfigSpec>(
    explicit: Option<&Path>,
    base_dir: Option<&Path>,
) -> Result<T, ConfigError> {
    let path = config_path::<T>(explicit, base_dir);

    if !path.exists() {
        let config = T::default();
        save(&config, &path)?;
        info!(target: "config", path = %path.display(), "已生成默认配置文件");
        return Ok(config);
    }

    let user = read_mapping(&path)?;
    let known: Vec<&str> = T::fields().iter().map(|f| f.name).collect();
    for key in user.keys().filter_map(Value::as_str) {
        if !known.contains(&key) {
            warn!(target: "config", path = %path.display(), "忽略未知配置项 `{key}`");
        }
    }
    let incomplete = known
        .iter()
        .any(|name| !user.contains_key(Value::String((*name).to_string())));

    let mut merged = to_mapping(&T::default())?;
    overlay(&mut merged, user);
    let config: T = serde_yaml::from_value(Value::Mapping(merged)).map_err(|source| {
        ConfigError::Parse {
            path: path.clone(),
            source,
        }
    })?;
    config.validate()?;

    if incomplete {
        save(&config, &path)?;
    }
    Ok(config)
}

/// 以带注释的格式写入（先写临时文件再替换）。
pub fn save<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ConfigError::Io { path, source }
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let text = render_commented(config)?;
    let tmp = path.with_extension("yml.tmp");
    fs::write(&tmp, text).map_err(io_err(tmp.as_path()))?;
    #[cfg(windows)]
    let _ = fs::remove_file(path);
    fs::rename(&tmp, path).map_err(io_err(path))
}

pub fn render_commented<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let values = to_mapping(config)?;
    let mut out = String::new();
    for field in T::fields() {
        for line in field.description.lines() {
            out.push_str("# ");
            out.push_str(line);
            out.push('\n');
        }
        let key = Value::String(field.name.to_string());
        let value = values.get(&key).cloned().unwrap_or(Value::Null);
        let entry = serde_yaml::to_string(&Mapping::from_iter([(key, value)]))
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        out.push_str(entry.trim_end());
        out.push_str("\n\n");
    }
    Ok(out)
}

fn to_mapping<T: Serialize>(value: &T) -> Result<Mapping, ConfigError> {
    match serde_yaml::to_value(value).map_err(|e| ConfigError::Serialize(e.to_string()))? {
        Value::Mapping(m) => Ok(m),
        _ => Err(ConfigError::Serialize(
            "config must serialize to a mapping".to_string(),
        )),
    }
}

fn read_mapping(path: &Path) -> Result<Mapping, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if raw.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let parse_err = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };
    match serde_yaml::from_str::<Value>(&raw).map_err(parse_err)? {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(Mapping::new()),
        other => {
            // 顶层不是映射，借 serde_yaml 生成带位置的错误
            let err = serde_yaml::from_value::<Mapping>(other)
                .err()
                .map(parse_err)
                .unwrap_or_else(|| ConfigError::Serialize("top level is not a mapping".into()));
            Err(err)
        }
    }
}

/// 用户值覆盖默认值；`null`（留空）保留默认。
fn overlay(defaults: &mut Mapping, user: Mapping) {
    for (key, value) in user {
        match (defaults.get_mut(&key), value) {
            (_, Value::Null) => {}
            (Some(Value::Mapping(dst)), Value::Mapping(src)) => overlay(dst, src),
            (Some(slot), value) => *slot = value,
            (None, value) => {
                defaults.insert(key, value);
            }
        }
    }
}
