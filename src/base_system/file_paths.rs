//! 输出文件命名与默认目录。

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use reqwest::Url;

const FALLBACK_FILE_NAME: &str = "downloaded_file";

/// 平台下载目录（XDG `XDG_DOWNLOAD_DIR` / Windows 已知文件夹），
/// 取不到时退回 `~/Downloads`，再退回当前目录。
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(fallback_download_dir)
}

fn fallback_download_dir() -> PathBuf {
    match home::home_dir() {
        Some(home) => home.join("Downloads"),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// 目标文件名：服务端 Content-Disposition → URL 最后一段 → `downloaded_file`。
pub fn resolve_file_name(url: &str, content_disposition: Option<&str>) -> String {
    let raw = content_disposition
        .and_then(filename_from_content_disposition)
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());
    safe_fs_name(&raw, "_", 200)
}

pub fn output_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(file_name)
}

fn disposition_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)filename(\*)?\s*=\s*(?:"([^"]*)"|([^;]+))"#).expect("valid regex")
    })
}

/// `filename*=`（RFC 5987）优先于 `filename=`。
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut plain: Option<String> = None;
    let mut extended: Option<String> = None;

    for cap in disposition_regex().captures_iter(value) {
        let raw = cap
            .get(2)
            .or_else(|| cap.get(3))
            .map(|m| m.as_str().trim())
            .unwrap_or("");
        if raw.is_empty() {
            continue;
        }
        if cap.get(1).is_some() {
            // charset'lang'value
            let encoded = raw.split_once("''").map(|(_, v)| v).unwrap_or(raw);
            let decoded = percent_decode(encoded);
            if !decoded.is_empty() {
                extended = Some(decoded);
            }
        } else {
            plain = Some(raw.to_string());
        }
    }

    extended
        .or(plain)
        .map(|name| last_path_component(&name).to_string())
        .filter(|name| !name.is_empty())
}

pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = percent_decode(last);
    let name = last_path_component(&decoded);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn last_path_component(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or("").trim()
}

fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// 将名字转为可安全落盘的文件名。
pub fn safe_fs_name(name: &str, replacement: &str, max_len: usize) -> String {
    let repl = replacement.chars().next().unwrap_or('_');
    let mut cleaned: String = name
        .chars()
        .map(|ch| match ch {
            ':' | '"' | '<' | '>' | '/' | '\\' | '|' | '?' | '*' => repl,
            c if (c as u32) < 32 => repl,
            _ => ch,
        })
        .collect();

    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }
    while cleaned.starts_with('.') {
        cleaned.remove(0);
    }

    if cleaned.is_empty() {
        cleaned.push_str(FALLBACK_FILE_NAME);
    }

    const RESERVED: [&str; 22] = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
        "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let upper = cleaned.to_uppercase();
    if RESERVED.contains(&upper.as_str()) {
        cleaned = format!("_{}", cleaned);
    }

    if cleaned.len() > max_len {
        // 避免在多字节 UTF-8 字符中间截断导致 panic
        let mut end = max_len;
        while !cleaned.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        cleaned.truncate(end);
    }

    cleaned
}
