//! Optional request/response logging ("data collecting").
//!
//! When enabled, every processed request and its final response are
//! appended to a timestamped plain-text file, with images inlined as
//! base64. A new file is started whenever the current one grows past
//! the configured size. Collection failures are logged and otherwise
//! ignored; they must never affect request processing.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Local;

use crate::config::{DataCollectingConfig, FilesConfig};
use crate::dispatch::ResponseSummary;
use crate::request::Request;

pub struct DataCollector {
    enabled: bool,
    dir: PathBuf,
    max_file_size: u64,
    current_file: Mutex<Option<PathBuf>>,
    file_seq: AtomicU64,
}

impl DataCollector {
    pub fn new(files: &FilesConfig, config: &DataCollectingConfig) -> Self {
        Self {
            enabled: config.enabled,
            dir: PathBuf::from(&files.data_collecting_dir),
            max_file_size: config.max_file_size,
            current_file: Mutex::new(None),
            file_seq: AtomicU64::new(0),
        }
    }

    /// A collector that drops everything (data collecting off).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::new(),
            max_file_size: 0,
            current_file: Mutex::new(None),
            file_seq: AtomicU64::new(0),
        }
    }

    pub fn log_request(&self, request: &Request, user_name: &str) {
        if !self.enabled {
            return;
        }
        let line = format!(
            "[{}] REQUEST id={} user={} ({}) module={}\n{}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            request.id,
            user_name,
            request.user_id,
            request.module,
            request.prompt
        );
        self.append(&line);
    }

    pub fn log_response(&self, request: &Request, user_name: &str, summary: &ResponseSummary) {
        if !self.enabled {
            return;
        }
        let mut body = summary.text.clone();
        for image in &summary.images {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str("image_base64=");
            body.push_str(&BASE64.encode(image));
        }
        let line = format!(
            "[{}] RESPONSE id={} user={} ({}) module={}\n{}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            request.id,
            user_name,
            request.user_id,
            request.module,
            body
        );
        self.append(&line);
    }

    fn append(&self, line: &str) {
        if let Err(err) = self.try_append(line) {
            error!("Error collecting data: {}", err);
        }
    }

    fn try_append(&self, line: &str) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut current = self.current_file.lock().unwrap();
        let path = match current.as_ref().filter(|p| p.exists()) {
            Some(path) => path.clone(),
            None => {
                let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
                let name = format!("{}_{}.log", Local::now().format("%Y-%m-%d_%H-%M-%S"), seq);
                let path = self.dir.join(name);
                info!("New file for data collecting: {}", path.display());
                *current = Some(path.clone());
                path
            }
        };

        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;

        // Rotate once the file outgrows the configured maximum.
        if file.metadata()?.len() > self.max_file_size {
            *current = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::make_request;
    use crate::request::ModuleKind;
    use tempfile::TempDir;

    fn collector(dir: &TempDir, max_file_size: u64) -> DataCollector {
        DataCollector {
            enabled: true,
            dir: dir.path().to_owned(),
            max_file_size,
            current_file: Mutex::new(None),
            file_seq: AtomicU64::new(0),
        }
    }

    fn read_all(dir: &TempDir) -> String {
        let mut out = String::new();
        for entry in fs::read_dir(dir.path()).unwrap() {
            out.push_str(&fs::read_to_string(entry.unwrap().path()).unwrap());
        }
        out
    }

    #[test]
    fn logs_requests_and_responses() {
        let dir = TempDir::new().unwrap();
        let collector = collector(&dir, 1024 * 1024);
        let request = make_request(1, 42, ModuleKind::ChatGpt, "what is rust");

        collector.log_request(&request, "alice");
        collector.log_response(
            &request,
            "alice",
            &ResponseSummary {
                text: "a language".to_owned(),
                images: vec![vec![1, 2, 3]],
            },
        );

        let content = read_all(&dir);
        assert!(content.contains("REQUEST id=1 user=alice (101) module=chatgpt"));
        assert!(content.contains("what is rust"));
        assert!(content.contains("a language"));
        assert!(content.contains(&format!("image_base64={}", BASE64.encode([1u8, 2, 3]))));
    }

    #[test]
    fn rotates_once_the_file_is_too_large() {
        let dir = TempDir::new().unwrap();
        let collector = collector(&dir, 1);
        let request = make_request(1, 42, ModuleKind::ChatGpt, "hello");

        collector.log_request(&request, "a");
        collector.log_request(&request, "a");

        let files = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn disabled_collector_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let collector = DataCollector::disabled();
        let request = make_request(1, 42, ModuleKind::ChatGpt, "hello");
        collector.log_request(&request, "a");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
