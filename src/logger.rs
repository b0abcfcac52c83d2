use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Per-session audit trail. Default methods do nothing.
pub trait AuditLog: Send + Sync {
    fn session_start(&self, _peer: &str, _user: u32) {}
    fn batch(&self, _peer: &str, _user: u32, _elements: usize, _seconds: f64) {}
    fn session_end(&self, _peer: &str, _user: Option<u32>, _batches: u64, _elements: u64) {}
    fn rejected(&self, _peer: &str, _reason: &str) {}
}

pub struct NoopAuditLog;
impl AuditLog for NoopAuditLog {}

pub struct TextAuditLog {
    file: Mutex<File>,
}

impl TextAuditLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl AuditLog for TextAuditLog {
    fn session_start(&self, peer: &str, user: u32) {
        self.line(&format!("SESSION peer={peer} user={user}"));
    }
    fn batch(&self, peer: &str, user: u32, elements: usize, seconds: f64) {
        self.line(&format!(
            "BATCH peer={peer} user={user} elements={elements} seconds={seconds:.6}"
        ));
    }
    fn session_end(&self, peer: &str, user: Option<u32>, batches: u64, elements: u64) {
        let user = user.map(|u| u.to_string()).unwrap_or_else(|| "-".to_string());
        self.line(&format!(
            "END peer={peer} user={user} batches={batches} elements={elements}"
        ));
    }
    fn rejected(&self, peer: &str, reason: &str) {
        self.line(&format!("REJECT peer={peer} reason={reason}"));
    }
}
