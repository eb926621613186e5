//! Scripted in-process PBX for tests
//!
//! Implements the full challenge/login handshake and validates cookies, so
//! session handling can be exercised without a device.

use crate::client::{challenge_token, PbxApi, PbxEndpoint};
use async_trait::async_trait;
use bytes::Bytes;
use callscope_common::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const CHALLENGE: &str = "0000001652";

/// Mock UCM
pub struct MockPbx {
    password: String,
    login_delay: Duration,
    logins: AtomicUsize,
    downloads: AtomicUsize,
    cookies: Mutex<HashSet<String>>,
    reject_sessions: AtomicBool,
    fail_downloads: AtomicBool,
    fail_fetch: AtomicBool,
    cdr_root: Mutex<Value>,
    recordings: Mutex<HashMap<(String, String), Bytes>>,
    windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
}

impl MockPbx {
    /// A PBX that accepts `password` for any user
    pub fn new(password: &str) -> Self {
        Self {
            password: password.to_string(),
            login_delay: Duration::ZERO,
            logins: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            cookies: Mutex::new(HashSet::new()),
            reject_sessions: AtomicBool::new(false),
            fail_downloads: AtomicBool::new(false),
            fail_fetch: AtomicBool::new(false),
            cdr_root: Mutex::new(Value::Array(Vec::new())),
            recordings: Mutex::new(HashMap::new()),
            windows: Mutex::new(Vec::new()),
        }
    }

    /// Slow down logins to widen race windows
    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = delay;
        self
    }

    /// Successful logins so far
    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Recording download attempts so far
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Forget every issued cookie, as the device does after its session window
    pub fn expire_sessions(&self) {
        lock(&self.cookies).clear();
    }

    /// Answer every session-bearing request with "session expired"
    pub fn reject_all_sessions(&self, reject: bool) {
        self.reject_sessions.store(reject, Ordering::SeqCst);
    }

    /// Make recording downloads fail with a network error
    pub fn fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    /// Make CDR fetches fail with a network error
    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Replace the `cdr_root` returned by fetches
    pub fn set_cdrs(&self, cdr_root: Value) {
        *lock(&self.cdr_root) = cdr_root;
    }

    /// Serve `bytes` for `dir/filename`
    pub fn add_recording(&self, dir: &str, filename: &str, bytes: Bytes) {
        lock(&self.recordings).insert((dir.to_string(), filename.to_string()), bytes);
    }

    /// Time windows requested through `fetch_cdrs`
    pub fn requested_windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        lock(&self.windows).clone()
    }

    fn check_cookie(&self, cookie: &str) -> Result<()> {
        if self.reject_sessions.load(Ordering::SeqCst) || !lock(&self.cookies).contains(cookie) {
            return Err(AppError::SessionExpired);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl PbxApi for MockPbx {
    async fn challenge(&self, _endpoint: &PbxEndpoint) -> Result<String> {
        Ok(CHALLENGE.to_string())
    }

    async fn login(&self, _endpoint: &PbxEndpoint, token: &str) -> Result<String> {
        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }

        if token != challenge_token(CHALLENGE, &self.password) {
            return Err(AppError::PbxAuth {
                message: "login rejected (-37): wrong account or password".into(),
            });
        }

        let n = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let cookie = format!("sid{}", n);
        lock(&self.cookies).insert(cookie.clone());
        Ok(cookie)
    }

    async fn fetch_cdrs(
        &self,
        _endpoint: &PbxEndpoint,
        cookie: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Value> {
        self.check_cookie(cookie)?;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(AppError::upstream("pbx", "connection reset"));
        }

        lock(&self.windows).push((start, end));
        Ok(lock(&self.cdr_root).clone())
    }

    async fn download_recording(
        &self,
        _endpoint: &PbxEndpoint,
        cookie: &str,
        dir: &str,
        filename: &str,
    ) -> Result<Bytes> {
        self.check_cookie(cookie)?;
        self.downloads.fetch_add(1, Ordering::SeqCst);

        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(AppError::upstream("pbx", "connection reset"));
        }

        lock(&self.recordings)
            .get(&(dir.to_string(), filename.to_string()))
            .cloned()
            .ok_or_else(|| AppError::RecordingUnavailable {
                reference: format!("{}/{}", dir, filename),
                message: "no such file".into(),
            })
    }
}
