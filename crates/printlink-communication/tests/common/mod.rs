//! Shared test fixtures
#![allow(dead_code)]

use printlink_communication::Transport;
use printlink_core::{ConnectionError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory transport recording everything written to it
pub struct MockTransport {
    pub written: Arc<Mutex<Vec<String>>>,
    incoming: Mutex<VecDeque<String>>,
    open: AtomicBool,
    pub resets: AtomicUsize,
    pub fail_writes: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            written: Arc::new(Mutex::new(Vec::new())),
            incoming: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
            resets: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Queue a line for the reader
    pub fn push_incoming(&self, line: &str) {
        self.incoming.lock().unwrap().push_back(line.to_string());
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn last_written(&self) -> Option<String> {
        self.written.lock().unwrap().last().cloned()
    }

    pub fn write_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }
}

impl Transport for MockTransport {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotOpen {
                port: self.name(),
            }
            .into());
        }
        self.written
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(data).to_string());
        Ok(())
    }

    fn read_line(&self) -> Result<Option<String>> {
        let line = self.incoming.lock().unwrap().pop_front();
        if line.is_none() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(line)
    }

    fn reset_printer(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
