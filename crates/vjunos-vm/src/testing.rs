//! In-memory stand-ins for the console and the VM used by unit tests.

use crate::{ApplianceLifecycle, ConsoleChannel, ConsoleConnector, ReadOutcome, VmError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vjunos_core::{Pattern, find_first};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Open,
    Close,
    /// A line written, without its trailing carriage return.
    Write(String),
    /// A wait for the listed patterns.
    Wait(Vec<String>),
}

#[derive(Default)]
struct FakeState {
    events: Vec<ConsoleEvent>,
    chunks: VecDeque<Vec<u8>>,
    buffer: Vec<u8>,
    auto_prompt: bool,
    refuse_opens: usize,
}

/// Scriptable console.
///
/// Each read pops one scripted chunk into the receive buffer. When no chunks
/// are left and `auto_prompt` is on, the first awaited literal pattern is
/// "printed" immediately, so scripts run to completion without a real device.
#[derive(Clone, Default)]
pub struct FakeConsole {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn auto_prompt() -> Self {
        let console = Self::new();
        console.lock().auto_prompt = true;
        console
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn push_output(&self, chunk: &[u8]) {
        self.lock().chunks.push_back(chunk.to_vec());
    }

    pub fn push_silence(&self, cycles: usize) {
        let mut state = self.lock();
        for _ in 0..cycles {
            state.chunks.push_back(Vec::new());
        }
    }

    pub fn refuse_opens(&self, count: usize) {
        self.lock().refuse_opens = count;
    }

    pub fn events(&self) -> Vec<ConsoleEvent> {
        self.lock().events.clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.lock()
            .events
            .iter()
            .filter_map(|e| match e {
                ConsoleEvent::Write(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    /// Pairs of (awaited prompt, line written after it) for prompt-guarded writes.
    pub fn guarded_writes(&self) -> Vec<(Option<String>, String)> {
        let state = self.lock();
        let mut out = Vec::new();
        let mut pending: Option<String> = None;
        for event in &state.events {
            match event {
                ConsoleEvent::Wait(patterns) => pending = patterns.first().cloned(),
                ConsoleEvent::Write(line) => out.push((pending.take(), line.clone())),
                _ => {}
            }
        }
        out
    }
}

impl ConsoleConnector for FakeConsole {
    type Channel = FakeConsole;

    async fn open(&self) -> Result<Self::Channel, VmError> {
        let mut state = self.lock();
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(VmError::ConsoleUnavailable("connection refused".into()));
        }
        state.events.push(ConsoleEvent::Open);
        Ok(self.clone())
    }
}

impl ConsoleChannel for FakeConsole {
    async fn write(&mut self, data: &[u8]) -> Result<(), VmError> {
        let text = String::from_utf8_lossy(data);
        let line = text.strip_suffix('\r').unwrap_or(&text).to_string();
        self.lock().events.push(ConsoleEvent::Write(line));
        Ok(())
    }

    async fn read_matching(
        &mut self,
        patterns: &[Pattern],
        _timeout: Duration,
    ) -> Result<ReadOutcome, VmError> {
        let mut state = self.lock();
        state.events.push(ConsoleEvent::Wait(
            patterns.iter().map(|p| p.as_str().to_string()).collect(),
        ));

        if let Some(chunk) = state.chunks.pop_front() {
            state.buffer.extend_from_slice(&chunk);
        } else if state.auto_prompt
            && let Some(Pattern::Literal(prompt)) = patterns.first()
        {
            let prompt = prompt.clone();
            state.buffer.extend_from_slice(prompt.as_bytes());
        }

        if let Some((idx, range)) = find_first(patterns, &state.buffer) {
            let data = state.buffer.drain(..range.end).collect();
            return Ok(ReadOutcome {
                matched: Some(idx),
                data,
            });
        }

        Ok(ReadOutcome {
            matched: None,
            data: std::mem::take(&mut state.buffer),
        })
    }

    async fn close(&mut self) -> Result<(), VmError> {
        let mut state = self.lock();
        state.buffer.clear();
        state.events.push(ConsoleEvent::Close);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCall {
    Start,
    Stop,
}

#[derive(Clone, Default)]
pub struct FakeLifecycle {
    calls: Arc<Mutex<Vec<LifecycleCall>>>,
}

impl FakeLifecycle {
    pub fn calls(&self) -> Vec<LifecycleCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: LifecycleCall) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }
}

impl ApplianceLifecycle for FakeLifecycle {
    async fn start(&mut self) -> Result<(), VmError> {
        self.calls.lock().unwrap().push(LifecycleCall::Start);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), VmError> {
        self.calls.lock().unwrap().push(LifecycleCall::Stop);
        Ok(())
    }
}
