use crate::{ConsoleChannel, ConsoleConnector, ReadOutcome, VmError};
use std::time::Duration;
use tracing::{debug, error, info, trace};
use vjunos_core::{CommandStep, Pattern, Script};

/// Line terminator the appliance console expects.
pub const LINE_END: &str = "\r";

/// Send/expect adapter over a console connector.
///
/// The channel is opened lazily on first use. After [`ExpectEngine::close`],
/// the next operation reconnects and sends a bare line end first so the
/// appliance redraws its prompt for the new session.
pub struct ExpectEngine<K: ConsoleConnector> {
    connector: K,
    channel: Option<K::Channel>,
    default_timeout: Duration,
    wake_on_open: bool,
}

impl<K: ConsoleConnector> ExpectEngine<K> {
    pub fn new(connector: K, default_timeout: Duration) -> Self {
        Self {
            connector,
            channel: None,
            default_timeout,
            wake_on_open: false,
        }
    }

    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    async fn channel(&mut self) -> Result<&mut K::Channel, VmError> {
        if self.channel.is_none() {
            let mut channel = self.connector.open().await?;
            if self.wake_on_open {
                trace!("waking console after reconnect");
                channel.write(LINE_END.as_bytes()).await?;
                self.wake_on_open = false;
            }
            self.channel = Some(channel);
        }

        self.channel
            .as_mut()
            .ok_or_else(|| VmError::Console("console channel not open".into()))
    }

    /// Write `text` followed by the line terminator.
    ///
    /// # Errors
    /// Returns `VmError` if the console cannot be opened or written.
    pub async fn send(&mut self, text: &str) -> Result<(), VmError> {
        self.write_line(text, text).await
    }

    async fn write_line(&mut self, text: &str, shown: &str) -> Result<(), VmError> {
        debug!(line = shown, "writing to console");
        let line = format!("{text}{LINE_END}");
        self.channel().await?.write(line.as_bytes()).await
    }

    /// Wait for `prompt`, then write `text`.
    ///
    /// The prompt guards the write: the appliance only accepts the next line
    /// once it has printed the prompt for it.
    ///
    /// # Errors
    /// Returns `VmError::ExpectTimeout` if `prompt` is not seen within the
    /// timeout (the engine default when `None`), or a console error.
    pub async fn send_and_wait(
        &mut self,
        text: &str,
        prompt: &Pattern,
        timeout: Option<Duration>,
    ) -> Result<(), VmError> {
        self.expect(prompt, timeout).await?;
        self.send(text).await
    }

    /// Block until `prompt` appears.
    ///
    /// # Errors
    /// Returns `VmError::ExpectTimeout` when the prompt is not seen in time.
    pub async fn expect(
        &mut self,
        prompt: &Pattern,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, VmError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        trace!(%prompt, ?timeout, "waiting for prompt");

        let outcome = self
            .channel()
            .await?
            .read_matching(std::slice::from_ref(prompt), timeout)
            .await?;
        log_output(&outcome.data);

        if outcome.is_match() {
            Ok(outcome.data)
        } else {
            Err(VmError::ExpectTimeout {
                prompt: prompt.to_string(),
                timeout,
            })
        }
    }

    /// Wait for any of `patterns`, returning what matched and everything read.
    ///
    /// # Errors
    /// Returns `VmError` if the console cannot be opened or read.
    pub async fn read_until(
        &mut self,
        patterns: &[Pattern],
        timeout: Duration,
    ) -> Result<ReadOutcome, VmError> {
        self.channel().await?.read_matching(patterns, timeout).await
    }

    /// Execute one script step.
    ///
    /// # Errors
    /// Propagates `VmError::ExpectTimeout` and console errors.
    pub async fn run_step(&mut self, step: &CommandStep) -> Result<(), VmError> {
        if let Some(prompt) = &step.wait_for {
            self.expect(prompt, step.timeout).await?;
        }
        self.write_line(&step.text, step.display_text()).await
    }

    /// Execute every step of `script` in order, stopping at the first failure.
    ///
    /// # Errors
    /// Returns the first step error; the remaining steps are not attempted.
    pub async fn run_script(&mut self, script: &Script) -> Result<(), VmError> {
        info!(script = %script.name, steps = script.step_count(), "running console script");

        for (stage, step) in script.steps() {
            if let Err(e) = self.run_step(step).await {
                error!(
                    script = %script.name,
                    stage = %stage.name,
                    line = step.display_text(),
                    error = %e,
                    "console script aborted"
                );
                return Err(e);
            }
        }

        Ok(())
    }

    /// Release the console. A later operation reconnects.
    ///
    /// # Errors
    /// Returns `VmError` if the channel fails to shut down cleanly.
    pub async fn close(&mut self) -> Result<(), VmError> {
        if let Some(mut channel) = self.channel.take() {
            self.wake_on_open = true;
            channel.close().await?;
        }
        Ok(())
    }

    /// Forget the current channel without a clean shutdown, e.g. after the
    /// peer went away.
    pub fn discard(&mut self) {
        if self.channel.take().is_some() {
            self.wake_on_open = true;
        }
    }
}

pub(crate) fn log_output(data: &[u8]) {
    if data.is_empty() || !tracing::enabled!(tracing::Level::TRACE) {
        return;
    }
    let clean = strip_ansi_escapes::strip(data);
    trace!(output = %String::from_utf8_lossy(&clean), "console output");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ConsoleEvent, FakeConsole};

    #[tokio::test]
    async fn test_send_appends_line_end() {
        let console = FakeConsole::new();
        let mut engine = ExpectEngine::new(console.clone(), Duration::from_secs(1));

        engine.send("show version").await.unwrap();

        assert_eq!(
            console.events(),
            vec![
                ConsoleEvent::Open,
                ConsoleEvent::Write("show version".into())
            ]
        );
    }

    #[tokio::test]
    async fn test_send_and_wait_waits_before_writing() {
        let console = FakeConsole::auto_prompt();
        let mut engine = ExpectEngine::new(console.clone(), Duration::from_secs(1));

        engine
            .send_and_wait("configure", &Pattern::literal(">"), None)
            .await
            .unwrap();

        assert_eq!(
            console.events(),
            vec![
                ConsoleEvent::Open,
                ConsoleEvent::Wait(vec![">".into()]),
                ConsoleEvent::Write("configure".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_send_and_wait_times_out() {
        let console = FakeConsole::new();
        console.push_output(b"root> ");
        let mut engine = ExpectEngine::new(console.clone(), Duration::from_millis(10));

        let err = engine
            .send_and_wait("commit", &Pattern::literal("#"), None)
            .await
            .unwrap_err();

        match err {
            VmError::ExpectTimeout { prompt, timeout } => {
                assert_eq!(prompt, "\"#\"");
                assert_eq!(timeout, Duration::from_millis(10));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(console.writes().is_empty());
    }

    #[tokio::test]
    async fn test_read_until_reports_match_index() {
        let console = FakeConsole::new();
        console.push_output(b"Amnesiac (ttyu0)\r\n\r\nlogin: ");
        let mut engine = ExpectEngine::new(console, Duration::from_secs(1));

        let out = engine
            .read_until(
                &[Pattern::literal("Password:"), Pattern::literal("login:")],
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(out.matched, Some(1));
        assert!(out.data.ends_with(b"login:"));
    }

    #[tokio::test]
    async fn test_script_stops_at_first_failure() {
        let console = FakeConsole::new();
        console.push_output(b"#");
        let mut engine = ExpectEngine::new(console.clone(), Duration::from_millis(10));

        let script = Script::new("partial")
            .stage("one", [CommandStep::after("#", "cli")])
            .stage("two", [CommandStep::after(">", "configure")])
            .stage("three", [CommandStep::send("never")]);

        let err = engine.run_script(&script).await.unwrap_err();
        assert!(matches!(err, VmError::ExpectTimeout { .. }));
        assert_eq!(console.writes(), vec!["cli".to_string()]);
    }

    #[tokio::test]
    async fn test_reopen_after_close_wakes_console() {
        let console = FakeConsole::new();
        let mut engine = ExpectEngine::new(console.clone(), Duration::from_secs(1));

        engine.send("first").await.unwrap();
        engine.close().await.unwrap();
        assert!(!engine.is_open());
        engine.send("second").await.unwrap();

        assert_eq!(
            console.events(),
            vec![
                ConsoleEvent::Open,
                ConsoleEvent::Write("first".into()),
                ConsoleEvent::Close,
                ConsoleEvent::Open,
                ConsoleEvent::Write(String::new()),
                ConsoleEvent::Write("second".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let console = FakeConsole::new();
        console.refuse_opens(1);
        let mut engine = ExpectEngine::new(console, Duration::from_secs(1));

        let err = engine.send("cli").await.unwrap_err();
        assert!(err.is_console_gone());
        assert!(!engine.is_open());
    }
}
