//! Host end of the guest's stdin/stdout.
//!
//! One [`RpcChannel`] drives one guest process from spawn to exit. It reads
//! stdout line by line, runs tool calls concurrently against the dispatcher,
//! writes results back in whatever order they finish, and resolves once with
//! the final text or an [`ExecutionError`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin};
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ExecutionError, ToolError};
use crate::protocol::{classify, Line, RpcMessage};
use crate::sandbox::{GuestProcess, GuestStdio};
use crate::tools::{ToolDescriptor, ToolDispatcher, ToolOutput};

/// Where the guest currently is in the user's script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// 1-based line in the user's script
    pub line: u64,
    pub total_lines: u64,
    /// Text of that line, when it is inside the script
    pub source: Option<String>,
}

/// Receives advisory events while a script runs.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &Progress);

    /// `send_update(...)` from the script
    fn on_update(&self, _message: &str) {}
}

/// Limits and hooks for one channel.
#[derive(Clone)]
pub struct ChannelOptions {
    /// Wall-clock ceiling for the whole execution
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL
    pub grace: Duration,
    pub cancel: CancellationToken,
    pub observer: Option<Arc<dyn ProgressObserver>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(270),
            grace: Duration::from_secs(5),
            cancel: CancellationToken::new(),
            observer: None,
        }
    }
}

/// In-flight host-side tool calls of one execution, keyed by request id.
#[derive(Default)]
struct PendingCallTable {
    in_flight: HashMap<String, AbortHandle>,
    seen: HashSet<String>,
}

impl PendingCallTable {
    /// Returns false for an id this execution has already used.
    fn admit(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    fn insert(&mut self, id: String, handle: AbortHandle) {
        self.in_flight.insert(id, handle);
    }

    fn remove(&mut self, id: &str) -> bool {
        self.in_flight.remove(id).is_some()
    }

    fn abort_all(&mut self) {
        for (id, handle) in self.in_flight.drain() {
            trace!(id = %id, "Aborting pending tool call");
            handle.abort();
        }
    }
}

/// Why the read loop stopped.
enum Stop {
    Complete(String),
    GuestError {
        message: String,
        traceback: Option<String>,
    },
    Eof,
    ReadFailed(std::io::Error),
    Cancelled,
    TimedOut,
}

pub struct RpcChannel {
    guest: GuestProcess,
    tools: HashSet<String>,
    dispatcher: Arc<dyn ToolDispatcher>,
    script_lines: Vec<String>,
    options: ChannelOptions,
}

impl RpcChannel {
    /// Bind a channel to a freshly spawned guest.
    ///
    /// `tools` is the pinned catalogue: calls to any other name are answered
    /// with an error result without reaching the dispatcher. `script` is the
    /// user's raw script, used to show the current line to the observer.
    pub fn new(
        guest: GuestProcess,
        tools: &[ToolDescriptor],
        dispatcher: Arc<dyn ToolDispatcher>,
        script: &str,
        options: ChannelOptions,
    ) -> Self {
        Self {
            guest,
            tools: tools.iter().map(|t| t.name.clone()).collect(),
            dispatcher,
            script_lines: script.lines().map(str::to_string).collect(),
            options,
        }
    }

    /// Drive the guest to completion.
    ///
    /// Resolves with console text plus the return value on `complete`. Any
    /// other ending (guest exception, abnormal exit, timeout, cancellation)
    /// is an error, and the guest is gone by the time this returns.
    pub async fn run(mut self) -> Result<String, ExecutionError> {
        let GuestStdio {
            stdin,
            stdout,
            stderr,
        } = self
            .guest
            .take_stdio()
            .ok_or_else(|| ExecutionError::Spawn("guest stdio already taken".into()))?;

        let stderr_task = tokio::spawn(collect_stderr(stderr));
        let mut stdin = Some(stdin);
        let mut lines = BufReader::new(stdout).lines();
        let mut console: Vec<String> = Vec::new();
        let mut pending = PendingCallTable::default();
        let mut calls: JoinSet<(String, RpcMessage)> = JoinSet::new();

        let cancel = self.options.cancel.clone();
        let deadline = tokio::time::sleep(self.options.timeout);
        tokio::pin!(deadline);

        let stop = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Stop::Cancelled,
                _ = &mut deadline => break Stop::TimedOut,

                Some(joined) = calls.join_next(), if !calls.is_empty() => {
                    let Ok((id, result)) = joined else {
                        continue;
                    };
                    if pending.remove(&id) {
                        send(&mut stdin, &result).await;
                    }
                }

                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break Stop::Eof,
                        Err(e) => break Stop::ReadFailed(e),
                    };
                    let message = match classify(&line) {
                        Line::Text(text) => {
                            trace!(text = %text, "Guest console output");
                            console.push(text);
                            continue;
                        }
                        Line::Message(message) => message,
                    };
                    debug!(message = ?message, "Guest message");

                    match message {
                        RpcMessage::ToolCall { id, tool, params } => {
                            if let Some(reply) =
                                self.start_call(&mut pending, &mut calls, id, tool, params)
                            {
                                send(&mut stdin, &reply).await;
                            }
                        }
                        RpcMessage::ExecutionProgress { line, total_lines } => {
                            self.report_progress(line, total_lines);
                        }
                        RpcMessage::Update { message } => {
                            if let Some(observer) = &self.options.observer {
                                observer.on_update(&message);
                            }
                        }
                        RpcMessage::Complete { output } => break Stop::Complete(output),
                        RpcMessage::Error { message, traceback } => {
                            break Stop::GuestError { message, traceback }
                        }
                        RpcMessage::ToolResult { id, .. } => {
                            warn!(id = %id, "Guest sent a tool_result, ignoring");
                        }
                    }
                }
            }
        };

        // Nothing is answered after the terminal event.
        pending.abort_all();
        calls.abort_all();
        drop(stdin.take());

        let grace = self.options.grace;
        let result = match stop {
            Stop::Complete(output) => {
                self.reap(grace).await;
                Ok(join_output(&console, &output))
            }
            Stop::GuestError { message, traceback } => {
                self.reap(grace).await;
                Err(ExecutionError::Guest { message, traceback })
            }
            Stop::Cancelled => {
                debug!("Execution cancelled, terminating guest");
                self.guest.terminate(grace).await;
                Err(ExecutionError::Cancelled)
            }
            Stop::TimedOut => {
                warn!(
                    timeout_secs = self.options.timeout.as_secs(),
                    "Execution timed out, terminating guest"
                );
                self.guest.terminate(grace).await;
                Err(ExecutionError::Timeout {
                    seconds: self.options.timeout.as_secs(),
                })
            }
            Stop::ReadFailed(e) => {
                self.guest.terminate(grace).await;
                Err(ExecutionError::Process(format!(
                    "failed to read guest output: {e}"
                )))
            }
            Stop::Eof => {
                let status = self.reap(grace).await;
                let stderr = stderr_text(stderr_task, grace).await;
                return Err(exit_error(status, &stderr, &console));
            }
        };

        stderr_task.abort();
        result
    }

    /// Start one tool call. Returns a reply to send right away when the call
    /// is answered without dispatching.
    fn start_call(
        &self,
        pending: &mut PendingCallTable,
        calls: &mut JoinSet<(String, RpcMessage)>,
        id: String,
        tool: String,
        params: Value,
    ) -> Option<RpcMessage> {
        if !pending.admit(&id) {
            warn!(id = %id, tool = %tool, "Duplicate tool call id, ignoring");
            return None;
        }

        if !self.tools.contains(&tool) {
            debug!(id = %id, tool = %tool, "Call to unknown tool");
            return Some(error_result(id, format!("Unknown tool: {tool}")));
        }

        debug!(id = %id, tool = %tool, "Dispatching tool call");
        let dispatcher = Arc::clone(&self.dispatcher);
        let name = tool.clone();
        let dispatch: JoinHandle<Result<ToolOutput, ToolError>> =
            tokio::spawn(async move { dispatcher.dispatch(&name, params).await });
        pending.insert(id.clone(), dispatch.abort_handle());

        calls.spawn(async move {
            let reply = match dispatch.await {
                Ok(Ok(output)) => RpcMessage::ToolResult {
                    id: id.clone(),
                    content: output.content,
                    error: output.error,
                },
                Ok(Err(e)) => error_result(id.clone(), e.message),
                Err(e) if e.is_panic() => {
                    warn!(id = %id, tool = %tool, "Tool dispatcher panicked");
                    error_result(id.clone(), format!("tool '{tool}' panicked"))
                }
                Err(_) => error_result(id.clone(), format!("tool '{tool}' was cancelled")),
            };
            (id, reply)
        });
        None
    }

    fn report_progress(&self, line: u64, total_lines: u64) {
        let Some(observer) = &self.options.observer else {
            return;
        };
        let source = usize::try_from(line)
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| self.script_lines.get(i))
            .cloned();
        observer.on_progress(&Progress {
            line,
            total_lines,
            source,
        });
    }

    /// Wait for an exiting guest, terminating it if it lingers.
    async fn reap(&mut self, grace: Duration) -> Option<std::process::ExitStatus> {
        match tokio::time::timeout(grace, self.guest.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait for guest");
                None
            }
            Err(_) => {
                debug!("Guest still running after its result, terminating");
                self.guest.terminate(grace).await;
                None
            }
        }
    }
}

fn error_result(id: String, message: String) -> RpcMessage {
    RpcMessage::ToolResult {
        id,
        content: Vec::new(),
        error: Some(message),
    }
}

/// Write one message to the guest. A closed stdin is logged and dropped;
/// the read loop notices the guest going away on its own.
async fn send(stdin: &mut Option<ChildStdin>, message: &RpcMessage) {
    let Some(writer) = stdin.as_mut() else {
        return;
    };
    let line = match message.to_line() {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "Failed to encode message for guest");
            return;
        }
    };
    let written = async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }
    .await;
    if let Err(e) = written {
        warn!(error = %e, "Failed to write to guest stdin");
        *stdin = None;
    }
}

async fn collect_stderr(mut stderr: ChildStderr) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        debug!(error = %e, "Failed to read guest stderr");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn stderr_text(task: JoinHandle<String>, grace: Duration) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            abort.abort();
            String::new()
        }
    }
}

/// Console text first, then the return value, separated by a newline.
fn join_output(console: &[String], output: &str) -> String {
    let console = console.join("\n");
    match (console.is_empty(), output.is_empty()) {
        (true, _) => output.to_string(),
        (false, true) => console,
        (false, false) => format!("{console}\n{output}"),
    }
}

/// Error for a guest that stopped without a terminal message.
fn exit_error(
    status: Option<std::process::ExitStatus>,
    stderr: &str,
    console: &[String],
) -> ExecutionError {
    let stderr = stderr.trim();
    let detail = if !stderr.is_empty() {
        Some(stderr.to_string())
    } else if !console.is_empty() {
        Some(console.join("\n"))
    } else {
        None
    };

    match status.and_then(|s| s.code()) {
        Some(0) => ExecutionError::Process(match detail {
            Some(detail) => format!("guest exited without reporting a result: {detail}"),
            None => "guest exited without reporting a result".to_string(),
        }),
        Some(code) => {
            ExecutionError::Process(detail.unwrap_or_else(|| format!("exited with code {code}")))
        }
        None => ExecutionError::Process(match detail {
            Some(detail) => format!("guest terminated by signal: {detail}"),
            None => "guest terminated by signal".to_string(),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::process::Command;

    use crate::tools::FnDispatcher;

    fn guest(script: &str) -> GuestProcess {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        GuestProcess::spawn(cmd, None).unwrap()
    }

    fn tools(names: &[&str]) -> Vec<ToolDescriptor> {
        names
            .iter()
            .map(|n| ToolDescriptor::new(*n, "", json!({"type": "object"})))
            .collect()
    }

    fn echo_dispatcher() -> Arc<dyn ToolDispatcher> {
        Arc::new(
            FnDispatcher::new()
                .with_tool("t", |params| Ok(ToolOutput::text(format!("ok {}", params["x"]))))
                .with_tool("fails", |_| Err(ToolError::new("disk full"))),
        )
    }

    fn channel(script: &str, names: &[&str]) -> RpcChannel {
        RpcChannel::new(
            guest(script),
            &tools(names),
            echo_dispatcher(),
            "",
            ChannelOptions::default(),
        )
    }

    #[tokio::test]
    async fn console_text_precedes_the_return_value() {
        let out = channel(
            r#"echo hello; echo 'not {json'; echo '{"type":"complete","output":"2"}'"#,
            &[],
        )
        .run()
        .await
        .unwrap();
        assert_eq!(out, "hello\nnot {json\n2");
    }

    #[tokio::test]
    async fn tool_call_round_trip() {
        let script = r#"
echo '{"type":"tool_call","id":"a","tool":"t","params":{"x":1}}'
read reply
echo "reply: $reply"
echo '{"type":"complete","output":"done"}'
"#;
        let out = channel(script, &["t"]).run().await.unwrap();
        assert!(out.contains(r#""id":"a""#), "{out}");
        assert!(out.contains(r#""text":"ok 1""#), "{out}");
        assert!(!out.contains("error"), "{out}");
        assert!(out.ends_with("\ndone"));
    }

    #[tokio::test]
    async fn unknown_tool_is_answered_with_an_error() {
        let script = r#"
echo '{"type":"tool_call","id":"a","tool":"nope","params":{}}'
read reply
echo "reply: $reply"
echo '{"type":"complete","output":""}'
"#;
        let out = channel(script, &["t"]).run().await.unwrap();
        assert!(out.contains(r#""error":"Unknown tool: nope""#), "{out}");
        assert!(out.contains(r#""content":[]"#), "{out}");
    }

    #[tokio::test]
    async fn dispatch_failure_becomes_result_error() {
        let script = r#"
echo '{"type":"tool_call","id":"a","tool":"fails","params":{}}'
read reply
echo "reply: $reply"
echo '{"type":"complete","output":""}'
"#;
        let out = channel(script, &["fails"]).run().await.unwrap();
        assert!(out.contains(r#""error":"disk full""#), "{out}");
    }

    struct SlowDispatcher;

    #[async_trait]
    impl ToolDispatcher for SlowDispatcher {
        async fn dispatch(&self, _name: &str, params: Value) -> Result<ToolOutput, ToolError> {
            let ms = params["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ToolOutput::text(format!("slept {ms}")))
        }
    }

    #[tokio::test]
    async fn results_are_correlated_by_id_not_order() {
        let script = r#"
echo '{"type":"tool_call","id":"slow","tool":"sleep","params":{"ms":400}}'
echo '{"type":"tool_call","id":"fast","tool":"sleep","params":{"ms":10}}'
read first
read second
echo "first: $first"
echo "second: $second"
echo '{"type":"complete","output":""}'
"#;
        let out = RpcChannel::new(
            guest(script),
            &tools(&["sleep"]),
            Arc::new(SlowDispatcher),
            "",
            ChannelOptions::default(),
        )
        .run()
        .await
        .unwrap();
        let first = out.lines().find(|l| l.starts_with("first:")).unwrap();
        let second = out.lines().find(|l| l.starts_with("second:")).unwrap();
        assert!(first.contains(r#""id":"fast""#), "{out}");
        assert!(second.contains(r#""id":"slow""#), "{out}");
    }

    #[tokio::test]
    async fn guest_error_carries_traceback() {
        let err = channel(
            r#"echo '{"type":"error","message":"boom","traceback":"Traceback: line 1"}'"#,
            &[],
        )
        .run()
        .await
        .unwrap_err();
        assert_eq!(
            err,
            ExecutionError::Guest {
                message: "boom".into(),
                traceback: Some("Traceback: line 1".into())
            }
        );
    }

    #[tokio::test]
    async fn abnormal_exit_uses_stderr() {
        let err = channel("echo 'it broke' >&2; exit 2", &[])
            .run()
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::Process("it broke".into()));
    }

    #[tokio::test]
    async fn abnormal_exit_without_stderr_reports_code() {
        let err = channel("exit 3", &[]).run().await.unwrap_err();
        assert_eq!(err, ExecutionError::Process("exited with code 3".into()));
    }

    #[tokio::test]
    async fn clean_exit_without_result_is_an_error() {
        let err = channel("echo partial", &[]).run().await.unwrap_err();
        assert!(
            matches!(&err, ExecutionError::Process(m) if m.contains("without reporting a result")),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn only_the_first_terminal_message_counts() {
        let out = channel(
            r#"echo '{"type":"complete","output":"one"}'; echo '{"type":"error","message":"two"}'"#,
            &[],
        )
        .run()
        .await
        .unwrap();
        assert_eq!(out, "one");
    }

    #[tokio::test]
    async fn timeout_terminates_the_guest() {
        let options = ChannelOptions {
            timeout: Duration::from_millis(300),
            grace: Duration::from_secs(1),
            ..ChannelOptions::default()
        };
        let started = Instant::now();
        let err = RpcChannel::new(guest("sleep 30"), &[], echo_dispatcher(), "", options)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_execution() {
        let cancel = CancellationToken::new();
        let options = ChannelOptions {
            cancel: cancel.clone(),
            ..ChannelOptions::default()
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
            // Second request is a no-op
            trigger.cancel();
        });

        let started = Instant::now();
        let err = RpcChannel::new(guest("sleep 30"), &[], echo_dispatcher(), "", options)
            .run()
            .await
            .unwrap_err();
        assert_eq!(err, ExecutionError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<Progress>>,
        updates: Mutex<Vec<String>>,
    }

    impl ProgressObserver for Recorder {
        fn on_progress(&self, progress: &Progress) {
            self.progress.lock().unwrap().push(progress.clone());
        }

        fn on_update(&self, message: &str) {
            self.updates.lock().unwrap().push(message.to_string());
        }
    }

    #[tokio::test]
    async fn progress_and_updates_reach_the_observer() {
        let recorder = Arc::new(Recorder::default());
        let options = ChannelOptions {
            observer: Some(recorder.clone()),
            ..ChannelOptions::default()
        };
        let script = r#"
echo '{"type":"execution_progress","line":2,"total_lines":2}'
echo '{"type":"update","message":"halfway"}'
echo '{"type":"complete","output":"x"}'
"#;
        let channel = RpcChannel::new(
            guest(script),
            &[],
            echo_dispatcher(),
            "a = 1\nreturn a",
            options,
        );
        channel.run().await.unwrap();

        assert_eq!(
            recorder.progress.lock().unwrap().as_slice(),
            &[Progress {
                line: 2,
                total_lines: 2,
                source: Some("return a".into())
            }]
        );
        assert_eq!(recorder.updates.lock().unwrap().as_slice(), &["halfway"]);
    }

    #[test]
    fn duplicate_ids_are_not_admitted_twice() {
        let mut table = PendingCallTable::default();
        assert!(table.admit("a"));
        assert!(!table.admit("a"));
        assert!(!table.remove("a"));
    }
}
