//! Relay turn: start an assistant run for one inbound text, poll it to a terminal status,
//! and pick the reply out of the thread.
//!
//! [`get_reply`] never fails; every error is logged and replaced by a fixed fallback so
//! the outbound channel always has something to send.

use crate::llm::{AssistantBackend, AssistantError, MessageRole, Run, RunStatus, ThreadMessage};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sent when the thread holds no usable assistant text.
pub const NO_ADVICE_FALLBACK: &str =
    "I'm having trouble generating travel advice right now. Could you try rephrasing your question?";

/// Sent when the assistant could not be reached or the run did not complete.
pub const CONNECTION_FALLBACK: &str =
    "I'm having trouble connecting to my travel knowledge. Please try again shortly.";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("message text is empty")]
    EmptyMessage,
    #[error(transparent)]
    Provider(#[from] AssistantError),
    #[error("assistant run ended with status {0}")]
    JobTerminatedAbnormally(RunStatus),
    #[error("assistant run still not finished after {attempts} status checks")]
    PollTimeout { attempts: u32 },
    #[error("assistant run polling cancelled")]
    Cancelled,
}

/// Fixed-interval polling bounds.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 60,
        }
    }
}

impl From<&crate::config::AssistantConfig> for PollPolicy {
    fn from(c: &crate::config::AssistantConfig) -> Self {
        Self {
            interval: c.poll_interval(),
            max_attempts: c.max_poll_attempts.max(1),
        }
    }
}

/// Thread and run created for one inbound message.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub thread_id: String,
    pub run_id: String,
}

/// Create a fresh thread, add the user's text, and start a run with `assistant_id`.
pub async fn start_run(
    backend: &dyn AssistantBackend,
    assistant_id: &str,
    text: &str,
) -> Result<RunHandle, RelayError> {
    if text.trim().is_empty() {
        return Err(RelayError::EmptyMessage);
    }
    let thread = backend.create_thread().await?;
    backend.add_user_message(&thread.id, text).await?;
    let run = backend.create_run(&thread.id, assistant_id).await?;
    log::debug!(
        "assistant: started run {} on thread {} ({})",
        run.id,
        thread.id,
        run.status
    );
    Ok(RunHandle {
        thread_id: thread.id,
        run_id: run.id,
    })
}

/// Poll the run until it completes. Abnormal terminal statuses, exhausting
/// `policy.max_attempts`, or `cancel` firing during a wait end the loop with an error.
pub async fn wait_for_completion(
    backend: &dyn AssistantBackend,
    handle: &RunHandle,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<Run, RelayError> {
    let mut attempts = 0;
    loop {
        let run = backend
            .retrieve_run(&handle.thread_id, &handle.run_id)
            .await?;
        attempts += 1;
        if run.status == RunStatus::Completed {
            log::debug!(
                "assistant: run {} completed after {} status checks",
                run.id,
                attempts
            );
            return Ok(run);
        }
        if run.status.is_abnormal_end() {
            if let Some(ref e) = run.last_error {
                log::warn!(
                    "assistant: run {} {}: {} {}",
                    run.id,
                    run.status,
                    e.code.as_deref().unwrap_or("-"),
                    e.message.as_deref().unwrap_or("")
                );
            }
            return Err(RelayError::JobTerminatedAbnormally(run.status));
        }
        if attempts >= policy.max_attempts {
            return Err(RelayError::PollTimeout { attempts });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

/// Text of the newest assistant message, or [`NO_ADVICE_FALLBACK`].
///
/// `messages` is in provider order (newest first); on equal timestamps the earlier
/// entry wins. Only the first content block is considered.
pub fn extract_reply(messages: &[ThreadMessage]) -> String {
    let latest = messages
        .iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .fold(None::<&ThreadMessage>, |best, m| match best {
            Some(b) if b.created_at >= m.created_at => Some(b),
            _ => Some(m),
        });
    latest
        .and_then(ThreadMessage::first_text)
        .map(str::to_string)
        .unwrap_or_else(|| NO_ADVICE_FALLBACK.to_string())
}

/// Run the whole exchange, propagating the first failure.
pub async fn try_get_reply(
    backend: &dyn AssistantBackend,
    assistant_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    text: &str,
) -> Result<String, RelayError> {
    let handle = start_run(backend, assistant_id, text).await?;
    wait_for_completion(backend, &handle, policy, cancel).await?;
    let messages = backend.list_messages(&handle.thread_id).await?;
    Ok(extract_reply(&messages))
}

/// Reply for `text`: the assistant's answer, or one of the two fixed fallbacks.
pub async fn get_reply(
    backend: &dyn AssistantBackend,
    assistant_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    text: &str,
) -> String {
    match try_get_reply(backend, assistant_id, policy, cancel, text).await {
        Ok(reply) if !reply.trim().is_empty() => reply,
        Ok(_) => {
            log::warn!("assistant: reply text was empty");
            NO_ADVICE_FALLBACK.to_string()
        }
        Err(e) => {
            log::error!("assistant: {}", e);
            CONNECTION_FALLBACK.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentBlock, TextContent, Thread};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Scripted provider: run statuses are served in order, the last one repeats.
    struct FakeAssistant {
        statuses: Mutex<VecDeque<RunStatus>>,
        messages: Vec<ThreadMessage>,
        retrieve_calls: Mutex<u32>,
        user_texts: Mutex<Vec<String>>,
        fail_create_thread: bool,
    }

    impl FakeAssistant {
        fn new(statuses: &[RunStatus], messages: Vec<ThreadMessage>) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                messages,
                retrieve_calls: Mutex::new(0),
                user_texts: Mutex::new(Vec::new()),
                fail_create_thread: false,
            }
        }

        fn retrieve_calls(&self) -> u32 {
            *self.retrieve_calls.lock().unwrap()
        }
    }

    fn run(status: RunStatus) -> Run {
        Run {
            id: "run_1".to_string(),
            thread_id: "thread_1".to_string(),
            status,
            last_error: None,
        }
    }

    #[async_trait]
    impl AssistantBackend for FakeAssistant {
        async fn create_thread(&self) -> Result<Thread, AssistantError> {
            if self.fail_create_thread {
                return Err(AssistantError::Api("503 Service Unavailable".to_string()));
            }
            Ok(Thread {
                id: "thread_1".to_string(),
            })
        }

        async fn add_user_message(
            &self,
            _thread_id: &str,
            text: &str,
        ) -> Result<ThreadMessage, AssistantError> {
            self.user_texts.lock().unwrap().push(text.to_string());
            Ok(message("msg_user", MessageRole::User, 1, text))
        }

        async fn create_run(&self, _thread_id: &str, _assistant_id: &str) -> Result<Run, AssistantError> {
            Ok(run(RunStatus::Queued))
        }

        async fn retrieve_run(&self, _thread_id: &str, _run_id: &str) -> Result<Run, AssistantError> {
            *self.retrieve_calls.lock().unwrap() += 1;
            let mut q = self.statuses.lock().unwrap();
            let status = if q.len() > 1 {
                q.pop_front().unwrap()
            } else {
                *q.front().unwrap()
            };
            Ok(run(status))
        }

        async fn list_messages(&self, _thread_id: &str) -> Result<Vec<ThreadMessage>, AssistantError> {
            Ok(self.messages.clone())
        }
    }

    fn message(id: &str, role: MessageRole, created_at: i64, text: &str) -> ThreadMessage {
        ThreadMessage {
            id: id.to_string(),
            role,
            created_at,
            content: vec![ContentBlock::Text {
                text: TextContent {
                    value: text.to_string(),
                },
            }],
        }
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(10),
            max_attempts: 10,
        }
    }

    #[test]
    fn extract_single_assistant_message() {
        let messages = vec![
            message("m2", MessageRole::Assistant, 20, "X"),
            message("m1", MessageRole::User, 10, "hello"),
        ];
        assert_eq!(extract_reply(&messages), "X");
    }

    #[test]
    fn extract_picks_latest_assistant_regardless_of_order() {
        let messages = vec![
            message("m1", MessageRole::Assistant, 10, "A"),
            message("m0", MessageRole::User, 5, "q"),
            message("m2", MessageRole::Assistant, 20, "B"),
        ];
        assert_eq!(extract_reply(&messages), "B");
    }

    #[test]
    fn extract_tie_prefers_first_listed() {
        let messages = vec![
            message("m2", MessageRole::Assistant, 20, "newest by list"),
            message("m1", MessageRole::Assistant, 20, "older by list"),
        ];
        assert_eq!(extract_reply(&messages), "newest by list");
    }

    #[test]
    fn extract_without_assistant_message_falls_back() {
        let messages = vec![message("m1", MessageRole::User, 10, "hello")];
        assert_eq!(extract_reply(&messages), NO_ADVICE_FALLBACK);
        assert_eq!(extract_reply(&[]), NO_ADVICE_FALLBACK);
    }

    #[test]
    fn extract_non_text_first_block_falls_back() {
        let mut m = message("m1", MessageRole::Assistant, 10, "ignored");
        m.content.insert(0, ContentBlock::Other);
        assert_eq!(extract_reply(&[m]), NO_ADVICE_FALLBACK);
    }

    #[test]
    fn extract_empty_content_falls_back() {
        let mut m = message("m1", MessageRole::Assistant, 10, "ignored");
        m.content.clear();
        assert_eq!(extract_reply(&[m]), NO_ADVICE_FALLBACK);
    }

    #[tokio::test]
    async fn poller_checks_status_until_completed() {
        let backend = FakeAssistant::new(
            &[
                RunStatus::Queued,
                RunStatus::InProgress,
                RunStatus::InProgress,
                RunStatus::Completed,
            ],
            Vec::new(),
        );
        let handle = RunHandle {
            thread_id: "thread_1".to_string(),
            run_id: "run_1".to_string(),
        };
        let policy = fast_policy();
        let started = Instant::now();
        let run = wait_for_completion(&backend, &handle, &policy, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(backend.retrieve_calls(), 4);
        assert!(started.elapsed() >= policy.interval * 3);
    }

    #[tokio::test]
    async fn poller_stops_on_failed_status() {
        let backend = FakeAssistant::new(&[RunStatus::InProgress, RunStatus::Failed], Vec::new());
        let handle = RunHandle {
            thread_id: "thread_1".to_string(),
            run_id: "run_1".to_string(),
        };
        let err = wait_for_completion(&backend, &handle, &fast_policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::JobTerminatedAbnormally(RunStatus::Failed)
        ));
        assert_eq!(backend.retrieve_calls(), 2);
    }

    #[tokio::test]
    async fn poller_detects_abnormal_status_on_first_check() {
        let backend = FakeAssistant::new(&[RunStatus::Expired], Vec::new());
        let handle = RunHandle {
            thread_id: "thread_1".to_string(),
            run_id: "run_1".to_string(),
        };
        let err = wait_for_completion(&backend, &handle, &fast_policy(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::JobTerminatedAbnormally(RunStatus::Expired)
        ));
        assert_eq!(backend.retrieve_calls(), 1);
    }

    #[tokio::test]
    async fn poller_gives_up_after_max_attempts() {
        let backend = FakeAssistant::new(&[RunStatus::InProgress], Vec::new());
        let handle = RunHandle {
            thread_id: "thread_1".to_string(),
            run_id: "run_1".to_string(),
        };
        let policy = PollPolicy {
            interval: Duration::from_millis(1),
            max_attempts: 3,
        };
        let err = wait_for_completion(&backend, &handle, &policy, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::PollTimeout { attempts: 3 }));
        assert_eq!(backend.retrieve_calls(), 3);
    }

    #[tokio::test]
    async fn poller_observes_cancellation() {
        let backend = FakeAssistant::new(&[RunStatus::InProgress], Vec::new());
        let handle = RunHandle {
            thread_id: "thread_1".to_string(),
            run_id: "run_1".to_string(),
        };
        let policy = PollPolicy {
            interval: Duration::from_secs(30),
            max_attempts: 100,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = wait_for_completion(&backend, &handle, &policy, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
        assert_eq!(backend.retrieve_calls(), 1);
    }

    #[tokio::test]
    async fn get_reply_returns_assistant_text() {
        let backend = FakeAssistant::new(
            &[RunStatus::InProgress, RunStatus::Completed],
            vec![
                message("m2", MessageRole::Assistant, 20, "Pack layers for Reykjavik."),
                message("m1", MessageRole::User, 10, "What to pack?"),
            ],
        );
        let reply = get_reply(
            &backend,
            "asst_1",
            &fast_policy(),
            &CancellationToken::new(),
            "What to pack?",
        )
        .await;
        assert_eq!(reply, "Pack layers for Reykjavik.");
        assert_eq!(*backend.user_texts.lock().unwrap(), vec!["What to pack?".to_string()]);
    }

    #[tokio::test]
    async fn get_reply_failed_run_uses_connection_fallback() {
        let backend = FakeAssistant::new(&[RunStatus::Failed], Vec::new());
        let reply = get_reply(
            &backend,
            "asst_1",
            &fast_policy(),
            &CancellationToken::new(),
            "hi",
        )
        .await;
        assert_eq!(reply, CONNECTION_FALLBACK);
    }

    static CAPTURED: std::sync::OnceLock<Mutex<Vec<String>>> = std::sync::OnceLock::new();

    /// Keeps formatted records so tests can check what was logged.
    struct CapturingLogger;

    impl log::Log for CapturingLogger {
        fn enabled(&self, _: &log::Metadata) -> bool {
            true
        }

        fn log(&self, record: &log::Record) {
            let line = format!("[{}] {}", record.level(), record.args());
            CAPTURED
                .get_or_init(|| Mutex::new(Vec::new()))
                .lock()
                .unwrap()
                .push(line);
        }

        fn flush(&self) {}
    }

    static LOGGER: CapturingLogger = CapturingLogger;

    #[tokio::test]
    async fn get_reply_logs_the_failure_it_hides() {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Trace);

        let backend = FakeAssistant::new(&[RunStatus::Cancelled], Vec::new());
        let reply = get_reply(
            &backend,
            "asst_1",
            &fast_policy(),
            &CancellationToken::new(),
            "Is the Louvre open on Tuesdays?",
        )
        .await;
        assert_eq!(reply, CONNECTION_FALLBACK);

        let lines = CAPTURED.get().unwrap().lock().unwrap();
        assert!(
            lines
                .iter()
                .any(|l| l.starts_with("[ERROR]") && l.contains("ended with status cancelled")),
            "no error logged: {:?}",
            *lines
        );
    }

    #[tokio::test]
    async fn get_reply_provider_error_uses_connection_fallback() {
        let mut backend = FakeAssistant::new(&[RunStatus::Completed], Vec::new());
        backend.fail_create_thread = true;
        let reply = get_reply(
            &backend,
            "asst_1",
            &fast_policy(),
            &CancellationToken::new(),
            "hi",
        )
        .await;
        assert_eq!(reply, CONNECTION_FALLBACK);
    }

    #[tokio::test]
    async fn get_reply_never_returns_empty() {
        let inputs = ["hi", "   ", "", "¿Dónde comer en Madrid?"];
        for input in inputs {
            let backend = FakeAssistant::new(
                &[RunStatus::Completed],
                vec![message("m1", MessageRole::Assistant, 1, "")],
            );
            let reply = get_reply(
                &backend,
                "asst_1",
                &fast_policy(),
                &CancellationToken::new(),
                input,
            )
            .await;
            assert!(!reply.is_empty(), "empty reply for {:?}", input);
        }
    }

    #[tokio::test]
    async fn empty_text_does_not_reach_provider() {
        let backend = FakeAssistant::new(&[RunStatus::Completed], Vec::new());
        let err = start_run(&backend, "asst_1", "  \n").await.unwrap_err();
        assert!(matches!(err, RelayError::EmptyMessage));
        assert!(backend.user_texts.lock().unwrap().is_empty());
    }
}
