//! Periodic due-check loop; disjoint lock acquisition for list mutation vs.
//! task execution; fan-out of results to origin chats (§4.3).

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;
use tokio::sync::Notify;

use crate::agent::{Agent, AgentMessage};
use crate::channel::ChannelRegistry;
use crate::domain_types::{PollIntervalSecs, ThreadId};
use crate::task_store::{ScheduledTask, TaskStore, TaskStoreError, TaskType};
use crate::time_provider::SharedTimeProvider;

// Scopes a model-tier hint to the current task's agent invocation only,
// restored on every exit path including panics (the guard's `Drop` clears
// the task-local regardless of how the scope is left).
tokio::task_local! {
    static ACTIVE_MODEL_TIER: std::cell::RefCell<Option<String>>;
}

/// Reads the model-tier hint bound for the current task invocation, if any.
/// Exposed so tool implementations invoked by the agent can observe it.
#[must_use]
pub fn active_model_tier() -> Option<String> {
    ACTIVE_MODEL_TIER
        .try_with(|cell| cell.borrow().clone())
        .ok()
        .flatten()
}

/// Errors surfaced by the scheduler. Agent and channel failures are handled
/// internally (logged, not propagated); this enum covers only store-level
/// failures that should halt a cycle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task store failed to load or persist.
    #[error("task store error: {0}")]
    Store(#[from] TaskStoreError),
    /// A task's cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {source}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// The parser's error.
        #[source]
        source: cron::error::Error,
    },
}

/// Returns whether `task` is due at `now`, per the per-type rules in §4.3.
/// Invalid values (unparseable cron, non-numeric interval, non-parseable
/// timestamp) are treated as not due, since a malformed task should never
/// panic the scheduler loop.
#[must_use]
pub fn is_due(task: &ScheduledTask, now: DateTime<Utc>) -> bool {
    if !task.active {
        return false;
    }
    match task.task_type {
        TaskType::Cron => is_due_cron(task, now),
        TaskType::Interval => is_due_interval(task, now),
        TaskType::Once => is_due_once(task, now),
    }
}

fn is_due_cron(task: &ScheduledTask, now: DateTime<Utc>) -> bool {
    let Ok(schedule) = Schedule::from_str(&task.value) else {
        return false;
    };
    let baseline = task.last_run.unwrap_or(task.created_at).max(task.created_at);
    match schedule.after(&baseline).next() {
        Some(next_fire) => next_fire <= now,
        None => false,
    }
}

fn is_due_interval(task: &ScheduledTask, now: DateTime<Utc>) -> bool {
    let Ok(interval_secs) = task.value.parse::<i64>() else {
        return false;
    };
    match task.last_run {
        None => true,
        Some(last_run) => (now - last_run).num_seconds() >= interval_secs,
    }
}

fn is_due_once(task: &ScheduledTask, now: DateTime<Utc>) -> bool {
    // An already-past-due `once` task is still due on the next cycle
    // (Open Question 2 in DESIGN.md), it is never rejected at creation.
    match DateTime::parse_from_rfc3339(&task.value) {
        Ok(at) => now >= at.with_timezone(&Utc),
        Err(_) => false,
    }
}

/// Applies the due-marking mutation a single due task undergoes inside the
/// store's critical section: `last_run = now`, and for `once` tasks,
/// `active = false`.
fn mark_fired(task: &mut ScheduledTask, now: DateTime<Utc>) {
    task.last_run = Some(now);
    if task.task_type == TaskType::Once {
        task.active = false;
    }
}

/// The periodic task engine.
pub struct Scheduler {
    store: Arc<TaskStore>,
    agent: Arc<dyn Agent>,
    channels: Arc<ChannelRegistry>,
    time: SharedTimeProvider,
    poll_interval: PollIntervalSecs,
    stop_requested: Arc<Notify>,
}

impl Scheduler {
    /// Creates a scheduler over `store`, invoking `agent` for due tasks and
    /// delivering results via `channels`.
    #[must_use]
    pub fn new(
        store: Arc<TaskStore>,
        agent: Arc<dyn Agent>,
        channels: Arc<ChannelRegistry>,
        time: SharedTimeProvider,
        poll_interval: PollIntervalSecs,
    ) -> Self {
        Self {
            store,
            agent,
            channels,
            time,
            poll_interval,
            stop_requested: Arc::new(Notify::new()),
        }
    }

    /// Requests termination. The loop finishes its current cycle (including
    /// awaiting all in-flight task executions) before returning from
    /// [`Scheduler::run`]; executions are never interrupted mid-flight.
    pub fn stop(&self) {
        self.stop_requested.notify_one();
    }

    /// Runs the due-check loop until [`Scheduler::stop`] is called.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        loop {
            self.run_one_cycle().await?;

            let sleep = self.time.sleep(std::time::Duration::from_secs(
                self.poll_interval.into_inner(),
            ));
            tokio::select! {
                () = sleep => {}
                () = self.stop_requested.notified() => return Ok(()),
            }
        }
    }

    /// Runs exactly one due-check-and-fire cycle. Exposed separately from
    /// [`Scheduler::run`] so tests can drive cycles deterministically.
    ///
    /// Due tasks fire concurrently, each on its own `tokio::spawn`'d task
    /// (§4.3 "for each due task, concurrently"; §5 "multiple tasks may be in
    /// flight simultaneously"): wall-clock time for the cycle is bounded by
    /// the slowest single task, not their sum.
    pub async fn run_one_cycle(&self) -> Result<(), SchedulerError> {
        let now = self.time.now();
        let due_tasks = self
            .store
            .with_lock(|tasks| {
                let mut due = Vec::new();
                for task in tasks.iter_mut() {
                    if is_due(task, now) {
                        mark_fired(task, now);
                        due.push(task.clone());
                    }
                }
                due
            })
            .await?;

        let handles: Vec<_> = due_tasks
            .into_iter()
            .map(|task| {
                let agent = Arc::clone(&self.agent);
                let channels = Arc::clone(&self.channels);
                tokio::spawn(async move { fire(agent, channels, task).await })
            })
            .collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "scheduled task fire panicked");
            }
        }
        Ok(())
    }
}

async fn fire(agent: Arc<dyn Agent>, channels: Arc<ChannelRegistry>, task: ScheduledTask) {
    let thread_id = ThreadId::try_new(format!("scheduler_{}", task.id))
        .expect("scheduler_<id> is never empty");
    let prompt = task.prompt.clone();
    let model_tier = task.model_tier.clone();

    let reply = ACTIVE_MODEL_TIER
        .scope(std::cell::RefCell::new(model_tier), async {
            agent
                .invoke(
                    &thread_id,
                    vec![AgentMessage {
                        role: "user".into(),
                        content: serde_json::json!(prompt),
                    }],
                )
                .await
        })
        .await;

    let text = match reply {
        Ok(reply) => reply.final_text(),
        Err(err) => {
            tracing::warn!(task_id = %task.id, error = %err, "scheduled task agent invocation failed");
            return;
        }
    };

    let Some(channel) = channels.get(task.channel.as_ref()) else {
        tracing::warn!(channel = %task.channel, "scheduled task references unknown channel");
        return;
    };
    if let Err(err) = channel.send(task.chat_id.as_ref(), &text, false).await {
        tracing::warn!(task_id = %task.id, error = %err, "failed to deliver scheduled task result");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NullAgent;
    use crate::channel::RecordingChannel;
    use crate::domain_types::{ChannelName, ChatId, ResetCount};
    use crate::task_store::TaskType;

    fn channel_name() -> ChannelName {
        ChannelName::try_new("telegram").unwrap()
    }
    fn chat() -> ChatId {
        ChatId::try_new("42").unwrap()
    }

    #[test]
    fn once_task_due_when_value_timestamp_passed() {
        let task = ScheduledTask {
            id: crate::domain_types::TaskId::try_new("ab12cd34").unwrap(),
            prompt: "hi".into(),
            task_type: TaskType::Once,
            value: "2030-01-01T00:00:00Z".into(),
            channel: channel_name(),
            chat_id: chat(),
            created_at: Utc::now(),
            last_run: None,
            active: true,
            model_tier: None,
        };
        let now = DateTime::parse_from_rfc3339("2030-01-01T00:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(is_due(&task, now));
    }

    #[test]
    fn once_task_not_due_before_value_timestamp() {
        let task = ScheduledTask {
            id: crate::domain_types::TaskId::try_new("ab12cd34").unwrap(),
            prompt: "hi".into(),
            task_type: TaskType::Once,
            value: "2030-01-01T00:00:00Z".into(),
            channel: channel_name(),
            chat_id: chat(),
            created_at: Utc::now(),
            last_run: None,
            active: true,
            model_tier: None,
        };
        let now = DateTime::parse_from_rfc3339("2029-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!is_due(&task, now));
    }

    #[test]
    fn interval_task_due_when_never_run() {
        let task = ScheduledTask {
            id: crate::domain_types::TaskId::try_new("ab12cd34").unwrap(),
            prompt: "hi".into(),
            task_type: TaskType::Interval,
            value: "60".into(),
            channel: channel_name(),
            chat_id: chat(),
            created_at: Utc::now(),
            last_run: None,
            active: true,
            model_tier: None,
        };
        assert!(is_due(&task, Utc::now()));
    }

    #[test]
    fn interval_task_not_due_before_elapsed() {
        let now = Utc::now();
        let task = ScheduledTask {
            id: crate::domain_types::TaskId::try_new("ab12cd34").unwrap(),
            prompt: "hi".into(),
            task_type: TaskType::Interval,
            value: "600".into(),
            channel: channel_name(),
            chat_id: chat(),
            created_at: now,
            last_run: Some(now),
            active: true,
            model_tier: None,
        };
        assert!(!is_due(&task, now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn inactive_task_never_due() {
        let task = ScheduledTask {
            id: crate::domain_types::TaskId::try_new("ab12cd34").unwrap(),
            prompt: "hi".into(),
            task_type: TaskType::Interval,
            value: "1".into(),
            channel: channel_name(),
            chat_id: chat(),
            created_at: Utc::now(),
            last_run: None,
            active: false,
            model_tier: None,
        };
        assert!(!is_due(&task, Utc::now() + chrono::Duration::seconds(100)));
    }

    #[tokio::test]
    async fn firing_a_one_shot_deactivates_it_and_delivers_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(dir.path().join("tasks.json")));
        store
            .create(
                "say hi".into(),
                TaskType::Once,
                "2000-01-01T00:00:00Z".into(),
                channel_name(),
                chat(),
                None,
                Utc::now(),
            )
            .await
            .unwrap();

        let channel = Arc::new(RecordingChannel::default());
        let mut registry = ChannelRegistry::new();
        registry.register("telegram", channel.clone() as Arc<dyn crate::channel::Channel>);

        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(NullAgent),
            Arc::new(registry),
            crate::time_provider::production_time_provider(),
            PollIntervalSecs::try_new(1).unwrap(),
        );
        scheduler.run_one_cycle().await.unwrap();

        let tasks = store.load().await.unwrap();
        assert!(!tasks[0].active);
        assert!(tasks[0].last_run.is_some());
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(channel.sent()[0].chat_id, "42");
        assert!(!channel.sent()[0].notify);

        // Subsequent cycles do not re-fire a deactivated one-shot.
        scheduler.run_one_cycle().await.unwrap();
        assert_eq!(channel.sent().len(), 1);
    }

    /// An agent whose `invoke` sleeps for a fixed duration, used to tell
    /// concurrent firing apart from sequential firing by wall-clock time.
    struct SlowAgent {
        delay: std::time::Duration,
    }

    #[async_trait::async_trait]
    impl crate::agent::Agent for SlowAgent {
        async fn invoke(
            &self,
            _thread_id: &ThreadId,
            _messages: Vec<AgentMessage>,
        ) -> Result<crate::agent::AgentReply, crate::agent::AgentError> {
            tokio::time::sleep(self.delay).await;
            Ok(crate::agent::AgentReply {
                events: vec![crate::event::Event::Text {
                    content: "done".into(),
                }],
            })
        }
    }

    #[tokio::test]
    async fn due_tasks_in_one_cycle_fire_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::new(dir.path().join("tasks.json")));
        for _ in 0..3 {
            store
                .create(
                    "say hi".into(),
                    TaskType::Interval,
                    "1".into(),
                    channel_name(),
                    chat(),
                    None,
                    Utc::now(),
                )
                .await
                .unwrap();
        }

        let channel = Arc::new(RecordingChannel::default());
        let mut registry = ChannelRegistry::new();
        registry.register("telegram", channel.clone() as Arc<dyn crate::channel::Channel>);

        let delay = std::time::Duration::from_millis(200);
        let scheduler = Scheduler::new(
            store,
            Arc::new(SlowAgent { delay }),
            Arc::new(registry),
            crate::time_provider::production_time_provider(),
            PollIntervalSecs::try_new(1).unwrap(),
        );

        let start = std::time::Instant::now();
        scheduler.run_one_cycle().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(channel.sent().len(), 3);
        // Sequential firing would take >= 3 * delay; concurrent firing
        // stays close to a single delay.
        assert!(
            elapsed < delay * 2,
            "expected concurrent firing to finish near one delay, took {elapsed:?}"
        );
    }

    #[test]
    fn reset_count_suffix_never_decreases() {
        let a = ResetCount::new(3);
        let b = a.incremented();
        assert!(b.into_inner() > a.into_inner());
    }
}
