//! Queue-driven agent scheduler.
//!
//! Each tick pops one agent id, asks the agent whether it can run against the
//! current state and, if so, invokes it and applies its output. The loop never
//! propagates agent errors or panics; every run ends in a [`TerminationReason`].
//!
//! Termination is checked before each tick, first match wins:
//! cancellation, goal met, fixpoint, budget exceeded.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use serde_json::{Value, json};

use crate::agent::{Agent, AgentRegistry, Phase, Position, ScheduleRequest};
use crate::error::AgentFailure;
use crate::events::{
    AGENT_FAILED, AGENT_SUCCEEDED, ENQUEUE_REJECTED, EVENT_CONSUMED, Event, PIPELINE_TERMINATED,
    emit,
};
use crate::memory::MemoryStore;
use crate::state::{AgentRun, EVENTS_KEY, State};
use crate::telemetry::{EventSink, NullSink};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_iterations: usize,
    pub max_enqueues: usize,
    pub order_by_success_rate: bool,
    pub contract_keys: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 60,
            max_enqueues: 32,
            order_by_success_rate: false,
            contract_keys: vec!["contract".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    GoalMet,
    Fixpoint,
    BudgetExceeded,
    Cancelled,
}

impl TerminationReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::GoalMet => "goal_met",
            Self::Fixpoint => "fixpoint",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shared flag checked between ticks. Setting it never interrupts an agent
/// that is already running.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: State,
    pub reason: TerminationReason,
    pub iterations: usize,
    pub enqueues: usize,
}

struct RunState {
    state: State,
    queue: VecDeque<String>,
    iterations: usize,
    enqueues: usize,
    /// Ids examined since the last tick that changed state or enqueued work.
    idle_seen: BTreeSet<String>,
    /// Finalize agents that already ran after the goal was reached.
    finalized: BTreeSet<String>,
}

pub struct Scheduler {
    registry: AgentRegistry,
    config: SchedulerConfig,
    memory: Arc<MemoryStore>,
    sink: Arc<dyn EventSink>,
    cancel: CancelHandle,
}

impl Scheduler {
    pub fn new(registry: AgentRegistry, config: SchedulerConfig, memory: Arc<MemoryStore>) -> Self {
        Self {
            registry,
            config,
            memory,
            sink: Arc::new(NullSink),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// All registered ids, optionally reordered by remembered success rate.
    pub fn default_seed(&self) -> Vec<String> {
        let ids = self.registry.ids();
        if !self.config.order_by_success_rate {
            return ids;
        }

        let mut ranked = ids
            .into_iter()
            .map(|id| (self.memory.success_rate(&id), id))
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        ranked.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn run(&self, initial: State) -> RunOutcome {
        let seed = self.default_seed();
        self.run_seeded(initial, seed).await
    }

    pub async fn run_seeded(&self, initial: State, seed: Vec<String>) -> RunOutcome {
        let mut queue = VecDeque::new();
        for id in seed {
            if !self.registry.contains(&id) {
                tracing::warn!(agent = %id, "dropping unknown agent from seed list");
                continue;
            }
            if !queue.contains(&id) {
                queue.push_back(id);
            }
        }

        let mut run = RunState {
            state: initial,
            queue,
            iterations: 0,
            enqueues: 0,
            idle_seen: BTreeSet::new(),
            finalized: BTreeSet::new(),
        };

        tracing::info!(
            agents = self.registry.len(),
            queued = run.queue.len(),
            max_iterations = self.config.max_iterations,
            "scheduler run started"
        );

        let reason = loop {
            if let Some(reason) = self.check_termination(&mut run) {
                break reason;
            }

            let Some(id) = run.queue.pop_front() else {
                break TerminationReason::Fixpoint;
            };
            run.iterations += 1;

            let Some(agent) = self.registry.get(&id).cloned() else {
                continue;
            };

            let progress = if !self.admits(agent.as_ref(), &run) {
                tracing::trace!(agent = %id, tick = run.iterations, "agent not admitted in this phase");
                run.queue.push_back(id.clone());
                false
            } else if !guarded_can_run(agent.as_ref(), &run.state) {
                tracing::trace!(agent = %id, tick = run.iterations, "agent skipped");
                run.queue.push_back(id.clone());
                false
            } else {
                self.invoke(agent.as_ref(), &mut run).await
            };

            if progress {
                run.idle_seen.clear();
            } else {
                run.idle_seen.insert(id);
            }
        };

        let terminated = Event::with_meta(
            PIPELINE_TERMINATED,
            json!({
                "reason": reason.label(),
                "iterations": run.iterations,
                "enqueues": run.enqueues,
            }),
        );
        self.append_event(&mut run.state, terminated);

        tracing::info!(
            reason = %reason,
            iterations = run.iterations,
            enqueues = run.enqueues,
            goal_reached = run.state.goal_reached(),
            "scheduler run finished"
        );

        RunOutcome {
            state: run.state,
            reason,
            iterations: run.iterations,
            enqueues: run.enqueues,
        }
    }

    fn check_termination(&self, run: &mut RunState) -> Option<TerminationReason> {
        if self.cancel.is_cancelled() {
            return Some(TerminationReason::Cancelled);
        }

        if run.state.goal_reached() {
            let finalize = self.registry.finalize_ids();
            run.queue
                .retain(|id| finalize.contains(id) && !run.finalized.contains(id));

            let eligible = self
                .registry
                .ids()
                .into_iter()
                .filter(|id| finalize.contains(id) && !run.finalized.contains(id))
                .filter(|id| {
                    self.registry
                        .get(id)
                        .is_some_and(|agent| guarded_can_run(agent.as_ref(), &run.state))
                })
                .collect::<Vec<_>>();

            if eligible.is_empty() {
                return Some(TerminationReason::GoalMet);
            }

            for id in eligible {
                if !run.queue.contains(&id) {
                    run.queue.push_back(id);
                }
            }
        }

        if run.queue.is_empty() || run.queue.iter().all(|id| run.idle_seen.contains(id)) {
            return Some(TerminationReason::Fixpoint);
        }

        if run.iterations >= self.config.max_iterations {
            return Some(TerminationReason::BudgetExceeded);
        }

        None
    }

    fn admits(&self, agent: &dyn Agent, run: &RunState) -> bool {
        match agent.phase() {
            Phase::GoalSeeking => !run.state.goal_reached(),
            Phase::Finalize => run.state.goal_reached() && !run.finalized.contains(agent.id()),
        }
    }

    /// Runs one admitted agent and applies its result. Returns whether the
    /// tick made progress: a changed state value or accepted enqueue.
    async fn invoke(&self, agent: &dyn Agent, run: &mut RunState) -> bool {
        let id = agent.id().to_string();
        let tick = run.iterations;
        let state_keys = run.state.values.keys().cloned().collect::<Vec<_>>();

        tracing::debug!(agent = %id, tick, "invoking agent");

        let result = match AssertUnwindSafe(agent.run(&run.state)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(AgentFailure::new(
                &id,
                format!("agent panicked: {}", panic_message(payload.as_ref())),
            )),
        };

        if agent.phase() == Phase::Finalize {
            run.finalized.insert(id.clone());
        }

        let (success, progress) = match result {
            Ok(output) => {
                for kind in &output.consume_events {
                    let before = run.state.events.len();
                    run.state.events.retain(|event| event.kind != *kind);
                    let removed = before - run.state.events.len();
                    if removed > 0 {
                        self.append_event(
                            &mut run.state,
                            Event::with_meta(
                                EVENT_CONSUMED,
                                json!({"agent": id, "type": kind, "count": removed}),
                            ),
                        );
                    }
                }

                // events under the update key go through the sink like emitted ones
                let mut updates = output.updates;
                let returned_events = match updates.remove(EVENTS_KEY) {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };

                let changed = run
                    .state
                    .apply_updates(updates, &self.config.contract_keys);

                for raw in returned_events.into_iter().chain(output.events) {
                    self.append_event(&mut run.state, Event::normalize(raw));
                }

                let enqueued = self.apply_schedule(&id, output.schedule, run);

                self.append_event(
                    &mut run.state,
                    Event::with_meta(
                        AGENT_SUCCEEDED,
                        json!({"agent": id, "tick": tick, "changed": changed}),
                    ),
                );
                run.state.agent_runs.push(AgentRun {
                    agent_id: id.clone(),
                    success: true,
                    reason: None,
                    tick,
                });

                (true, changed || enqueued)
            }
            Err(failure) => {
                tracing::warn!(agent = %id, tick, reason = %failure.reason, "agent failed");
                self.append_event(
                    &mut run.state,
                    Event::with_meta(
                        AGENT_FAILED,
                        json!({"agent": id, "tick": tick, "reason": failure.reason}),
                    ),
                );
                run.state.agent_runs.push(AgentRun {
                    agent_id: id.clone(),
                    success: false,
                    reason: Some(failure.reason),
                    tick,
                });

                (false, false)
            }
        };

        if let Err(err) = self.memory.record_invocation(&id, success) {
            tracing::warn!(agent = %id, error = %err, "failed to record invocation in memory");
        }
        let outcome = if success { "success" } else { "failure" };
        if let Err(err) = self.memory.record_decision(&state_keys, &id, outcome) {
            tracing::warn!(agent = %id, error = %err, "failed to record decision in memory");
        }

        progress
    }

    /// Applies enqueue requests in order. Unknown ids and requests past the
    /// per-run cap are rejected with an event. Returns whether any was accepted.
    fn apply_schedule(&self, source: &str, requests: Vec<ScheduleRequest>, run: &mut RunState) -> bool {
        let mut accepted = false;

        for request in requests {
            let rejection = if !self.registry.contains(&request.agent_id) {
                Some("unknown_agent")
            } else if run.enqueues >= self.config.max_enqueues {
                Some("enqueue_limit")
            } else {
                None
            };

            if let Some(reason) = rejection {
                tracing::warn!(
                    source = %source,
                    agent = %request.agent_id,
                    reason,
                    "enqueue rejected"
                );
                self.append_event(
                    &mut run.state,
                    Event::with_meta(
                        ENQUEUE_REJECTED,
                        json!({"source": source, "agent": request.agent_id, "reason": reason}),
                    ),
                );
                continue;
            }

            run.enqueues += 1;
            run.queue.retain(|queued| *queued != request.agent_id);
            match request.position {
                Position::Front => run.queue.push_front(request.agent_id),
                Position::Back => run.queue.push_back(request.agent_id),
            }
            accepted = true;
        }

        accepted
    }

    fn append_event(&self, state: &mut State, event: Event) {
        let stored = emit(state, event);
        self.sink.record(&stored);
    }
}

fn guarded_can_run(agent: &dyn Agent, state: &State) -> bool {
    match std::panic::catch_unwind(AssertUnwindSafe(|| agent.can_run(state))) {
        Ok(ready) => ready,
        Err(payload) => {
            tracing::warn!(
                agent = %agent.id(),
                panic = %panic_message(payload.as_ref()),
                "capability predicate panicked, treating as not runnable"
            );
            false
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentOutput, AgentResult};
    use crate::events::count_type;
    use crate::memory::MemoryPolicy;
    use crate::state::GOAL_REACHED;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    type Predicate = Box<dyn Fn(&State) -> bool + Send + Sync>;
    type Body = Box<dyn Fn(&State) -> AgentResult + Send + Sync>;

    struct StubAgent {
        id: &'static str,
        phase: Phase,
        predicate: Predicate,
        body: Body,
        calls: AtomicUsize,
    }

    impl StubAgent {
        fn new(
            id: &'static str,
            predicate: impl Fn(&State) -> bool + Send + Sync + 'static,
            body: impl Fn(&State) -> AgentResult + Send + Sync + 'static,
        ) -> Self {
            Self {
                id,
                phase: Phase::GoalSeeking,
                predicate: Box::new(predicate),
                body: Box::new(body),
                calls: AtomicUsize::new(0),
            }
        }

        fn finalize(mut self) -> Self {
            self.phase = Phase::Finalize;
            self
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn id(&self) -> &str {
            self.id
        }

        fn phase(&self) -> Phase {
            self.phase
        }

        fn can_run(&self, state: &State) -> bool {
            (self.predicate)(state)
        }

        async fn run(&self, state: &State) -> AgentResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.body)(state)
        }
    }

    fn sets(key: &'static str, value: Value) -> impl Fn(&State) -> AgentResult + Send + Sync {
        move |_| Ok(AgentOutput::new().set(key, value.clone()))
    }

    fn scheduler(agents: Vec<Arc<dyn Agent>>, config: SchedulerConfig) -> Scheduler {
        Scheduler::new(
            AgentRegistry::from_agents(agents).unwrap(),
            config,
            Arc::new(MemoryStore::ephemeral(MemoryPolicy::default())),
        )
    }

    fn chain_agents() -> Vec<Arc<dyn Agent>> {
        vec![
            Arc::new(StubAgent::new("a", |s| !s.contains("x"), sets("x", json!(1)))),
            Arc::new(StubAgent::new(
                "b",
                |s| s.get("x") == Some(&json!(1)),
                sets("y", json!(2)),
            )),
            Arc::new(StubAgent::new(
                "c",
                |s| s.get("y") == Some(&json!(2)),
                sets(GOAL_REACHED, json!(true)),
            )),
        ]
    }

    #[tokio::test]
    async fn chained_agents_reach_goal() {
        let outcome = scheduler(chain_agents(), SchedulerConfig::default())
            .run(State::new())
            .await;

        assert_eq!(outcome.reason, TerminationReason::GoalMet);
        assert_eq!(outcome.state.get("x"), Some(&json!(1)));
        assert_eq!(outcome.state.get("y"), Some(&json!(2)));
        assert!(outcome.state.goal_reached());
        assert_eq!(count_type(&outcome.state.events, AGENT_SUCCEEDED), 3);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn chained_agents_reach_goal_from_reverse_seed() {
        let sched = scheduler(chain_agents(), SchedulerConfig::default());
        let outcome = sched
            .run_seeded(State::new(), vec!["c".into(), "b".into(), "a".into()])
            .await;
        assert_eq!(outcome.reason, TerminationReason::GoalMet);
        assert_eq!(count_type(&outcome.state.events, AGENT_SUCCEEDED), 3);
    }

    #[tokio::test]
    async fn unsatisfiable_agents_stop_at_fixpoint_within_one_pass() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(StubAgent::new("first", |s| !s.contains("seen"), sets("seen", json!(true)))),
            Arc::new(StubAgent::new("never1", |_| false, sets("z", json!(1)))),
            Arc::new(StubAgent::new("never2", |_| false, sets("z", json!(2)))),
        ];
        let outcome = scheduler(agents, SchedulerConfig::default())
            .run(State::new())
            .await;

        assert_eq!(outcome.reason, TerminationReason::Fixpoint);
        assert_eq!(outcome.iterations, 3);
        assert!(!outcome.state.goal_reached());
    }

    #[tokio::test]
    async fn nothing_runnable_is_fixpoint_after_one_pass() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(StubAgent::new("p", |_| false, sets("z", json!(1)))),
            Arc::new(StubAgent::new("q", |_| false, sets("z", json!(1)))),
        ];
        let outcome = scheduler(agents, SchedulerConfig::default())
            .run(State::new())
            .await;
        assert_eq!(outcome.reason, TerminationReason::Fixpoint);
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn self_rescheduling_agent_hits_budget() {
        let counter = Arc::new(Mutex::new(0u64));
        let shared = counter.clone();
        let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(StubAgent::new(
            "spin",
            |_| true,
            move |_| {
                let mut n = shared.lock().unwrap();
                *n += 1;
                Ok(AgentOutput::new().set("n", json!(*n)).schedule_back("spin"))
            },
        ))];
        let config = SchedulerConfig {
            max_iterations: 10,
            max_enqueues: 1000,
            ..SchedulerConfig::default()
        };
        let outcome = scheduler(agents, config).run(State::new()).await;

        assert_eq!(outcome.reason, TerminationReason::BudgetExceeded);
        assert_eq!(outcome.iterations, 10);
        assert_eq!(*counter.lock().unwrap(), 10);
    }

    #[tokio::test]
    async fn enqueue_cap_forces_termination() {
        let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(StubAgent::new(
            "loop",
            |_| true,
            |_| Ok(AgentOutput::new().schedule_back("loop")),
        ))];
        let config = SchedulerConfig {
            max_iterations: 1000,
            max_enqueues: 4,
            ..SchedulerConfig::default()
        };
        let outcome = scheduler(agents, config).run(State::new()).await;

        assert_eq!(outcome.reason, TerminationReason::Fixpoint);
        assert_eq!(outcome.enqueues, 4);
        assert_eq!(outcome.iterations, 5);
        assert_eq!(count_type(&outcome.state.events, ENQUEUE_REJECTED), 1);
    }

    #[tokio::test]
    async fn unknown_enqueue_is_rejected_not_fatal() {
        let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(StubAgent::new(
            "a",
            |s| !s.contains("done"),
            |_| Ok(AgentOutput::new().set("done", json!(true)).schedule_front("ghost")),
        ))];
        let outcome = scheduler(agents, SchedulerConfig::default())
            .run(State::new())
            .await;
        let rejected = outcome
            .state
            .events
            .iter()
            .find(|e| e.kind == ENQUEUE_REJECTED)
            .unwrap();
        assert_eq!(rejected.meta["agent"], json!("ghost"));
        assert_eq!(rejected.meta["reason"], json!("unknown_agent"));
    }

    #[tokio::test]
    async fn failures_and_panics_are_isolated() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(StubAgent::new("broken", |_| true, |_| {
                Err(AgentFailure::new("broken", "backend down"))
            })),
            Arc::new(StubAgent::new("boom", |_| true, |_| panic!("kaboom"))),
            Arc::new(StubAgent::new("shaky", |_| panic!("predicate bug"), sets("never", json!(1)))),
            Arc::new(StubAgent::new("ok", |s| !s.contains("ok"), sets("ok", json!(true)))),
        ];
        let memory = Arc::new(MemoryStore::ephemeral(MemoryPolicy::default()));
        let sched = Scheduler::new(
            AgentRegistry::from_agents(agents).unwrap(),
            SchedulerConfig::default(),
            memory.clone(),
        );
        let outcome = sched.run(State::new()).await;

        assert_eq!(outcome.reason, TerminationReason::Fixpoint);
        assert_eq!(outcome.state.get("ok"), Some(&json!(true)));
        assert!(!outcome.state.contains("never"));
        assert_eq!(count_type(&outcome.state.events, AGENT_FAILED), 2);
        assert_eq!(outcome.state.failed_agents(), vec!["broken", "boom"]);

        let boom = outcome
            .state
            .agent_runs
            .iter()
            .find(|run| run.agent_id == "boom")
            .unwrap();
        assert!(boom.reason.as_deref().unwrap().contains("kaboom"));

        assert_eq!(memory.stats("broken").unwrap().failures, 1);
        assert_eq!(memory.stats("ok").unwrap().successes, 1);
        assert!(memory.stats("shaky").is_none());
        assert_eq!(memory.summary().decisions, 3);
    }

    #[tokio::test]
    async fn finalize_agent_runs_once_after_goal() {
        let evaluator = Arc::new(
            StubAgent::new("evaluate", |_| true, sets("score", json!(80))).finalize(),
        );
        let late = Arc::new(StubAgent::new("late", |_| true, sets("late", json!(true))));
        let agents: Vec<Arc<dyn Agent>> = vec![
            evaluator.clone(),
            Arc::new(StubAgent::new("goal", |_| true, sets(GOAL_REACHED, json!(true)))),
            late.clone(),
        ];
        let outcome = scheduler(agents, SchedulerConfig::default())
            .run(State::new())
            .await;

        assert_eq!(outcome.reason, TerminationReason::GoalMet);
        assert_eq!(outcome.state.get("score"), Some(&json!(80)));
        assert!(!outcome.state.contains("late"));
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(late.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn finalize_agent_is_auto_enqueued_when_not_seeded() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(StubAgent::new("goal", |_| true, sets(GOAL_REACHED, json!(true)))),
            Arc::new(StubAgent::new("evaluate", |_| true, sets("score", json!(1))).finalize()),
        ];
        let outcome = scheduler(agents, SchedulerConfig::default())
            .run_seeded(State::new(), vec!["goal".into()])
            .await;
        assert_eq!(outcome.reason, TerminationReason::GoalMet);
        assert_eq!(outcome.state.get("score"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn ineligible_finalize_agent_does_not_block_goal() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(StubAgent::new("goal", |_| true, sets(GOAL_REACHED, json!(true)))),
            Arc::new(StubAgent::new("evaluate", |_| false, sets("score", json!(1))).finalize()),
        ];
        let outcome = scheduler(agents, SchedulerConfig::default())
            .run(State::new())
            .await;
        assert_eq!(outcome.reason, TerminationReason::GoalMet);
        assert!(!outcome.state.contains("score"));
    }

    #[tokio::test]
    async fn cancelled_before_first_tick() {
        let sched = scheduler(chain_agents(), SchedulerConfig::default());
        sched.cancel_handle().cancel();
        let outcome = sched.run(State::new()).await;
        assert_eq!(outcome.reason, TerminationReason::Cancelled);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(
            outcome.state.events.last().map(|e| e.kind.as_str()),
            Some(PIPELINE_TERMINATED)
        );
    }

    #[tokio::test]
    async fn identical_inputs_give_identical_runs() {
        let first = scheduler(chain_agents(), SchedulerConfig::default())
            .run(State::new())
            .await;
        let second = scheduler(chain_agents(), SchedulerConfig::default())
            .run(State::new())
            .await;
        assert_eq!(first.state, second.state);
        assert_eq!(first.reason, second.reason);
        assert_eq!(first.iterations, second.iterations);
    }

    #[tokio::test]
    async fn contract_keys_merge_across_agents() {
        let agents: Vec<Arc<dyn Agent>> = vec![
            Arc::new(StubAgent::new("one", |s| !s.contains("one"), |_| {
                Ok(AgentOutput::new()
                    .set("one", json!(true))
                    .set("contract", json!({"files": ["a.py"], "endpoints": ["GET /x"]})))
            })),
            Arc::new(StubAgent::new("two", |s| s.contains("one") && !s.contains("two"), |_| {
                Ok(AgentOutput::new()
                    .set("two", json!(true))
                    .set("contract", json!({"files": ["b.py"], "endpoints": [{"method": "get", "path": "/x"}]})))
            })),
        ];
        let outcome = scheduler(agents, SchedulerConfig::default())
            .run(State::new())
            .await;
        let contract = outcome.state.contract("contract");
        assert_eq!(contract.files, vec!["a.py", "b.py"]);
        assert_eq!(contract.endpoints.len(), 1);
    }

    #[tokio::test]
    async fn success_rate_ordering_is_stable() {
        let memory = Arc::new(MemoryStore::ephemeral(MemoryPolicy::default()));
        memory.record_invocation("c", true).unwrap();
        memory.record_invocation("a", false).unwrap();
        let sched = Scheduler::new(
            AgentRegistry::from_agents(chain_agents()).unwrap(),
            SchedulerConfig {
                order_by_success_rate: true,
                ..SchedulerConfig::default()
            },
            memory,
        );
        assert_eq!(sched.default_seed(), vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn consumed_events_are_removed_before_new_ones_append() {
        let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(StubAgent::new(
            "consumer",
            |s| !s.contains("handled"),
            |_| {
                Ok(AgentOutput::new()
                    .set("handled", json!(true))
                    .consume_event("expand_contract")
                    .emit("expanded"))
            },
        ))];
        let mut initial = State::new();
        emit(&mut initial, "expand_contract");
        let outcome = scheduler(agents, SchedulerConfig::default())
            .run(initial)
            .await;
        assert_eq!(count_type(&outcome.state.events, "expand_contract"), 0);
        assert_eq!(count_type(&outcome.state.events, "expanded"), 1);

        let consumed = outcome
            .state
            .events
            .iter()
            .find(|e| e.kind == EVENT_CONSUMED)
            .unwrap();
        assert_eq!(consumed.meta["agent"], json!("consumer"));
        assert_eq!(consumed.meta["type"], json!("expand_contract"));
        assert_eq!(consumed.meta["count"], json!(1));
    }

    struct RecordingSink(Mutex<Vec<String>>);

    impl EventSink for RecordingSink {
        fn record(&self, event: &Event) {
            self.0.lock().unwrap().push(event.kind.clone());
        }
    }

    #[tokio::test]
    async fn sink_sees_every_scheduler_event() {
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let outcome = scheduler(chain_agents(), SchedulerConfig::default())
            .with_sink(sink.clone())
            .run(State::new())
            .await;
        let seen = sink.0.lock().unwrap().clone();
        assert_eq!(seen.len(), outcome.state.events.len());
        assert_eq!(seen.last().map(String::as_str), Some(PIPELINE_TERMINATED));
    }

    #[tokio::test]
    async fn events_returned_as_updates_reach_the_sink() {
        let agents: Vec<Arc<dyn Agent>> = vec![Arc::new(StubAgent::new(
            "reporter",
            |s| !s.contains("reported"),
            |_| {
                Ok(AgentOutput::new()
                    .set("reported", json!(true))
                    .set("events", json!(["custom_a", {"type": "custom_b"}]))
                    .emit("custom_c"))
            },
        ))];
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let outcome = scheduler(agents, SchedulerConfig::default())
            .with_sink(sink.clone())
            .run(State::new())
            .await;

        let in_state = outcome
            .state
            .events
            .iter()
            .map(|e| e.kind.clone())
            .collect::<Vec<_>>();
        let seen = sink.0.lock().unwrap().clone();
        assert_eq!(seen, in_state);
        assert_eq!(
            &seen[..4],
            &["custom_a", "custom_b", "custom_c", AGENT_SUCCEEDED]
        );
        assert!(!outcome.state.contains("events"));
    }
}
