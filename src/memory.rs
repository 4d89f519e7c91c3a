//! Persistent per-agent outcome memory shared across pipeline runs.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::store::{Ephemeral, StorePersistence};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub invocations: u64,
    pub successes: u64,
    pub failures: u64,
    /// Feedback adjustment in [-1, 1].
    #[serde(default)]
    pub score_bonus: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PastRun {
    pub prompt: String,
    pub tech_stack: Vec<String>,
    pub artifacts: Vec<String>,
    pub score: f64,
    pub time_unix_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub state_hash: String,
    pub chosen_agent: String,
    pub outcome: String,
    pub time_unix_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryData {
    #[serde(default)]
    pub past_runs: Vec<PastRun>,
    #[serde(default)]
    pub agent_stats: BTreeMap<String, AgentStats>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryPolicy {
    /// Success estimate reported for an agent with no history.
    pub baseline: f64,
    /// Pseudo-observations of `baseline` blended into the success ratio.
    pub prior_weight: f64,
    /// Fraction of the normalized score distance applied per feedback round.
    pub feedback_rate: f64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            baseline: 0.5,
            prior_weight: 1.0,
            feedback_rate: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySummary {
    pub agents: BTreeMap<String, AgentStats>,
    pub success_rates: BTreeMap<String, f64>,
    pub runs: usize,
    pub decisions: usize,
}

pub struct MemoryStore {
    data: Mutex<MemoryData>,
    persistence: Box<dyn StorePersistence<MemoryData>>,
    policy: MemoryPolicy,
}

impl MemoryStore {
    pub fn open(
        persistence: Box<dyn StorePersistence<MemoryData>>,
        policy: MemoryPolicy,
    ) -> Result<Self> {
        let data = persistence.load()?.unwrap_or_default();
        tracing::debug!(
            store = %persistence.describe(),
            agents = data.agent_stats.len(),
            runs = data.past_runs.len(),
            "memory store loaded"
        );
        Ok(Self {
            data: Mutex::new(data),
            persistence,
            policy: MemoryPolicy {
                baseline: policy.baseline.clamp(0.0, 1.0),
                prior_weight: policy.prior_weight.max(0.0),
                feedback_rate: policy.feedback_rate.max(0.0),
            },
        })
    }

    pub fn ephemeral(policy: MemoryPolicy) -> Self {
        Self {
            data: Mutex::new(MemoryData::default()),
            persistence: Box::new(Ephemeral),
            policy,
        }
    }

    pub fn policy(&self) -> MemoryPolicy {
        self.policy
    }

    /// Runs `f` under the store lock and persists the result before releasing it.
    fn mutate<T>(&self, f: impl FnOnce(&mut MemoryData) -> T) -> Result<T> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let out = f(&mut data);
        self.persistence.save(&data)?;
        Ok(out)
    }

    pub fn record_invocation(&self, agent_id: &str, success: bool) -> Result<()> {
        self.mutate(|data| {
            let stats = data.agent_stats.entry(agent_id.to_string()).or_default();
            stats.invocations += 1;
            if success {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
        })
    }

    pub fn success_rate(&self, agent_id: &str) -> f64 {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        match data.agent_stats.get(agent_id) {
            Some(stats) => estimate(stats, self.policy),
            None => self.policy.baseline,
        }
    }

    pub fn stats(&self, agent_id: &str) -> Option<AgentStats> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.agent_stats.get(agent_id).cloned()
    }

    /// Nudges every participating agent toward `sign(final_score - baseline)`
    /// by an amount proportional to the normalized distance.
    pub fn apply_feedback(&self, agent_ids: &[String], final_score: f64, baseline: f64) -> Result<()> {
        let participants = agent_ids
            .iter()
            .map(String::as_str)
            .collect::<BTreeSet<&str>>();
        if participants.is_empty() || !final_score.is_finite() {
            return Ok(());
        }

        let distance = final_score - baseline;
        let delta = if baseline.abs() > f64::EPSILON {
            distance / baseline.abs()
        } else {
            distance.signum()
        }
        .clamp(-1.0, 1.0);
        let step = delta * self.policy.feedback_rate;

        tracing::debug!(
            agents = participants.len(),
            final_score,
            baseline,
            step,
            "applying memory feedback"
        );

        self.mutate(|data| {
            for agent_id in participants {
                let stats = data.agent_stats.entry(agent_id.to_string()).or_default();
                stats.score_bonus = (stats.score_bonus + step).clamp(-1.0, 1.0);
            }
        })
    }

    pub fn record_run(
        &self,
        prompt: &str,
        tech_stack: Vec<String>,
        artifacts: Vec<String>,
        score: f64,
    ) -> Result<()> {
        self.mutate(|data| {
            data.past_runs.push(PastRun {
                prompt: prompt.to_string(),
                tech_stack,
                artifacts,
                score,
                time_unix_ms: Utc::now().timestamp_millis(),
            });
        })
    }

    /// Logs which agent was chosen for a state shape. The state is fingerprinted
    /// by its sorted key names.
    pub fn record_decision(&self, state_keys: &[String], chosen_agent: &str, outcome: &str) -> Result<()> {
        let mut keys = state_keys.to_vec();
        keys.sort();
        let state_hash = format!("{:x}", md5::compute(keys.join("\n")));
        self.mutate(|data| {
            data.decisions.push(Decision {
                state_hash: state_hash[..16].to_string(),
                chosen_agent: chosen_agent.to_string(),
                outcome: outcome.to_string(),
                time_unix_ms: Utc::now().timestamp_millis(),
            });
        })
    }

    /// Past runs ranked by word-set Jaccard similarity of their prompts.
    pub fn similar_prompts(&self, prompt: &str, top_k: usize) -> Vec<(f64, PastRun)> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let mut scored = data
            .past_runs
            .iter()
            .map(|run| (jaccard(prompt, &run.prompt), run.clone()))
            .filter(|(score, _)| *score > 0.0)
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(top_k);
        scored
    }

    pub fn summary(&self) -> MemorySummary {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        MemorySummary {
            success_rates: data
                .agent_stats
                .iter()
                .map(|(id, stats)| (id.clone(), estimate(stats, self.policy)))
                .collect(),
            agents: data.agent_stats.clone(),
            runs: data.past_runs.len(),
            decisions: data.decisions.len(),
        }
    }
}

fn estimate(stats: &AgentStats, policy: MemoryPolicy) -> f64 {
    let denominator = stats.invocations as f64 + policy.prior_weight;
    let ratio = if denominator <= 0.0 {
        policy.baseline
    } else {
        (stats.successes as f64 + policy.baseline * policy.prior_weight) / denominator
    }
    .clamp(0.0, 1.0);

    let bonus = stats.score_bonus.clamp(-1.0, 1.0);
    let adjusted = if bonus >= 0.0 {
        ratio + (1.0 - ratio) * bonus
    } else {
        ratio * (1.0 + bonus)
    };
    adjusted.clamp(0.0, 1.0)
}

fn word_set(text: &str) -> BTreeSet<String> {
    text.split_whitespace().map(str::to_lowercase).collect()
}

fn jaccard(a: &str, b: &str) -> f64 {
    let (sa, sb) = (word_set(a), word_set(b));
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let shared = sa.intersection(&sb).count() as f64;
    let total = sa.union(&sb).count() as f64;
    shared / total
}
