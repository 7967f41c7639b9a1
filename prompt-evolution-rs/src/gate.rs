// prompt-evolution-rs/src/gate.rs
// Evaluation gate for candidate prompts.
//
// Checks run in a fixed order. The deterministic checks come first; the
// simulated conversations only run when all of them pass, and are left out
// of the decision otherwise.

use std::sync::Arc;
use std::time::Duration;

use completion_client::TextCompletion;
use shared_types::config::{GateConfig, SimulationScenario};
use shared_types::{CheckResult, EvaluationDecision, PromptContent};
use tracing::instrument;

use crate::error::PipelineError;

pub const STRUCTURAL_INTEGRITY: &str = "structural_integrity";
pub const CORE_INSTRUCTIONS: &str = "core_instructions";
pub const LENGTH_BOUNDS: &str = "length_bounds";
pub const FORBIDDEN_TERMS: &str = "forbidden_terms";
pub const SIMULATED_CONVERSATIONS: &str = "simulated_conversations";

fn check(name: &str, passed: bool, score: f64, message: String) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        passed,
        score,
        message,
    }
}

/// Fraction of `part` over `total`, 1.0 when there is nothing to count.
fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        part as f64 / total as f64
    }
}

pub fn check_structural_integrity(candidate: &PromptContent, active: &PromptContent) -> CheckResult {
    let declared = candidate.tool_names();
    let required = active.tool_names();
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| !declared.contains(name))
        .collect();
    let score = ratio(required.len() - missing.len(), required.len());
    if missing.is_empty() {
        check(
            STRUCTURAL_INTEGRITY,
            true,
            score,
            format!("all {} tool declarations preserved", required.len()),
        )
    } else {
        check(
            STRUCTURAL_INTEGRITY,
            false,
            score,
            format!("missing tool declarations: {}", missing.join(", ")),
        )
    }
}

pub fn check_core_instructions(
    candidate: &PromptContent,
    active: &PromptContent,
    phrases: &[String],
) -> CheckResult {
    let active_text = active.render().to_lowercase();
    let candidate_text = candidate.render().to_lowercase();
    let required: Vec<&String> = phrases
        .iter()
        .filter(|p| active_text.contains(&p.to_lowercase()))
        .collect();
    let dropped: Vec<&str> = required
        .iter()
        .filter(|p| !candidate_text.contains(&p.to_lowercase()))
        .map(|p| p.as_str())
        .collect();
    let score = ratio(required.len() - dropped.len(), required.len());
    if dropped.is_empty() {
        check(
            CORE_INSTRUCTIONS,
            true,
            score,
            format!("{} core phrases preserved", required.len()),
        )
    } else {
        check(
            CORE_INSTRUCTIONS,
            false,
            score,
            format!("core phrases dropped: {}", dropped.join(", ")),
        )
    }
}

pub fn check_length_bounds(
    candidate: &PromptContent,
    active: &PromptContent,
    config: &GateConfig,
) -> CheckResult {
    let len = candidate.rendered_len();
    let base = active.rendered_len();
    let growth = if base == 0 { 1.0 } else { len as f64 / base as f64 };

    let mut problems = Vec::new();
    if len < config.min_chars {
        problems.push(format!("{len} chars is below the minimum of {}", config.min_chars));
    }
    if len > config.max_chars {
        problems.push(format!("{len} chars exceeds the maximum of {}", config.max_chars));
    }
    if growth > config.max_growth_ratio {
        problems.push(format!(
            "growth {growth:.2}x exceeds {:.2}x",
            config.max_growth_ratio
        ));
    }

    if problems.is_empty() {
        check(
            LENGTH_BOUNDS,
            true,
            1.0,
            format!("{len} chars, growth {growth:.2}x"),
        )
    } else {
        check(LENGTH_BOUNDS, false, 0.0, problems.join("; "))
    }
}

pub fn check_forbidden_terms(candidate: &PromptContent, terms: &[String]) -> CheckResult {
    let text = candidate.render().to_lowercase();
    let found: Vec<&str> = terms
        .iter()
        .filter(|t| text.contains(&t.to_lowercase()))
        .map(|t| t.as_str())
        .collect();
    if found.is_empty() {
        check(FORBIDDEN_TERMS, true, 1.0, "no forbidden terms".to_string())
    } else {
        check(
            FORBIDDEN_TERMS,
            false,
            0.0,
            format!("forbidden terms present: {}", found.join(", ")),
        )
    }
}

/// Keyword score of one simulated reply.
pub fn score_reply(reply: &str, scenario: &SimulationScenario) -> f64 {
    let reply = reply.to_lowercase();
    if scenario
        .forbidden_keywords
        .iter()
        .any(|k| reply.contains(&k.to_lowercase()))
    {
        return 0.0;
    }
    let hits = scenario
        .expected_keywords
        .iter()
        .filter(|k| reply.contains(&k.to_lowercase()))
        .count();
    ratio(hits, scenario.expected_keywords.len())
}

pub fn simulation_prompt(candidate: &PromptContent, scenario: &SimulationScenario) -> String {
    let mut prompt = format!(
        "{}\n\nYou are the agent described above. Reply to the customer with a single message.\n\n",
        candidate.render()
    );
    for turn in &scenario.customer_turns {
        prompt.push_str("Customer: ");
        prompt.push_str(turn);
        prompt.push('\n');
    }
    prompt.push_str("Agent:");
    prompt
}

pub struct EvaluationGate {
    completion: Arc<dyn TextCompletion>,
    config: GateConfig,
    timeout: Duration,
}

impl EvaluationGate {
    pub fn new(completion: Arc<dyn TextCompletion>, config: GateConfig, timeout: Duration) -> Self {
        Self {
            completion,
            config,
            timeout,
        }
    }

    async fn simulate(&self, candidate: &PromptContent) -> Result<CheckResult, PipelineError> {
        let mut scores = Vec::with_capacity(self.config.scenarios.len());
        for scenario in &self.config.scenarios {
            let reply = completion_client::complete_within(
                self.completion.as_ref(),
                &simulation_prompt(candidate, scenario),
                self.timeout,
            )
            .await?;
            let score = score_reply(&reply, scenario);
            tracing::debug!(scenario = %scenario.id, score, "simulated conversation scored");
            scores.push((scenario.id.as_str(), score));
        }

        let mean = if scores.is_empty() {
            1.0
        } else {
            scores.iter().map(|(_, s)| s).sum::<f64>() / scores.len() as f64
        };
        let below_floor: Vec<&str> = scores
            .iter()
            .filter(|(_, s)| *s < self.config.scenario_floor)
            .map(|(id, _)| *id)
            .collect();
        let detail = scores
            .iter()
            .map(|(id, s)| format!("{id}={s:.2}"))
            .collect::<Vec<_>>()
            .join(", ");

        let passed = mean >= self.config.simulation_threshold && below_floor.is_empty();
        let message = if passed {
            format!("mean {mean:.2} ({detail})")
        } else if !below_floor.is_empty() {
            format!(
                "scenarios below floor {:.2}: {} ({detail})",
                self.config.scenario_floor,
                below_floor.join(", ")
            )
        } else {
            format!(
                "mean {mean:.2} below threshold {:.2} ({detail})",
                self.config.simulation_threshold
            )
        };
        Ok(check(SIMULATED_CONVERSATIONS, passed, mean, message))
    }

    /// Decide whether `candidate` may replace `active`.
    ///
    /// A completion failure during simulation is returned as an error, not
    /// as a rejection.
    #[instrument(name = "candidate_evaluation", skip_all)]
    pub async fn evaluate(
        &self,
        candidate: &PromptContent,
        active: &PromptContent,
    ) -> Result<EvaluationDecision, PipelineError> {
        let mut checks = vec![
            check_structural_integrity(candidate, active),
            check_core_instructions(candidate, active, &self.config.core_phrases),
            check_length_bounds(candidate, active, &self.config),
            check_forbidden_terms(candidate, &self.config.forbidden_terms),
        ];

        if checks.iter().all(|c| c.passed) {
            checks.push(self.simulate(candidate).await?);
        } else {
            tracing::info!("deterministic checks failed; skipping simulated conversations");
        }

        let decision = EvaluationDecision::from_checks(checks);
        metrics::increment_counter!(
            "candidate_evaluations_total",
            "approved" => if decision.approved { "true" } else { "false" }
        );
        tracing::info!(
            approved = decision.approved,
            reasons = ?decision.reasons,
            "candidate evaluated"
        );
        Ok(decision)
    }
}
