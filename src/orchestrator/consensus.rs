//! Consensus policies
//!
//! A policy reconciles the successful responses of one ensemble request into
//! a single agreement level and content. Two policies ship with the crate:
//! [`ConfidenceAverage`] keeps the first response and reports mean confidence,
//! [`MajorityVote`] runs a confidence-weighted vote per topic.

use crate::orchestrator::config::{AggregationConfig, ConsensusKind};
use crate::provider::ProviderResponse;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::OnceLock;

/// Topic name used when responses are not JSON objects
pub const WHOLE_CONTENT_TOPIC: &str = "content";

/// One distinct answer for a topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteOption {
    /// Representative value of the cluster
    pub value: Value,
    /// Providers that gave this answer
    pub providers: Vec<String>,
    /// Summed confidence of those providers
    pub weight: f64,
}

/// Voting outcome for one topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicVote {
    /// Winning value
    pub winner: Value,
    /// Winner weight over the weight of every response
    pub support: f64,
    /// All distinct answers, strongest first
    pub options: Vec<VoteOption>,
}

/// Reconciled outcome of one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Agreement level in [0, 1]
    pub agreement_level: f64,
    /// Reconciled content
    pub content: Value,
    /// Human-readable disagreement notes
    pub disagreements: Vec<String>,
    /// Per-topic votes (empty for policies that do not vote)
    pub voting: BTreeMap<String, TopicVote>,
    /// Whether agreement reached the configured threshold
    pub consensus_reached: bool,
    /// Policy that produced this result
    pub policy: String,
}

impl ConsensusResult {
    fn empty(policy: &str) -> Self {
        Self {
            agreement_level: 0.0,
            content: Value::Null,
            disagreements: Vec::new(),
            voting: BTreeMap::new(),
            consensus_reached: false,
            policy: policy.to_string(),
        }
    }
}

/// Pluggable reconciliation of successful responses
pub trait ConsensusPolicy: Send + Sync {
    /// Policy name, reported in results
    fn name(&self) -> &str;

    /// Reconcile responses; an empty slice yields zero agreement
    fn reconcile(&self, responses: &[ProviderResponse], config: &AggregationConfig)
        -> ConsensusResult;
}

/// Build the policy selected in configuration
pub fn policy_for(kind: ConsensusKind) -> Box<dyn ConsensusPolicy> {
    match kind {
        ConsensusKind::ConfidenceAverage => Box::new(ConfidenceAverage),
        ConsensusKind::MajorityVote => Box::new(MajorityVote),
    }
}

/// First response wins; agreement is the mean confidence
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceAverage;

impl ConsensusPolicy for ConfidenceAverage {
    fn name(&self) -> &str {
        "confidence_average"
    }

    fn reconcile(
        &self,
        responses: &[ProviderResponse],
        config: &AggregationConfig,
    ) -> ConsensusResult {
        let Some(first) = responses.first() else {
            return ConsensusResult::empty(self.name());
        };
        let agreement = mean_confidence(responses);
        ConsensusResult {
            agreement_level: agreement,
            content: first.content.clone(),
            disagreements: Vec::new(),
            voting: BTreeMap::new(),
            consensus_reached: agreement >= config.consensus_threshold,
            policy: self.name().to_string(),
        }
    }
}

/// Confidence-weighted vote per topic.
///
/// When every response is a JSON object each key is a topic; otherwise the
/// whole content is one topic. Text answers whose token overlap reaches
/// `component_clustering_threshold` count as the same answer. Ties go to
/// the answer with more providers, then to the alphabetically first provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct MajorityVote;

impl ConsensusPolicy for MajorityVote {
    fn name(&self) -> &str {
        "majority_vote"
    }

    fn reconcile(
        &self,
        responses: &[ProviderResponse],
        config: &AggregationConfig,
    ) -> ConsensusResult {
        if responses.is_empty() {
            return ConsensusResult::empty(self.name());
        }

        let by_topic = responses.iter().all(|r| r.content.is_object());
        let topics: BTreeSet<String> = if by_topic {
            responses
                .iter()
                .filter_map(|r| r.content.as_object())
                .flat_map(|o| o.keys().cloned())
                .collect()
        } else {
            BTreeSet::from([WHOLE_CONTENT_TOPIC.to_string()])
        };

        // Missing answers still count against support.
        let total_weight: f64 = responses.iter().map(vote_weight).sum();

        let mut voting = BTreeMap::new();
        let mut disagreements = Vec::new();
        for topic in topics {
            let answers = responses.iter().filter_map(|r| {
                let value = if by_topic {
                    r.content.get(&topic)?
                } else {
                    &r.content
                };
                Some((r, value))
            });
            let options = cluster(answers, config.component_clustering_threshold);
            let Some(best) = options.first() else {
                continue;
            };
            let support = if total_weight > 0.0 {
                best.weight / total_weight
            } else {
                0.0
            };
            if options.len() > 1 {
                disagreements.push(format!(
                    "{}: {} distinct answers, winner supported by {:.0}%",
                    topic,
                    options.len(),
                    support * 100.0
                ));
            }
            voting.insert(
                topic,
                TopicVote {
                    winner: best.value.clone(),
                    support,
                    options,
                },
            );
        }

        let agreement = if voting.is_empty() {
            0.0
        } else {
            voting.values().map(|v| v.support).sum::<f64>() / voting.len() as f64
        };
        let content = if by_topic {
            Value::Object(
                voting
                    .iter()
                    .map(|(topic, vote)| (topic.clone(), vote.winner.clone()))
                    .collect(),
            )
        } else {
            voting
                .get(WHOLE_CONTENT_TOPIC)
                .map(|v| v.winner.clone())
                .unwrap_or(Value::Null)
        };

        ConsensusResult {
            agreement_level: agreement,
            content,
            disagreements,
            voting,
            consensus_reached: agreement >= config.consensus_threshold,
            policy: self.name().to_string(),
        }
    }
}

/// Mean confidence of the responses, 0 for none
pub(crate) fn mean_confidence(responses: &[ProviderResponse]) -> f64 {
    if responses.is_empty() {
        return 0.0;
    }
    responses.iter().map(|r| r.confidence).sum::<f64>() / responses.len() as f64
}

fn vote_weight(response: &ProviderResponse) -> f64 {
    response.confidence.clamp(0.0, 1.0)
}

fn cluster<'a>(
    answers: impl Iterator<Item = (&'a ProviderResponse, &'a Value)>,
    threshold: f64,
) -> Vec<VoteOption> {
    let mut options: Vec<VoteOption> = Vec::new();
    for (response, value) in answers {
        let weight = vote_weight(response);
        match options
            .iter_mut()
            .find(|o| same_answer(&o.value, value, threshold))
        {
            Some(option) => {
                option.providers.push(response.provider.clone());
                option.weight += weight;
            }
            None => options.push(VoteOption {
                value: value.clone(),
                providers: vec![response.provider.clone()],
                weight,
            }),
        }
    }

    for option in &mut options {
        option.providers.sort();
    }
    options.sort_by(|a, b| {
        b.weight
            .total_cmp(&a.weight)
            .then_with(|| b.providers.len().cmp(&a.providers.len()))
            .then_with(|| a.providers.first().cmp(&b.providers.first()))
    });
    options
}

fn same_answer(a: &Value, b: &Value, threshold: f64) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => token_similarity(x, y) >= threshold,
        _ => a == b,
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid token pattern"))
}

/// Jaccard similarity of lowercase word tokens
pub(crate) fn token_similarity(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> HashSet<String> {
        token_pattern()
            .find_iter(s)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    };
    let (left, right) = (tokens(a), tokens(b));
    if left.is_empty() && right.is_empty() {
        return 1.0;
    }
    let shared = left.intersection(&right).count() as f64;
    let union = left.union(&right).count() as f64;
    shared / union
}
