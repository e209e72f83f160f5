use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, info, warn};

use super::{DecisionRule, RuleError, RuleEvaluationResult, RuleResult, RuleStatus};
use crate::condition::{Condition, ConditionEvaluator, ValueResolver};
use crate::config::RulesConfig;

/// Ordering key used to pick one rule among several matching ones.
///
/// Higher priority wins; on equal priority the rule registered first wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleRank {
    pub priority: i32,
    pub registration: u64,
}

/// Returns the candidate with the best [`RuleRank`].
pub fn select_winner<T>(candidates: impl IntoIterator<Item = (RuleRank, T)>) -> Option<T> {
    candidates
        .into_iter()
        .max_by(|(a, _), (b, _)| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.registration.cmp(&a.registration))
        })
        .map(|(_, candidate)| candidate)
}

struct RegisteredRule {
    rule: DecisionRule,
    // 登録時に一度だけコンパイル
    condition: Condition,
    registration: u64,
}

impl RegisteredRule {
    fn rank(&self) -> RuleRank {
        RuleRank {
            priority: self.rule.priority(),
            registration: self.registration,
        }
    }
}

/// Registry and evaluator of decision rules.
///
/// Rules live in a concurrent map, so writers on one rule id never block
/// readers of another.
pub struct RuleEngine {
    rules: DashMap<String, RegisteredRule>,
    next_registration: AtomicU64,
    evaluator: ConditionEvaluator,
    config: RulesConfig,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(RulesConfig::default())
    }
}

impl RuleEngine {
    pub fn new(config: RulesConfig) -> Self {
        Self {
            rules: DashMap::new(),
            next_registration: AtomicU64::new(0),
            evaluator: ConditionEvaluator::new(),
            config,
        }
    }

    pub fn config(&self) -> &RulesConfig {
        &self.config
    }

    /// Checks a rule without registering it.
    pub fn validate(&self, rule: &DecisionRule) -> RuleResult<Condition> {
        if rule.id().trim().is_empty() {
            return Err(RuleError::Validation {
                rule_id: rule.id().to_string(),
                message: "rule id is empty".to_string(),
            });
        }
        rule.condition()
            .validate()
            .map_err(|e| RuleError::Validation {
                rule_id: rule.id().to_string(),
                message: e.to_string(),
            })?;

        let namespaces = &self.config.required_namespaces;
        if !namespaces.is_empty() {
            let references = rule.condition().references();
            let covered = references
                .iter()
                .any(|key| namespaces.iter().any(|ns| key.starts_with(ns.as_str())));
            if !covered {
                return Err(RuleError::MissingNamespace {
                    rule_id: rule.id().to_string(),
                    namespaces: namespaces.join(", "),
                });
            }
        }
        Ok(Condition::from(rule.condition()))
    }

    #[tracing::instrument(level = "debug", skip(self, rule), fields(rule_id = %rule.id()))]
    pub fn add_rule(&self, rule: DecisionRule) -> RuleResult<()> {
        let condition = self.validate(&rule)?;
        match self.rules.entry(rule.id().to_string()) {
            Entry::Occupied(_) => Err(RuleError::Duplicate {
                rule_id: rule.id().to_string(),
            }),
            Entry::Vacant(entry) => {
                let registration = self.next_registration.fetch_add(1, Ordering::SeqCst);
                info!(name = %rule.name(), priority = rule.priority(), "rule added");
                entry.insert(RegisteredRule {
                    rule,
                    condition,
                    registration,
                });
                Ok(())
            }
        }
    }

    /// Every registered rule, in registration order.
    pub fn get_rules(&self) -> Vec<DecisionRule> {
        let mut rules: Vec<_> = self
            .rules
            .iter()
            .map(|entry| (entry.registration, entry.rule.clone()))
            .collect();
        rules.sort_by_key(|(registration, _)| *registration);
        rules.into_iter().map(|(_, rule)| rule).collect()
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<DecisionRule> {
        self.rules.get(rule_id).map(|entry| entry.rule.clone())
    }

    pub fn remove_rule(&self, rule_id: &str) -> Option<DecisionRule> {
        let removed = self.rules.remove(rule_id).map(|(_, entry)| entry.rule);
        if removed.is_some() {
            info!(rule_id, "rule removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn update_rule_status(&self, rule_id: &str, status: RuleStatus) -> RuleResult<()> {
        let mut entry = self
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| RuleError::NotFound {
                rule_id: rule_id.to_string(),
            })?;
        let previous = entry.rule.status();
        entry.rule.set_status(status);
        info!(rule_id, %previous, %status, "rule status updated");
        Ok(())
    }

    /// Evaluates one rule whatever its status. Unknown ids and evaluation
    /// faults come back as failed results.
    #[tracing::instrument(level = "debug", skip(self, resolver))]
    pub fn evaluate_rule<R: ValueResolver + ?Sized>(
        &self,
        rule_id: &str,
        resolver: &R,
    ) -> RuleEvaluationResult {
        let Some(entry) = self.rules.get(rule_id) else {
            warn!("rule not found");
            return RuleEvaluationResult::not_found(rule_id);
        };
        self.evaluate_entry(&entry, resolver)
    }

    fn evaluate_entry<R: ValueResolver + ?Sized>(
        &self,
        entry: &RegisteredRule,
        resolver: &R,
    ) -> RuleEvaluationResult {
        let rule_id = entry.rule.id();
        match self.evaluator.try_evaluate(&entry.condition, resolver) {
            Ok(matched) => {
                let (actions, confidence) = if matched {
                    (entry.rule.then_actions(), self.config.matched_confidence)
                } else {
                    (entry.rule.else_actions(), self.config.unmatched_confidence)
                };
                debug!(rule_id, matched, actions = actions.len(), "rule evaluated");
                RuleEvaluationResult {
                    rule_id: rule_id.to_string(),
                    matched,
                    confidence,
                    error: None,
                    actions: actions.to_vec(),
                }
            }
            Err(error) => {
                warn!(rule_id, %error, "rule evaluation failed");
                RuleEvaluationResult::failed(rule_id, error.to_string())
            }
        }
    }

    fn active_ids(&self) -> Vec<String> {
        let mut active: Vec<_> = self
            .rules
            .iter()
            .filter(|entry| entry.rule.status() == RuleStatus::Active)
            .map(|entry| (entry.registration, entry.key().clone()))
            .collect();
        active.sort_by_key(|(registration, _)| *registration);
        active.into_iter().map(|(_, id)| id).collect()
    }

    /// Evaluates every active rule, in registration order.
    pub fn evaluate_all<R: ValueResolver + ?Sized>(&self, resolver: &R) -> Vec<RuleEvaluationResult> {
        self.evaluate_ranked(resolver)
            .into_iter()
            .map(|(_, result)| result)
            .collect()
    }

    fn evaluate_ranked<R: ValueResolver + ?Sized>(
        &self,
        resolver: &R,
    ) -> Vec<(RuleRank, RuleEvaluationResult)> {
        self.active_ids()
            .into_iter()
            .filter_map(|id| {
                // 取得と評価の間に削除されたルールはスキップ
                let entry = self.rules.get(&id)?;
                Some((entry.rank(), self.evaluate_entry(&entry, resolver)))
            })
            .collect()
    }

    /// Picks the matching active rule with the highest priority. Ties go to
    /// the rule registered first.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn select<R: ValueResolver + ?Sized>(&self, resolver: &R) -> Option<RuleEvaluationResult> {
        let winner = select_winner(
            self.evaluate_ranked(resolver)
                .into_iter()
                .filter(|(_, result)| result.matched),
        );
        if let Some(result) = &winner {
            debug!(rule_id = %result.rule_id, "rule selected");
        }
        winner
    }
}
