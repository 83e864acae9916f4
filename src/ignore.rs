//! Ignore rules for pod log recording.
//!
//! File format, one rule per line:
//!
//! ```text
//! # comment
//! kube-system/cilium ~~ level=info
//! noisy-job
//! ```
//!
//! The left side matches `namespace/pod/container`. Without a right side the
//! container is not tailed at all.

use anyhow::Context;
use regex::Regex;
use std::path::Path;

use crate::error::IgnoreRuleError;
use crate::types::{IgnoreRule, PodTarget};

const SEPARATOR: &str = "~~";

pub fn parse_rules(text: &str) -> Result<Vec<IgnoreRule>, IgnoreRuleError> {
    let mut rules = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = trimmed.split(SEPARATOR).collect();
        if parts.len() > 2 {
            return Err(IgnoreRuleError::Syntax {
                line,
                text: trimmed.to_string(),
            });
        }
        let file_pattern = parts[0].trim();
        if file_pattern.is_empty() {
            return Err(IgnoreRuleError::EmptyFileRegex { line });
        }
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|source| IgnoreRuleError::Regex {
                line,
                pattern: pattern.to_string(),
                source,
            })
        };
        let file_match = compile(file_pattern)?;
        let line_match = match parts.get(1).map(|s| s.trim()) {
            Some(p) if !p.is_empty() => Some(compile(p)?),
            _ => None,
        };
        rules.push(IgnoreRule {
            file_match,
            line_match,
        });
    }
    Ok(rules)
}

pub fn load_rules(path: &Path) -> anyhow::Result<Vec<IgnoreRule>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_rules(&text).with_context(|| format!("Invalid ignore file {}", path.display()))
}

pub fn identity(namespace: &str, pod: &str, container: &str) -> String {
    format!("{}/{}/{}", namespace, pod, container)
}

/// A container to tail together with the line filters that apply to it.
#[derive(Debug, Clone)]
pub struct TailPlan {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub line_filters: Vec<Regex>,
}

/// Expand pods into containers, dropping the ones excluded entirely and
/// collecting the line filters of the rest.
pub fn plan_tails(pods: &[PodTarget], rules: &[IgnoreRule]) -> Vec<TailPlan> {
    let mut plans = Vec::new();
    for pod in pods {
        for container in &pod.containers {
            let id = identity(&pod.namespace, &pod.name, container);
            let matching = rules.iter().filter(|r| r.file_match.is_match(&id));
            let mut line_filters = Vec::new();
            let mut excluded = false;
            for rule in matching {
                match &rule.line_match {
                    Some(re) => line_filters.push(re.clone()),
                    None => excluded = true,
                }
            }
            if excluded {
                tracing::info!("Not tailing {}: excluded by ignore rule", id);
                continue;
            }
            plans.push(TailPlan {
                namespace: pod.namespace.clone(),
                pod: pod.name.clone(),
                container: container.clone(),
                line_filters,
            });
        }
    }
    plans
}
