// Auto-path rules: derive partition keys and buckets from directory segments
use crate::context::segments;
use crate::error::{CaskError, CaskResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a rule's output feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    Partition,
    Bucket,
}

/// Built-in transforms. Rules are data, never code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Use the segment as-is.
    Identity,
    /// Use one capture group of a regex match; no match, no output.
    RegexCapture {
        pattern: String,
        #[serde(default = "default_group")]
        group: usize,
    },
    /// Look the segment up in a fixed table; unknown segments produce nothing.
    Mapping { values: BTreeMap<String, String> },
}

fn default_group() -> usize {
    1
}

/// One configured auto-path rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub target: RuleTarget,
    /// Index into the directory segments (`/a/b/c.txt` has `a`, `b`).
    pub segment: usize,
    #[serde(flatten)]
    pub transform: Transform,
}

/// Bucket and partition keys derived for one path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResolution {
    pub bucket: Option<String>,
    pub partition_keys: Vec<String>,
}

/// Derives partition keys and a storage bucket from a file path.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, directory: &str) -> CaskResult<PathResolution>;
}

enum Compiled {
    Identity,
    Regex(Regex, usize),
    Mapping(BTreeMap<String, String>),
}

/// Evaluates configured [`PathRule`]s in order.
pub struct RuleResolver {
    rules: Vec<(RuleTarget, usize, Compiled)>,
}

impl RuleResolver {
    /// Compile the rules; a bad regex is a configuration error.
    pub fn new(rules: &[PathRule]) -> CaskResult<Self> {
        let rules = rules
            .iter()
            .map(|rule| {
                let compiled = match &rule.transform {
                    Transform::Identity => Compiled::Identity,
                    Transform::RegexCapture { pattern, group } => {
                        let regex = Regex::new(pattern).map_err(|e| {
                            CaskError::config(format!("invalid path rule pattern {:?}: {}", pattern, e))
                        })?;
                        Compiled::Regex(regex, *group)
                    }
                    Transform::Mapping { values } => Compiled::Mapping(values.clone()),
                };
                Ok((rule.target, rule.segment, compiled))
            })
            .collect::<CaskResult<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

fn apply(compiled: &Compiled, segment: &str) -> Option<String> {
    match compiled {
        Compiled::Identity => Some(segment.to_string()),
        Compiled::Regex(regex, group) => regex
            .captures(segment)
            .and_then(|caps| caps.get(*group))
            .map(|m| m.as_str().to_string()),
        Compiled::Mapping(values) => values.get(segment).cloned(),
    }
}

impl PathResolver for RuleResolver {
    fn resolve(&self, directory: &str) -> CaskResult<PathResolution> {
        let parts = segments(directory);
        let mut resolution = PathResolution::default();

        for (target, index, compiled) in &self.rules {
            let Some(segment) = parts.get(*index) else {
                continue;
            };
            let Some(value) = apply(compiled, segment).filter(|v| !v.is_empty()) else {
                continue;
            };
            match target {
                RuleTarget::Partition => {
                    if !resolution.partition_keys.contains(&value) {
                        resolution.partition_keys.push(value);
                    }
                }
                // First matching bucket rule wins
                RuleTarget::Bucket => {
                    if resolution.bucket.is_none() {
                        resolution.bucket = Some(value);
                    }
                }
            }
        }

        Ok(resolution)
    }
}
