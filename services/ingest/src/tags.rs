//! Tag extraction, tag normalization and dedup-key generation.
//!
//! The dedup key is what makes re-imports safe: the same logical observation
//! must always hash to the same key, whatever order its tags were collected in
//! and however the vendor happened to spell a range.

use crate::normalize::unify_range_separators;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Only these keys survive normalization.
pub const TAG_WHITELIST: &[&str] = &[
    "scale",
    "weight_band",
    "farming_mode",
    "sentiment",
    "city",
    "contract",
    "option_type",
    "strike",
];

pub type Tags = BTreeMap<String, String>;

/// Canonical form: whitelisted keys only, values trimmed and lower-cased,
/// range separators unified to `-`, empty values dropped.
pub fn normalize_tags<'a, I>(tags: I) -> Tags
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    tags.into_iter()
        .filter_map(|(k, v)| {
            let key = k.trim().to_lowercase();
            if !TAG_WHITELIST.contains(&key.as_str()) {
                return None;
            }
            let value = normalize_tag_value(v);
            (!value.is_empty()).then_some((key, value))
        })
        .collect()
}

pub fn normalize_tag_value(value: &str) -> String {
    let unified = unify_range_separators(value.trim()).to_lowercase();
    unified.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex SHA-256 of the canonical `k=v` list. Input order does not matter.
pub fn tags_hash(tags: &Tags) -> String {
    let canonical = tags
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(";");
    hex_sha256(canonical.as_bytes())
}

/// Dimension ids that take part in the observation identity; 0 means "none".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionIds {
    pub geo_id: i64,
    pub company_id: i64,
    pub warehouse_id: i64,
}

/// Date component of the key: a single day, or a period written as `start/end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationTime {
    Day(chrono::NaiveDate),
    Period(chrono::NaiveDate, chrono::NaiveDate),
}

impl ObservationTime {
    pub fn iso(&self) -> String {
        match self {
            ObservationTime::Day(d) => d.format("%Y-%m-%d").to_string(),
            ObservationTime::Period(s, e) => format!("{}/{}", s.format("%Y-%m-%d"), e.format("%Y-%m-%d")),
        }
    }
}

/// `sha256(metric_id | date | geo | company | warehouse | sha256(tags))`.
///
/// Tags are hashed first so the key has a fixed length regardless of how many
/// tags an observation carries. `tags` is normalized here, so callers may pass
/// raw extracted tags.
pub fn dedup_key(metric_id: i64, time: ObservationTime, dims: DimensionIds, tags: &Tags) -> String {
    let normalized = normalize_tags(tags);
    let material = format!(
        "{}|{}|{}|{}|{}|{}",
        metric_id,
        time.iso(),
        dims.geo_id,
        dims.company_id,
        dims.warehouse_id,
        tags_hash(&normalized)
    );
    hex_sha256(material.as_bytes())
}

pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// =============================================================================
// KEYWORD RULES
// =============================================================================

/// One keyword rule: if the label contains any of `any`, and none of
/// `exclude`, the tag `key` is set to `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRule {
    pub key: String,
    pub value: String,
    pub any: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TagRule {
    pub fn new(key: &str, value: &str, any: &[&str], exclude: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            any: any.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn matches(&self, label: &str) -> bool {
        let label = unify_range_separators(label).to_lowercase();
        self.any.iter().any(|p| label.contains(&unify_range_separators(p).to_lowercase()))
            && !self.exclude.iter().any(|p| label.contains(&p.to_lowercase()))
    }
}

/// Ordered keyword rules. The first matching rule for a given key wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRules {
    rules: Vec<TagRule>,
}

impl Default for TagRules {
    /// Small built-in table; profiles extend it with their own rules.
    fn default() -> Self {
        let r = TagRule::new;
        Self {
            rules: vec![
                r("scale", "large", &["规模场", "集团"], &["中小"]),
                r("scale", "small", &["散户", "中小"], &[]),
                r("weight_band", "<90kg", &["90kg以下", "90公斤以下"], &[]),
                r("weight_band", "90-110kg", &["90-110"], &[]),
                r("weight_band", "110-125kg", &["110-125"], &[]),
                r("weight_band", "125-140kg", &["125-140"], &[]),
                r("weight_band", "140-150kg", &["140-150"], &[]),
                r("weight_band", ">150kg", &["150kg以上", "150公斤以上"], &[]),
                r("farming_mode", "self_breeding", &["自繁自养"], &[]),
                r("farming_mode", "purchased_piglet", &["外购仔猪"], &[]),
                r("sentiment", "bullish", &["看涨"], &[]),
                r("sentiment", "bearish", &["看跌"], &[]),
                r("sentiment", "neutral", &["持平", "看平"], &[]),
                r("option_type", "call", &["看涨期权", "call"], &[]),
                r("option_type", "put", &["看跌期权", "put"], &[]),
            ],
        }
    }
}

impl TagRules {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Profile rules are evaluated before the built-in ones.
    pub fn with_overrides(overrides: &[TagRule]) -> Self {
        let mut rules = overrides.to_vec();
        rules.extend(Self::default().rules);
        Self { rules }
    }

    pub fn rules(&self) -> &[TagRule] {
        &self.rules
    }

    /// Tags implied by a set of labels (header, sub-label, row label).
    pub fn extract(&self, labels: &[&str]) -> Tags {
        let mut tags = Tags::new();
        for label in labels.iter().filter(|l| !l.trim().is_empty()) {
            for rule in &self.rules {
                if tags.contains_key(&rule.key) {
                    continue;
                }
                if rule.matches(label) {
                    tags.insert(rule.key.clone(), rule.value.clone());
                }
            }
        }
        tags
    }
}

/// Merge tag layers; later layers override earlier ones.
pub fn merge_layers(layers: &[&Tags]) -> Tags {
    let mut out = Tags::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}
