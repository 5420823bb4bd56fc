//! Sheet dispatch: which rule of the profile applies to a worksheet.
//!
//! Exact sheet names win. Otherwise pattern rules are tried by descending
//! priority, declaration order breaking ties. A sheet no rule claims is
//! recorded as unmapped, which is not an error.

use crate::profile::{IngestProfile, SheetRule, SheetSelector, SheetStrategy};
use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub enum SheetAction<'p> {
    Parse(&'p SheetRule),
    Skip,
    RawTableOnly,
    Unmapped,
}

impl SheetAction<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            SheetAction::Parse(_) => "parse",
            SheetAction::Skip => "skip",
            SheetAction::RawTableOnly => "raw_table_only",
            SheetAction::Unmapped => "unmapped",
        }
    }
}

/// Audit record of one dispatch, kept in the batch's resolved mapping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchDecision {
    pub sheet: String,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub struct Dispatcher<'p> {
    profile: &'p IngestProfile,
    /// Indices of pattern rules, best first.
    patterns: Vec<usize>,
}

impl<'p> Dispatcher<'p> {
    pub fn new(profile: &'p IngestProfile) -> Self {
        let mut patterns: Vec<usize> = profile
            .sheets
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r.selector, SheetSelector::Pattern(_)))
            .map(|(i, _)| i)
            .collect();
        patterns.sort_by_key(|&i| (std::cmp::Reverse(profile.sheets[i].priority), profile.sheets[i].order));
        Self { profile, patterns }
    }

    pub fn resolve(&self, sheet_name: &str) -> Option<&'p SheetRule> {
        let name = sheet_name.trim();
        let profile = self.profile;
        let exact = profile
            .sheets
            .iter()
            .find(|r| matches!(&r.selector, SheetSelector::Exact(n) if n == name));
        if exact.is_some() {
            return exact;
        }
        self.patterns.iter().map(|&i| &profile.sheets[i]).find(|r| match &r.selector {
            SheetSelector::Pattern(re) => re.is_match(name),
            SheetSelector::Exact(_) => false,
        })
    }

    pub fn dispatch(&self, sheet_name: &str) -> (SheetAction<'p>, DispatchDecision) {
        let mut decision = DispatchDecision {
            sheet: sheet_name.to_string(),
            action: SheetAction::Unmapped.as_str(),
            parser: None,
            matched_by: None,
            priority: None,
            reason: None,
        };
        let Some(rule) = self.resolve(sheet_name) else {
            return (SheetAction::Unmapped, decision);
        };
        let action = match &rule.strategy {
            SheetStrategy::Narrow(_) | SheetStrategy::Wide(_) => SheetAction::Parse(rule),
            SheetStrategy::RawTableOnly => SheetAction::RawTableOnly,
            SheetStrategy::Skip { reason } => {
                decision.reason = reason.clone();
                SheetAction::Skip
            }
        };
        decision.action = action.as_str();
        decision.parser = matches!(action, SheetAction::Parse(_)).then(|| rule.strategy.parser_name());
        decision.matched_by = Some(rule.selector.describe());
        decision.priority = Some(rule.priority);
        (action, decision)
    }
}
