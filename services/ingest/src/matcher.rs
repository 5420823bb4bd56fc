//! Header-to-metric assignment.
//!
//! Matching runs as three ordered passes over the profile's metric templates:
//! exact header equality, then substring containment, then regex patterns.
//! Containment and pattern rules honour each template's exclude keywords.
//! Within a pass templates are tried in declaration order and columns left to
//! right. Once a column is assigned it is never revisited, so one column can
//! never feed two metrics.

use crate::profile::MetricTemplate;
use std::collections::HashSet;

/// The three matching passes, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchPass {
    Exact,
    Contains,
    Pattern,
}

impl MatchPass {
    pub const ORDER: [MatchPass; 3] = [MatchPass::Exact, MatchPass::Contains, MatchPass::Pattern];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPass::Exact => "exact",
            MatchPass::Contains => "contains",
            MatchPass::Pattern => "pattern",
        }
    }
}

/// Whitespace-insensitive comparison form of a header.
pub fn normalize_header(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn excluded(template: &MetricTemplate, header: &str) -> bool {
    template
        .exclude_keywords
        .iter()
        .any(|k| !k.is_empty() && header.contains(&normalize_header(k)))
}

/// Whether `template` matches `header` under a single pass. Each pass is a
/// pure predicate so it can be tested in isolation.
pub fn rule_matches(pass: MatchPass, template: &MetricTemplate, header: &str) -> bool {
    let header = normalize_header(header);
    if header.is_empty() {
        return false;
    }
    match pass {
        MatchPass::Exact => template.raw_headers.iter().any(|h| normalize_header(h) == header),
        MatchPass::Contains => {
            !excluded(template, &header)
                && template
                    .contains
                    .iter()
                    .any(|c| !c.is_empty() && header.contains(&normalize_header(c)))
        }
        MatchPass::Pattern => {
            !excluded(template, &header)
                && template.pattern.as_ref().is_some_and(|re| re.is_match(&header))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnAssignment {
    pub column: u32,
    /// Index into the template slice.
    pub template: usize,
    pub header: String,
    pub pass: MatchPass,
}

/// Assign header columns to templates. `headers` is `(column, text)` in
/// left-to-right order; the result is sorted by column.
pub fn assign_columns(headers: &[(u32, String)], templates: &[MetricTemplate]) -> Vec<ColumnAssignment> {
    let mut taken_columns: HashSet<u32> = HashSet::new();
    let mut used_templates: HashSet<usize> = HashSet::new();
    let mut out = Vec::new();

    for pass in MatchPass::ORDER {
        for (t_idx, template) in templates.iter().enumerate() {
            if !template.multi && used_templates.contains(&t_idx) {
                continue;
            }
            for (column, header) in headers {
                if taken_columns.contains(column) {
                    continue;
                }
                if !rule_matches(pass, template, header) {
                    continue;
                }
                taken_columns.insert(*column);
                used_templates.insert(t_idx);
                out.push(ColumnAssignment {
                    column: *column,
                    template: t_idx,
                    header: header.clone(),
                    pass,
                });
                if !template.multi {
                    break;
                }
            }
        }
    }

    out.sort_by_key(|a| a.column);
    out
}

/// Region part of a vendor header such as `商品猪：出栏均价：黑龙江（日）`:
/// the last colon-separated segment with any trailing frequency marker removed.
pub fn region_from_header(header: &str) -> Option<String> {
    let last = header.rsplit(['：', ':']).next()?.trim();
    let stripped = match last.find(['（', '(']) {
        Some(pos) => &last[..pos],
        None => last,
    };
    let stripped = stripped.trim();
    (!stripped.is_empty() && stripped != header.trim()).then(|| stripped.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{GeoStrategy, MetricCategory};
    use regex::Regex;

    fn template(key: &str) -> MetricTemplate {
        MetricTemplate {
            metric_key: key.to_string(),
            metric_name: key.to_string(),
            unit: None,
            raw_headers: vec![],
            contains: vec![],
            pattern: None,
            exclude_keywords: vec![],
            tags: Default::default(),
            category: MetricCategory::Price,
            range: None,
            geo: GeoStrategy::Nation,
            multi: false,
        }
    }

    fn headers(items: &[&str]) -> Vec<(u32, String)> {
        items.iter().enumerate().map(|(i, h)| (i as u32 + 1, h.to_string())).collect()
    }

    const NATION: &str = "商品猪：出栏均价：中国（日）";
    const HLJ: &str = "商品猪：出栏均价：黑龙江（日）";

    // -------------------------------------------------------------------------
    // PER-RULE PREDICATES
    // -------------------------------------------------------------------------

    #[test]
    fn test_exact_rule() {
        let mut t = template("n");
        t.raw_headers = vec![NATION.to_string()];
        assert!(rule_matches(MatchPass::Exact, &t, NATION));
        assert!(rule_matches(MatchPass::Exact, &t, " 商品猪：出栏均价：中国（日） "));
        assert!(!rule_matches(MatchPass::Exact, &t, HLJ));
        assert!(!rule_matches(MatchPass::Contains, &t, NATION));
    }

    #[test]
    fn test_contains_rule_with_exclude() {
        let mut t = template("p");
        t.contains = vec!["出栏均价".to_string()];
        t.exclude_keywords = vec!["中国".to_string()];
        assert!(rule_matches(MatchPass::Contains, &t, HLJ));
        assert!(!rule_matches(MatchPass::Contains, &t, NATION));
    }

    #[test]
    fn test_pattern_rule_with_exclude() {
        let mut t = template("p");
        t.pattern = Some(Regex::new(r"出栏均价：.+（日）").unwrap());
        t.exclude_keywords = vec!["中国".to_string()];
        assert!(rule_matches(MatchPass::Pattern, &t, HLJ));
        assert!(!rule_matches(MatchPass::Pattern, &t, NATION));
    }

    #[test]
    fn test_blank_header_never_matches() {
        let mut t = template("p");
        t.contains = vec!["".to_string()];
        t.pattern = Some(Regex::new(".*").unwrap());
        for pass in MatchPass::ORDER {
            assert!(!rule_matches(pass, &t, "  "));
        }
    }

    // -------------------------------------------------------------------------
    // ASSIGNMENT
    // -------------------------------------------------------------------------

    #[test]
    fn test_national_and_provincial_headers_resolve_distinctly() {
        let mut nation = template("nation");
        nation.raw_headers = vec![NATION.to_string()];
        let mut province = template("province");
        province.contains = vec!["出栏均价".to_string()];
        province.exclude_keywords = vec!["中国".to_string()];

        // Declaration order puts the provincial template first; exclusion and
        // exact precedence still keep the national column on its own metric.
        let templates = vec![province, nation];
        let assigned = assign_columns(&headers(&[NATION, HLJ]), &templates);
        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0].column, 1);
        assert_eq!(templates[assigned[0].template].metric_key, "nation");
        assert_eq!(assigned[0].pass, MatchPass::Exact);
        assert_eq!(assigned[1].column, 2);
        assert_eq!(templates[assigned[1].template].metric_key, "province");
        assert_eq!(assigned[1].pass, MatchPass::Contains);
    }

    #[test]
    fn test_column_never_double_assigned() {
        let mut a = template("a");
        a.contains = vec!["均价".to_string()];
        let mut b = template("b");
        b.contains = vec!["出栏均价".to_string()];
        let templates = vec![a, b];
        let assigned = assign_columns(&headers(&[NATION]), &templates);
        assert_eq!(assigned.len(), 1);
        assert_eq!(templates[assigned[0].template].metric_key, "a");
    }

    #[test]
    fn test_single_template_claims_first_column_only() {
        let mut a = template("a");
        a.contains = vec!["均价".to_string()];
        let assigned = assign_columns(&headers(&[NATION, HLJ]), &[a]);
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].column, 1);
    }

    #[test]
    fn test_multi_template_claims_every_match() {
        let mut a = template("a");
        a.contains = vec!["出栏均价".to_string()];
        a.exclude_keywords = vec!["中国".to_string()];
        a.multi = true;
        let assigned = assign_columns(
            &headers(&[NATION, HLJ, "商品猪：出栏均价：河南（日）", "日期"]),
            &[a],
        );
        let cols: Vec<u32> = assigned.iter().map(|a| a.column).collect();
        assert_eq!(cols, vec![2, 3]);
    }

    #[test]
    fn test_exact_pass_beats_earlier_declared_contains() {
        let mut loose = template("loose");
        loose.contains = vec!["出栏均价".to_string()];
        let mut strict = template("strict");
        strict.raw_headers = vec![HLJ.to_string()];
        let templates = vec![loose, strict];
        let assigned = assign_columns(&headers(&[HLJ]), &templates);
        assert_eq!(templates[assigned[0].template].metric_key, "strict");
    }

    #[test]
    fn test_region_from_header() {
        assert_eq!(region_from_header(HLJ).as_deref(), Some("黑龙江"));
        assert_eq!(region_from_header("出栏均价:河南(日)").as_deref(), Some("河南"));
        assert_eq!(region_from_header("出栏均价"), None);
    }
}
