//! # matcher: naming-convention rules
//!
//! Maps a file or folder name to a job id and the directory the item belongs
//! in. Rules are data ([`MatchRule`]); they are compiled once into a
//! [`RuleSet`] so every pattern and template error surfaces at load time, and
//! matching itself cannot fail.
//!
//! Rules are tried in declared order and the first rule that matches wins, so
//! specific rules go before general ones.
//!
//! ## Templates
//! `destination` and `job_id` are templates. `{name}` is the whole item name,
//! `{stem}` the name without its last extension, `{job}` the computed job id
//! (destination only), and any named capture group of the pattern is
//! available by name. A placeholder may carry a case filter: `{prefix:upper}`,
//! `{prefix:lower}`. `{{` and `}}` produce literal braces.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// A naming-convention pattern plus the destination it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    /// Label used in logs; defaults to the pattern.
    #[serde(default)]
    pub name: String,
    /// Regular expression matched against the item name.
    pub pattern: String,
    /// Directory template the item is moved into.
    pub destination: String,
    /// Optional template for the job id. Defaults to the `job` capture group,
    /// else the first capture group, else the whole match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl MatchRule {
    pub fn new(pattern: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            pattern: pattern.into(),
            destination: destination.into(),
            job_id: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_job_id(mut self, template: impl Into<String>) -> Self {
        self.job_id = Some(template.into());
        self
    }

    fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.pattern
        } else {
            &self.name
        }
    }
}

/// Result of a successful match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub job_id: String,
    /// Directory the item is placed into. May be relative, in which case it
    /// is resolved against the directory containing the item.
    pub destination_path: PathBuf,
    /// Label of the winning rule.
    pub rule: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Case {
    Keep,
    Upper,
    Lower,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var { name: String, case: Case },
}

#[derive(Debug, Clone)]
struct Template {
    segments: Vec<Segment>,
}

const BUILTIN_VARS: [&str; 3] = ["name", "stem", "job"];

impl Template {
    fn parse(source: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut inner = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        inner.push(c);
                    }
                    if !closed {
                        return Err("unclosed '{'".to_string());
                    }
                    let (name, case) = match inner.split_once(':') {
                        None => (inner.trim(), Case::Keep),
                        Some((name, "upper")) => (name.trim(), Case::Upper),
                        Some((name, "lower")) => (name.trim(), Case::Lower),
                        Some((_, filter)) => return Err(format!("unknown filter '{filter}'")),
                    };
                    if name.is_empty() {
                        return Err("empty placeholder".to_string());
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Var {
                        name: name.to_string(),
                        case,
                    });
                }
                '}' => return Err("unmatched '}'".to_string()),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if segments.is_empty() {
            return Err("template is empty".to_string());
        }
        Ok(Self { segments })
    }

    fn check_vars(&self, known: &HashSet<&str>) -> Result<(), String> {
        for segment in &self.segments {
            if let Segment::Var { name, .. } = segment {
                if !known.contains(name.as_str()) {
                    return Err(format!("unknown placeholder '{name}'"));
                }
            }
        }
        Ok(())
    }

    fn render(&self, vars: &Vars<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Var { name, case } => {
                    let value = vars.lookup(name);
                    match case {
                        Case::Keep => out.push_str(value),
                        Case::Upper => out.push_str(&value.to_uppercase()),
                        Case::Lower => out.push_str(&value.to_lowercase()),
                    }
                }
            }
        }
        out
    }
}

struct Vars<'a> {
    name: &'a str,
    stem: &'a str,
    job: &'a str,
    captures: &'a Captures<'a>,
}

impl Vars<'_> {
    fn lookup(&self, var: &str) -> &str {
        match var {
            "name" => self.name,
            "stem" => self.stem,
            "job" => self.job,
            group => self.captures.name(group).map_or("", |m| m.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: MatchRule,
    regex: Regex,
    destination: Template,
    job_id: Option<Template>,
}

impl CompiledRule {
    fn compile(rule: &MatchRule) -> Result<Self, RuleError> {
        let regex = Regex::new(&rule.pattern).map_err(|source| RuleError::InvalidPattern {
            rule: rule.label().to_string(),
            source,
        })?;

        let mut known: HashSet<&str> = regex.capture_names().flatten().collect();
        known.extend(["name", "stem"]);

        let invalid = |template: &str, reason: String| RuleError::InvalidTemplate {
            rule: rule.label().to_string(),
            template: template.to_string(),
            reason,
        };

        let job_id = match &rule.job_id {
            Some(source) => {
                let template = Template::parse(source).map_err(|r| invalid(source, r))?;
                template.check_vars(&known).map_err(|r| invalid(source, r))?;
                Some(template)
            }
            None => None,
        };

        known.extend(BUILTIN_VARS);
        let destination =
            Template::parse(&rule.destination).map_err(|r| invalid(&rule.destination, r))?;
        destination
            .check_vars(&known)
            .map_err(|r| invalid(&rule.destination, r))?;

        Ok(Self {
            rule: rule.clone(),
            regex,
            destination,
            job_id,
        })
    }

    fn apply(&self, name: &str) -> Option<Match> {
        let captures = self.regex.captures(name)?;
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);

        let job_id = match &self.job_id {
            Some(template) => template.render(&Vars {
                name,
                stem,
                job: "",
                captures: &captures,
            }),
            None => captures
                .name("job")
                .or_else(|| captures.get(1))
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        };
        if job_id.is_empty() {
            return None;
        }

        let destination = self.destination.render(&Vars {
            name,
            stem,
            job: &job_id,
            captures: &captures,
        });
        Some(Match {
            destination_path: PathBuf::from(destination),
            rule: self.rule.label().to_string(),
            job_id,
        })
    }
}

/// An ordered, compiled set of [`MatchRule`]s.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile rules in declared order. Any invalid rule rejects the whole set.
    pub fn compile(rules: &[MatchRule]) -> Result<Self, RuleError> {
        let rules = rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &MatchRule> {
        self.rules.iter().map(|r| &r.rule)
    }

    /// First rule whose pattern matches and yields a non-empty job id wins.
    pub fn match_name(&self, name: &str) -> Option<Match> {
        self.rules.iter().find_map(|rule| rule.apply(name))
    }
}

/// Match `name` against `rules`. `None` means "skip", never "error".
pub fn match_name(name: &str, rules: &RuleSet) -> Option<Match> {
    rules.match_name(name)
}

/// Reloadable handle to a pipeline's current [`RuleSet`].
///
/// Scan loops take a [`RuleBook::snapshot`] at the start of each cycle, so a
/// [`RuleBook::replace`] takes effect on the next cycle without a restart.
#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    current: Arc<RwLock<Arc<RuleSet>>>,
}

impl RuleBook {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(rules))),
        }
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace(&self, rules: RuleSet) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(rules: &[MatchRule]) -> RuleSet {
        RuleSet::compile(rules).expect("rules compile")
    }

    #[test]
    fn job_prefix_rule_routes_to_working_folder() {
        let rules = set(&[MatchRule::new(r"^JOB-(?P<job>\d+)", "/work/JOB-{job}")]);
        let m = match_name("JOB-1042_invoice.pdf", &rules).expect("should match");
        assert_eq!(m.job_id, "1042");
        assert_eq!(m.destination_path, PathBuf::from("/work/JOB-1042"));
    }

    #[test]
    fn no_matching_rule_is_none() {
        let rules = set(&[MatchRule::new(r"^JOB-(?P<job>\d+)", "/work/JOB-{job}")]);
        assert_eq!(match_name("holiday_photo.jpg", &rules), None);
        assert_eq!(match_name("anything", &RuleSet::default()), None);
    }

    #[test]
    fn earlier_rule_wins_when_several_match() {
        let rules = set(&[
            MatchRule::new(r"^JOB-(?P<job>1042)", "/special").named("specific"),
            MatchRule::new(r"^JOB-(?P<job>\d+)", "/general").named("general"),
        ]);
        let m = match_name("JOB-1042.pdf", &rules).unwrap();
        assert_eq!(m.rule, "specific");
        assert_eq!(m.destination_path, PathBuf::from("/special"));

        let m = match_name("JOB-7.pdf", &rules).unwrap();
        assert_eq!(m.rule, "general");

        let reversed = set(&[
            MatchRule::new(r"^JOB-(?P<job>\d+)", "/general").named("general"),
            MatchRule::new(r"^JOB-(?P<job>1042)", "/special").named("specific"),
        ]);
        assert_eq!(match_name("JOB-1042.pdf", &reversed).unwrap().rule, "general");
    }

    #[test]
    fn matching_is_deterministic() {
        let rules = set(&[
            MatchRule::new(r"(?i)IR[_\s-]?(?P<num>\d{5})", "/work/IR{num}").with_job_id("IR{num}"),
        ]);
        let first = match_name("Out_of_Charge_ir_12345.pdf", &rules);
        for _ in 0..10 {
            assert_eq!(match_name("Out_of_Charge_ir_12345.pdf", &rules), first);
        }
        assert_eq!(first.unwrap().job_id, "IR12345");
    }

    #[test]
    fn job_id_template_normalises_case_and_separators() {
        let rules = set(&[MatchRule::new(
            r"(?i)(?P<prefix>IR|ER)[\s_-]?(?P<num>\d{4,5})",
            "{job}",
        )
        .with_job_id("{prefix:upper}{num}")]);
        let m = match_name("er-4711 invoice.xlsx", &rules).unwrap();
        assert_eq!(m.job_id, "ER4711");
        assert_eq!(m.destination_path, PathBuf::from("ER4711"));
    }

    #[test]
    fn first_capture_group_is_job_id_without_job_group() {
        let rules = set(&[MatchRule::new(r"^(\d+)_", "/jobs/{name}")]);
        let m = match_name("778_report.pdf", &rules).unwrap();
        assert_eq!(m.job_id, "778");
        assert_eq!(m.destination_path, PathBuf::from("/jobs/778_report.pdf"));
    }

    #[test]
    fn stem_and_literal_braces_render() {
        let rules = set(&[MatchRule::new(r"^(?P<job>A\d)", "/x/{{{stem:lower}}}")]);
        let m = match_name("A1_Scan.PDF", &rules).unwrap();
        assert_eq!(m.destination_path, PathBuf::from("/x/{a1_scan}"));
    }

    #[test]
    fn invalid_rules_are_rejected_at_compile_time() {
        assert!(matches!(
            RuleSet::compile(&[MatchRule::new(r"(unclosed", "/x")]),
            Err(RuleError::InvalidPattern { .. })
        ));
        assert!(matches!(
            RuleSet::compile(&[MatchRule::new(r"^(?P<job>\d+)", "/x/{missing}")]),
            Err(RuleError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            RuleSet::compile(&[MatchRule::new(r"^(?P<job>\d+)", "/x/{job:title}")]),
            Err(RuleError::InvalidTemplate { .. })
        ));
        assert!(matches!(
            RuleSet::compile(&[MatchRule::new(r"^(?P<job>\d+)", "/x/{job")]),
            Err(RuleError::InvalidTemplate { .. })
        ));
        // `{job}` cannot be used to compute itself.
        assert!(matches!(
            RuleSet::compile(&[MatchRule::new(r"^(\d+)", "/x").with_job_id("{job}")]),
            Err(RuleError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn empty_job_id_falls_through_to_next_rule() {
        let rules = set(&[
            MatchRule::new(r"^(?P<job>\d*)x", "/first"),
            MatchRule::new(r"^x(?P<job>\w+)", "/second"),
        ]);
        let m = match_name("xyz", &rules).unwrap();
        assert_eq!(m.destination_path, PathBuf::from("/second"));
        assert_eq!(m.job_id, "yz");
    }

    #[test]
    fn rule_book_replace_is_visible_to_new_snapshots_only() {
        let book = RuleBook::new(set(&[MatchRule::new(r"^(?P<job>A)", "/a")]));
        let before = book.snapshot();
        book.replace(set(&[MatchRule::new(r"^(?P<job>B)", "/b")]));
        assert!(before.match_name("A").is_some());
        assert!(book.snapshot().match_name("A").is_none());
        assert!(book.snapshot().match_name("B").is_some());
    }
}
