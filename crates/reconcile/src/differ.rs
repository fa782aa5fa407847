//! Comparison of two saved sets of reconciliation results.
//!
//! Records are rendered as YAML with sorted keys and compared line by line;
//! differences print in the classic `diff` normal format.

use std::collections::BTreeSet;
use std::path::Path;

use ferry_core::{AppCondition, AppReconcileResult, HealthStatus, SyncStatus};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// The persisted, timestamp-free view of one application's verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileRecord {
    pub name: String,
    #[serde(default, serialize_with = "health_out", deserialize_with = "health_in")]
    pub health: Option<HealthStatus>,
    #[serde(default)]
    pub sync: Option<SyncStatus>,
    #[serde(default)]
    pub conditions: Option<Vec<AppCondition>>,
}

fn health_out<S: Serializer>(h: &Option<HealthStatus>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(h.map(HealthStatus::as_str).unwrap_or(""))
}

fn health_in<'de, D: Deserializer<'de>>(d: D) -> Result<Option<HealthStatus>, D::Error> {
    let s = Option::<String>::deserialize(d)?.unwrap_or_default();
    if s.is_empty() { return Ok(None) }
    s.parse().map(Some).map_err(D::Error::custom)
}

impl From<&AppReconcileResult> for ReconcileRecord {
    fn from(r: &AppReconcileResult) -> Self {
        Self {
            name: r.name.clone(),
            health: Some(r.health),
            sync: Some(r.sync.clone()),
            conditions: (!r.conditions.is_empty()).then(|| r.conditions.clone()),
        }
    }
}

/// File layout of a saved result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileResults {
    #[serde(default)]
    pub applications: Vec<ReconcileRecord>,
}

impl ReconcileResults {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
        serde_yaml::from_str(&text).map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let text = serde_yaml::to_string(self)?;
        std::fs::write(path, text).map_err(|e| anyhow::anyhow!("writing {}: {}", path.display(), e))
    }
}

/// Line-oriented report of how `after` differs from `before`.
///
/// Every application name is printed, those of `before` first and then the
/// ones only `after` has. A name whose records differ is followed by the
/// normal-format diff of their renderings; a record present on one side only
/// is diffed against nothing.
pub fn diff_results(before: &[ReconcileRecord], after: &[ReconcileRecord]) -> String {
    let mut seen = BTreeSet::new();
    let names: Vec<&str> = before
        .iter()
        .chain(after.iter())
        .map(|r| r.name.as_str())
        .filter(|n| seen.insert(*n))
        .collect();
    let render = |set: &[ReconcileRecord], name: &str| set.iter().find(|r| r.name == name).map(render_record).unwrap_or_default();

    let mut out = String::new();
    for name in names {
        out.push_str(name);
        out.push('\n');
        let a = render(before, name);
        let b = render(after, name);
        if a != b {
            out.push_str(&normal_diff(&a, &b));
        }
    }
    out
}

/// Block YAML with sorted keys.
pub fn render_record(rec: &ReconcileRecord) -> String {
    let value = serde_json::to_value(rec).unwrap_or(Value::Null);
    let mut out = String::new();
    match &value {
        Value::Object(m) => write_map(m, 0, &mut out),
        other => {
            out.push_str(&inline(other));
            out.push('\n');
        }
    }
    out
}

fn pad(out: &mut String, n: usize) {
    out.extend(std::iter::repeat(' ').take(n));
}

fn write_map(map: &Map<String, Value>, indent: usize, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for k in keys {
        pad(out, indent);
        out.push_str(&scalar(k));
        out.push(':');
        match &map[k.as_str()] {
            Value::Object(m) if !m.is_empty() => {
                out.push('\n');
                write_map(m, indent + 2, out);
            }
            Value::Array(a) if !a.is_empty() => {
                out.push('\n');
                write_seq(a, indent, out);
            }
            v => {
                out.push(' ');
                out.push_str(&inline(v));
                out.push('\n');
            }
        }
    }
}

fn write_seq(items: &[Value], indent: usize, out: &mut String) {
    for item in items {
        pad(out, indent);
        out.push_str("- ");
        match item {
            Value::Object(m) if !m.is_empty() => {
                let mut block = String::new();
                write_map(m, indent + 2, &mut block);
                out.push_str(&block[indent + 2..]);
            }
            Value::Array(a) if !a.is_empty() => {
                out.push('\n');
                write_seq(a, indent + 2, out);
            }
            v => {
                out.push_str(&inline(v));
                out.push('\n');
            }
        }
    }
}

fn inline(v: &Value) -> String {
    match v {
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => scalar(s),
        Value::Array(_) => "[]".into(),
        Value::Object(_) => "{}".into(),
    }
}

const RESERVED: &[&str] = &["true", "false", "yes", "no", "on", "off", "y", "n", "null", "~"];

/// Plain when it would read back as the same string, double-quoted otherwise.
fn scalar(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || RESERVED.contains(&s.to_ascii_lowercase().as_str())
        || s.parse::<f64>().is_ok()
        || s.starts_with(|c: char| "-?:,[]{}#&*!|>'\"%@`".contains(c) || c.is_whitespace())
        || s.ends_with(|c: char| c == ':' || c.is_whitespace())
        || s.contains(": ")
        || s.contains(" #")
        || s.chars().any(char::is_control);
    if needs_quotes { serde_json::to_string(s).unwrap_or_default() } else { s.to_string() }
}

enum Op {
    Keep,
    Del,
    Ins,
}

/// `a` versus `b` in the normal output format of `diff`.
pub fn normal_diff(a: &str, b: &str) -> String {
    let a: Vec<&str> = a.lines().collect();
    let b: Vec<&str> = b.lines().collect();
    let (n, m) = (a.len(), b.len());

    // lcs[i][j]: longest common subsequence of a[i..] and b[j..]
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] { lcs[i + 1][j + 1] + 1 } else { lcs[i + 1][j].max(lcs[i][j + 1]) };
        }
    }
    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && a[i] == b[j] {
            ops.push(Op::Keep);
            i += 1;
            j += 1;
        } else if j == m || (i < n && lcs[i + 1][j] >= lcs[i][j + 1]) {
            ops.push(Op::Del);
            i += 1;
        } else {
            ops.push(Op::Ins);
            j += 1;
        }
    }

    let mut out = String::new();
    let (mut i, mut j, mut k) = (0, 0, 0);
    while k < ops.len() {
        if let Op::Keep = ops[k] {
            i += 1;
            j += 1;
            k += 1;
            continue;
        }
        let (i0, j0) = (i, j);
        while k < ops.len() {
            match ops[k] {
                Op::Keep => break,
                Op::Del => i += 1,
                Op::Ins => j += 1,
            }
            k += 1;
        }
        hunk(&mut out, &a[i0..i], &b[j0..j], i0, j0);
    }
    out
}

fn range(start: usize, end: usize) -> String {
    if start == end { start.to_string() } else { format!("{},{}", start, end) }
}

fn hunk(out: &mut String, del: &[&str], ins: &[&str], i0: usize, j0: usize) {
    let header = match (del.is_empty(), ins.is_empty()) {
        (false, true) => format!("{}d{}", range(i0 + 1, i0 + del.len()), j0),
        (true, false) => format!("{}a{}", i0, range(j0 + 1, j0 + ins.len())),
        _ => format!("{}c{}", range(i0 + 1, i0 + del.len()), range(j0 + 1, j0 + ins.len())),
    };
    out.push_str(&header);
    out.push('\n');
    for l in del {
        out.push_str("< ");
        out.push_str(l);
        out.push('\n');
    }
    if !del.is_empty() && !ins.is_empty() {
        out.push_str("---\n");
    }
    for l in ins {
        out.push_str("> ");
        out.push_str(l);
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{ComparedTo, SyncStatusCode};

    fn out_of_sync(name: &str) -> ReconcileRecord {
        ReconcileRecord {
            name: name.into(),
            health: None,
            sync: Some(SyncStatus { status: SyncStatusCode::OutOfSync, compared_to: ComparedTo::default(), revision: None }),
            conditions: None,
        }
    }

    #[test]
    fn empty_record_renders_like_saved_files() {
        let want = "\
conditions: null
health: \"\"
name: app2
sync:
  comparedTo:
    destination: {}
    source:
      repoURL: \"\"
  status: OutOfSync
";
        assert_eq!(render_record(&out_of_sync("app2")), want);
    }

    #[test]
    fn sequences_sit_under_their_key() {
        let rec = ReconcileRecord {
            name: "web".into(),
            health: Some(HealthStatus::Degraded),
            sync: None,
            conditions: Some(vec![AppCondition::new(ferry_core::ConditionType::ComparisonError, "bad: path")]),
        };
        let want = "\
conditions:
- message: \"bad: path\"
  type: ComparisonError
health: Degraded
name: web
sync: null
";
        assert_eq!(render_record(&rec), want);
    }

    #[test]
    fn ambiguous_scalars_are_quoted() {
        assert_eq!(scalar("plain"), "plain");
        assert_eq!(scalar("true"), "\"true\"");
        assert_eq!(scalar("1.5"), "\"1.5\"");
        assert_eq!(scalar("- x"), "\"- x\"");
        assert_eq!(scalar("a\nb"), "\"a\\nb\"");
        assert_eq!(scalar("https://host:443/x"), "https://host:443/x");
    }

    #[test]
    fn normal_format_hunks() {
        assert_eq!(normal_diff("a\nb\nc\n", "a\nb\nc\n"), "");
        assert_eq!(normal_diff("a\nb\nc\n", "a\nc\n"), "2d1\n< b\n");
        assert_eq!(normal_diff("a\nc\n", "a\nb\nc\n"), "1a2\n> b\n");
        assert_eq!(normal_diff("a\nb\nc\n", "a\nx\nc\n"), "2c2\n< b\n---\n> x\n");
        assert_eq!(normal_diff("", "x\ny\n"), "0a1,2\n> x\n> y\n");
    }

    #[test]
    fn identical_sets_print_names_only() {
        let before = vec![out_of_sync("app1")];
        assert_eq!(diff_results(&before, &before.clone()), "app1\n");
    }

    #[test]
    fn removed_and_added_apps_diff_against_nothing() {
        let before = vec![out_of_sync("app1"), out_of_sync("app2")];
        let after = vec![out_of_sync("app1"), out_of_sync("app3")];
        let want = "\
app1
app2
1,9d0
< conditions: null
< health: \"\"
< name: app2
< sync:
<   comparedTo:
<     destination: {}
<     source:
<       repoURL: \"\"
<   status: OutOfSync
app3
0a1,9
> conditions: null
> health: \"\"
> name: app3
> sync:
>   comparedTo:
>     destination: {}
>     source:
>       repoURL: \"\"
>   status: OutOfSync
";
        assert_eq!(diff_results(&before, &after), want);
    }

    #[test]
    fn changed_status_is_a_change_hunk() {
        let before = vec![out_of_sync("app1")];
        let mut rec = out_of_sync("app1");
        rec.health = Some(HealthStatus::Healthy);
        let out = diff_results(&before, &[rec]);
        assert_eq!(out, "app1\n2c2\n< health: \"\"\n---\n> health: Healthy\n");
    }

    #[test]
    fn results_file_round_trips_through_yaml() {
        let text = "applications:\n- name: app1\n  health: \"\"\n  sync:\n    status: Synced\n    comparedTo:\n      source:\n        repoURL: https://git.example/repo\n      destination: {}\n";
        let set: ReconcileResults = serde_yaml::from_str(text).unwrap();
        let rec = &set.applications[0];
        assert_eq!(rec.health, None);
        assert_eq!(rec.sync.as_ref().unwrap().status, SyncStatusCode::Synced);
        assert_eq!(rec.sync.as_ref().unwrap().compared_to.source.repo_url, "https://git.example/repo");
    }
}
