//! Field paths used by ignore rules and health overrides.
//!
//! Two spellings are accepted:
//! - dotted: `spec.template.spec.containers[0].image`, with `[*]` matching every element
//! - JSON pointer: `/metadata/annotations/app.kubernetes.io~1name` (`~1` is `/`, `~0` is `~`)

use std::fmt;

use serde_json::Value;
use smallvec::SmallVec;

use crate::SchemaError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
    /// `[*]`
    AnyIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: SmallVec<[Segment; 6]>,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self, SchemaError> {
        if raw.starts_with('/') { Self::parse_pointer(raw) } else { Self::parse_dotted(raw) }
    }

    pub fn segments(&self) -> &[Segment] { &self.segments }

    fn parse_pointer(raw: &str) -> Result<Self, SchemaError> {
        let mut segments = SmallVec::new();
        for token in raw.split('/').skip(1) {
            if token.is_empty() { return Err(SchemaError::InvalidPath(raw.to_string())); }
            // Numeric tokens stay keys; they index arrays when resolved against one.
            segments.push(Segment::Key(token.replace("~1", "/").replace("~0", "~")));
        }
        if segments.is_empty() { return Err(SchemaError::InvalidPath(raw.to_string())); }
        Ok(Self { segments })
    }

    fn parse_dotted(raw: &str) -> Result<Self, SchemaError> {
        let invalid = || SchemaError::InvalidPath(raw.to_string());
        if raw.contains('?') { return Err(invalid()); }
        let s = raw.strip_prefix('.').unwrap_or(raw);
        if s.is_empty() { return Err(invalid()); }
        let mut segments = SmallVec::new();
        for seg in s.split('.') {
            if seg.is_empty() { return Err(invalid()); }
            let (key, mut rest) = match seg.find('[') {
                Some(i) => (&seg[..i], &seg[i..]),
                None => (seg, ""),
            };
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(invalid());
            }
            segments.push(Segment::Key(key.to_string()));
            while !rest.is_empty() {
                let inner_end = rest.find(']').ok_or_else(invalid)?;
                let inner = &rest[1..inner_end];
                if inner == "*" {
                    segments.push(Segment::AnyIndex);
                } else if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                    segments.push(Segment::Index(inner.parse().map_err(|_| invalid())?));
                } else {
                    return Err(invalid());
                }
                rest = &rest[inner_end + 1..];
                if !rest.is_empty() && !rest.starts_with('[') { return Err(invalid()); }
            }
        }
        Ok(Self { segments })
    }

    /// Resolve to a single value; wildcards never resolve here.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut cur = root;
        for seg in self.segments.iter() {
            cur = match (seg, cur) {
                (Segment::Key(k), Value::Object(map)) => map.get(k)?,
                (Segment::Key(k), Value::Array(arr)) => arr.get(k.parse::<usize>().ok()?)?,
                (Segment::Index(i), Value::Array(arr)) => arr.get(*i)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Delete every value the path addresses. Returns how many were removed.
    pub fn remove_from(&self, root: &mut Value) -> usize { remove_at(root, &self.segments) }
}

fn remove_at(cur: &mut Value, segs: &[Segment]) -> usize {
    let Some((first, rest)) = segs.split_first() else { return 0 };
    if rest.is_empty() {
        return match (first, cur) {
            (Segment::Key(k), Value::Object(map)) => map.remove(k).is_some() as usize,
            (Segment::Key(k), Value::Array(arr)) => match k.parse::<usize>() {
                Ok(i) if i < arr.len() => { arr.remove(i); 1 }
                _ => 0,
            },
            (Segment::Index(i), Value::Array(arr)) if *i < arr.len() => { arr.remove(*i); 1 }
            (Segment::AnyIndex, Value::Array(arr)) => { let n = arr.len(); arr.clear(); n }
            _ => 0,
        };
    }
    match (first, cur) {
        (Segment::Key(k), Value::Object(map)) => map.get_mut(k).map(|c| remove_at(c, rest)).unwrap_or(0),
        (Segment::Key(k), Value::Array(arr)) => k
            .parse::<usize>()
            .ok()
            .and_then(|i| arr.get_mut(i))
            .map(|c| remove_at(c, rest))
            .unwrap_or(0),
        (Segment::Index(i), Value::Array(arr)) => arr.get_mut(*i).map(|c| remove_at(c, rest)).unwrap_or(0),
        (Segment::AnyIndex, Value::Array(arr)) => arr.iter_mut().map(|c| remove_at(c, rest)).sum(),
        _ => 0,
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for seg in self.segments.iter() {
            match seg {
                Segment::Key(k) => {
                    if !first { f.write_str(".")?; }
                    f.write_str(k)?;
                }
                Segment::Index(i) => write!(f, "[{}]", i)?,
                Segment::AnyIndex => f.write_str("[*]")?,
            }
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_paths() {
        assert_eq!(FieldPath::parse(".spec.foo").unwrap().to_string(), "spec.foo");
        assert_eq!(FieldPath::parse("spec.dnsNames[0]").unwrap().to_string(), "spec.dnsNames[0]");
        assert_eq!(FieldPath::parse("spec.containers[*].image").unwrap().to_string(), "spec.containers[*].image");
        assert!(FieldPath::parse("").is_err());
        assert!(FieldPath::parse("spec..foo").is_err());
        assert!(FieldPath::parse("spec.foo[x]").is_err());
        assert!(FieldPath::parse("spec.foo[?(@.a)]").is_err());
        assert!(FieldPath::parse("spec.foo[0]bar").is_err());
    }

    #[test]
    fn parses_json_pointers_with_escapes() {
        let p = FieldPath::parse("/metadata/annotations/app.kubernetes.io~1name").unwrap();
        let v = serde_json::json!({"metadata": {"annotations": {"app.kubernetes.io/name": "web"}}});
        assert_eq!(p.get(&v), Some(&serde_json::json!("web")));
        assert!(FieldPath::parse("/").is_err());
    }

    #[test]
    fn get_extracts_scalars() {
        let json = serde_json::json!({"spec": {"dnsNames": ["a.example.com", "b.example.com"], "replicas": 3}});
        assert_eq!(FieldPath::parse("spec.dnsNames[1]").unwrap().get(&json), Some(&serde_json::json!("b.example.com")));
        assert_eq!(FieldPath::parse("/spec/dnsNames/0").unwrap().get(&json), Some(&serde_json::json!("a.example.com")));
        assert_eq!(FieldPath::parse("spec.replicas").unwrap().get(&json), Some(&serde_json::json!(3)));
        assert_eq!(FieldPath::parse("spec.dnsNames[*]").unwrap().get(&json), None);
    }

    #[test]
    fn remove_handles_wildcards() {
        let mut v = serde_json::json!({"spec": {"containers": [
            {"name": "a", "image": "x:1"},
            {"name": "b", "image": "y:1"}
        ]}});
        let removed = FieldPath::parse("spec.containers[*].image").unwrap().remove_from(&mut v);
        assert_eq!(removed, 2);
        assert_eq!(v, serde_json::json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}]}}));
        assert_eq!(FieldPath::parse("spec.missing.field").unwrap().remove_from(&mut v), 0);
    }
}
