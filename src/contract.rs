//! Accumulated delivery contract: the files, endpoints and tables a project is
//! expected to ship, merged across agent runs without duplicates.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_SOURCE: &str = "llm";
pub const MERGE_MARKER: &str = "+merge";

const CONTRACT_FIELDS: &[&str] = &["files", "endpoints", "tables", "source"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub method: String,
    pub path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Endpoint {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            extra: Map::new(),
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.method.to_ascii_uppercase(), self.path.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Table {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    /// Any other top-level keys, carried through merges.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Contract {
    /// Lenient parse. Fields that are missing or have the wrong shape come
    /// back empty instead of failing.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let files = array_items(obj.get("files"))
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect();

        let endpoints = array_items(obj.get("endpoints"))
            .filter_map(parse_endpoint)
            .collect();

        let tables = array_items(obj.get("tables"))
            .filter_map(parse_table)
            .collect();

        let source = obj
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let extra = obj
            .iter()
            .filter(|(k, _)| !CONTRACT_FIELDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            files,
            endpoints,
            tables,
            source,
            extra,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Same contract with duplicate identity keys removed and files sorted.
    pub fn normalized(&self) -> Self {
        Self {
            files: union_sorted(&self.files, &[]),
            endpoints: dedup_endpoints(self.endpoints.iter()),
            tables: dedup_tables(self.tables.iter()),
            source: self.source.clone(),
            extra: self.extra.clone(),
        }
    }

    pub fn endpoint_keys(&self) -> BTreeSet<(String, String)> {
        self.endpoints.iter().map(Endpoint::key).collect()
    }

    pub fn table_names(&self) -> BTreeSet<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

fn array_items(value: Option<&Value>) -> impl Iterator<Item = &Value> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter())
        .into_iter()
        .flatten()
}

fn parse_endpoint(value: &Value) -> Option<Endpoint> {
    match value {
        Value::Object(obj) => {
            let method = obj
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("GET")
                .trim()
                .to_ascii_uppercase();
            let path = obj
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            let extra = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "method" && k.as_str() != "path")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Some(Endpoint {
                method,
                path,
                extra,
            })
        }
        // "GET /api/health" shorthand
        Value::String(raw) => {
            let raw = raw.trim();
            let (method, path) = raw.split_once(char::is_whitespace)?;
            Some(Endpoint::new(method.trim(), path.trim()))
        }
        _ => None,
    }
}

fn parse_table(value: &Value) -> Option<Table> {
    let (name, extra) = match value {
        Value::Object(obj) => {
            let name = obj.get("name").and_then(Value::as_str)?.trim().to_string();
            let extra = obj
                .iter()
                .filter(|(k, _)| k.as_str() != "name")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (name, extra)
        }
        Value::String(name) => (name.trim().to_string(), Map::new()),
        _ => return None,
    };
    (!name.is_empty()).then_some(Table { name, extra })
}

fn union_sorted(base: &[String], add: &[String]) -> Vec<String> {
    base.iter()
        .chain(add.iter())
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

fn dedup_endpoints<'a>(endpoints: impl Iterator<Item = &'a Endpoint>) -> Vec<Endpoint> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for endpoint in endpoints {
        let key = endpoint.key();
        if seen.insert(key.clone()) {
            out.push(Endpoint {
                method: key.0,
                path: key.1,
                extra: endpoint.extra.clone(),
            });
        }
    }
    out
}

fn dedup_tables<'a>(tables: impl Iterator<Item = &'a Table>) -> Vec<Table> {
    let mut seen = HashSet::new();
    tables
        .filter(|table| !table.name.is_empty() && seen.insert(table.name.clone()))
        .cloned()
        .collect()
}

pub fn merge_contract(base: &Contract, add: &Contract) -> Contract {
    let source = if base.source.is_empty() {
        DEFAULT_SOURCE
    } else {
        base.source.as_str()
    };

    // base keys win; the addition only fills keys the base lacks
    let mut extra = base.extra.clone();
    for (key, value) in &add.extra {
        extra.entry(key.clone()).or_insert_with(|| value.clone());
    }

    Contract {
        files: union_sorted(&base.files, &add.files),
        endpoints: dedup_endpoints(base.endpoints.iter().chain(add.endpoints.iter())),
        tables: dedup_tables(base.tables.iter().chain(add.tables.iter())),
        source: format!("{source}{MERGE_MARKER}"),
        extra,
    }
}

/// True unless the contract names at least one file and one endpoint. Tables
/// are not considered.
pub fn is_contract_empty(contract: &Contract) -> bool {
    contract.files.is_empty() || contract.endpoints.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract(value: Value) -> Contract {
        Contract::from_value(&value)
    }

    fn membership(c: &Contract) -> (Vec<String>, BTreeSet<(String, String)>, BTreeSet<String>) {
        (c.files.clone(), c.endpoint_keys(), c.table_names())
    }

    #[test]
    fn merge_dedups_files_and_case_insensitive_endpoints() {
        let base = contract(json!({
            "files": ["a.py"],
            "endpoints": [{"method": "GET", "path": "/x"}]
        }));
        let add = contract(json!({
            "files": ["a.py", "b.py"],
            "endpoints": [{"method": "get", "path": "/x"}]
        }));

        let merged = merge_contract(&base, &add);
        assert_eq!(merged.files, vec!["a.py", "b.py"]);
        assert_eq!(merged.endpoints.len(), 1);
        assert_eq!(merged.endpoints[0].method, "GET");
        assert_eq!(merged.endpoints[0].path, "/x");
        assert!(merged.source.ends_with("+merge"));
        assert_eq!(merged.source, "llm+merge");
    }

    #[test]
    fn source_accumulates_marker_per_merge() {
        let base = contract(json!({"source": "scaffold"}));
        let once = merge_contract(&base, &Contract::default());
        let twice = merge_contract(&once, &Contract::default());
        assert_eq!(once.source, "scaffold+merge");
        assert_eq!(twice.source, "scaffold+merge+merge");
    }

    #[test]
    fn merge_is_idempotent_on_membership() {
        let a = contract(json!({
            "files": ["z.rs", "a.rs"],
            "endpoints": [{"method": "post", "path": "/items"}, "GET /health"],
            "tables": [{"name": "users"}, "posts"]
        }));
        let b = contract(json!({
            "files": ["a.rs", "m.rs"],
            "endpoints": [{"method": "POST", "path": "/items"}, {"method": "DELETE", "path": "/items/{id}"}],
            "tables": ["users", {"name": "comments"}]
        }));

        let ab = merge_contract(&a, &b);
        let abb = merge_contract(&ab, &b);
        assert_eq!(membership(&ab), membership(&abb));

        let ba = merge_contract(&b, &a);
        assert_eq!(membership(&ab), membership(&ba));
    }

    #[test]
    fn merging_empty_contract_keeps_membership() {
        let a = contract(json!({
            "files": ["b", "a"],
            "endpoints": [{"method": "GET", "path": "/"}],
            "tables": ["t"]
        }));
        let merged = merge_contract(&a, &Contract::default());
        assert_eq!(membership(&merged), membership(&a.normalized()));
    }

    #[test]
    fn first_endpoint_metadata_wins_and_order_is_kept() {
        let base = contract(json!({
            "endpoints": [
                {"method": "GET", "path": "/b", "auth": true},
                {"method": "GET", "path": "/a"}
            ]
        }));
        let add = contract(json!({
            "endpoints": [{"method": "get", "path": "/b", "auth": false}, {"method": "PUT", "path": "/c"}]
        }));
        let merged = merge_contract(&base, &add);
        let paths: Vec<&str> = merged.endpoints.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/b", "/a", "/c"]);
        assert_eq!(merged.endpoints[0].extra.get("auth"), Some(&json!(true)));
    }

    #[test]
    fn tables_dedup_by_name_in_insertion_order() {
        let base = contract(json!({"tables": ["users", {"name": "posts", "pk": "id"}]}));
        let add = contract(json!({"tables": [{"name": "posts"}, "tags", {"name": ""}]}));
        let merged = merge_contract(&base, &add);
        let names: Vec<&str> = merged.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["users", "posts", "tags"]);
        assert_eq!(merged.tables[1].extra.get("pk"), Some(&json!("id")));
    }

    #[test]
    fn emptiness_requires_files_and_endpoints() {
        assert!(is_contract_empty(&Contract::default()));
        assert!(is_contract_empty(&contract(json!({"files": ["a"], "tables": ["t"]}))));
        assert!(is_contract_empty(&contract(json!({"endpoints": ["GET /"]}))));
        assert!(!is_contract_empty(&contract(json!({"files": ["a"], "endpoints": ["GET /"]}))));
        assert!(!is_contract_empty(&contract(json!({"files": ["a"], "endpoints": ["GET /"], "tables": []}))));
    }

    #[test]
    fn malformed_fields_are_treated_as_empty() {
        let c = contract(json!({"files": "not-a-list", "endpoints": [42, null], "tables": {"x": 1}}));
        assert!(c.files.is_empty());
        assert!(c.endpoints.is_empty());
        assert!(c.tables.is_empty());
        assert_eq!(Contract::from_value(&json!("nope")), Contract::default());
    }

    #[test]
    fn value_round_trip_keeps_endpoint_metadata() {
        let c = contract(json!({"endpoints": [{"method": "GET", "path": "/x", "summary": "x"}]}));
        let back = Contract::from_value(&c.to_value());
        assert_eq!(back.endpoints[0].extra.get("summary"), Some(&json!("x")));
    }

    #[test]
    fn merge_keeps_other_top_level_keys() {
        let base = contract(json!({"files": ["a"], "stack": "fastapi", "owner": "base"}));
        let add = contract(json!({"files": ["b"], "owner": "add", "license": "MIT"}));
        let merged = merge_contract(&base, &add);
        assert_eq!(merged.extra.get("stack"), Some(&json!("fastapi")));
        assert_eq!(merged.extra.get("owner"), Some(&json!("base")));
        assert_eq!(merged.extra.get("license"), Some(&json!("MIT")));

        let value = merged.to_value();
        assert_eq!(value["stack"], json!("fastapi"));
        assert_eq!(value["files"], json!(["a", "b"]));
        assert!(Contract::from_value(&value).extra.get("files").is_none());
    }
}
