//! Namespace model and the startup-fixed namespace rewrite rules.

use crate::error::{Result, SyncError};
use bson::{Bson, Document};
use std::fmt;

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ns {
    pub database: String,
    pub collection: String,
}

impl Ns {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Ns {
        Ns {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse `"db.coll"`. The collection part may itself contain dots.
    pub fn parse(s: &str) -> Option<Ns> {
        let (db, coll) = s.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Ns::new(db, coll))
    }

    pub fn str(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Ns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Namespace rewrite rules, fixed at startup.
///
/// Each rule is `src:dst` where both sides are either a database name or a
/// full `db.coll` namespace. The first matching rule wins; without a match
/// the namespace passes through unchanged.
#[derive(Debug, Default, Clone)]
pub struct NamespaceTransform {
    rules: Vec<(String, String)>,
}

impl NamespaceTransform {
    pub fn new(specs: &[String]) -> Result<NamespaceTransform> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let (src, dst) = spec.split_once(':').ok_or_else(|| SyncError::ConfigError {
                reason: format!("transform rule {:?} is not of the form src:dst", spec),
            })?;
            if src.is_empty() || dst.is_empty() {
                return Err(SyncError::ConfigError {
                    reason: format!("transform rule {:?} has an empty side", spec),
                });
            }
            rules.push((src.to_string(), dst.to_string()));
        }
        Ok(NamespaceTransform { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite a `db.coll` (or bare `db`) namespace string.
    pub fn transform(&self, ns: &str) -> String {
        for (src, dst) in &self.rules {
            if ns == src {
                return dst.clone();
            }
            if let Some(rest) = ns.strip_prefix(src.as_str()) {
                if rest.starts_with('.') {
                    return format!("{}{}", dst, rest);
                }
            }
        }
        ns.to_string()
    }

    pub fn transform_ns(&self, ns: &Ns) -> Ns {
        let out = self.transform(&ns.str());
        Ns::parse(&out).unwrap_or_else(|| ns.clone())
    }
}

/// Database-level view of the rewrite rules; one source database may fan out
/// to several destination databases (used by the sharding spec sync).
#[derive(Debug, Default, Clone)]
pub struct DbTransform {
    rules: Vec<(String, String)>,
}

impl DbTransform {
    pub fn new(specs: &[String]) -> Result<DbTransform> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            let (src, dst) = spec.split_once(':').ok_or_else(|| SyncError::ConfigError {
                reason: format!("transform rule {:?} is not of the form src:dst", spec),
            })?;
            let src_db = src.split_once('.').map(|(d, _)| d).unwrap_or(src);
            let dst_db = dst.split_once('.').map(|(d, _)| d).unwrap_or(dst);
            rules.push((src_db.to_string(), dst_db.to_string()));
        }
        Ok(DbTransform { rules })
    }

    pub fn transform(&self, db: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for (src, dst) in &self.rules {
            if src == db && !out.contains(dst) {
                out.push(dst.clone());
            }
        }
        if out.is_empty() {
            out.push(db.to_string());
        }
        out
    }
}

/// Rewrite embedded DBRef documents (`{"$ref": coll, "$id": .., "$db"?: ..}`)
/// under the namespace transform. `db` is the database the enclosing
/// document lives in, used when the reference has no `$db`.
pub fn transform_dbref(doc: Document, db: &str, trans: &NamespaceTransform) -> Document {
    let mut out = Document::new();
    let is_ref = doc.get_str("$ref").is_ok();
    if is_ref {
        let ref_coll = doc.get_str("$ref").unwrap_or_default().to_string();
        let ref_db = doc.get_str("$db").unwrap_or(db).to_string();
        let had_db = doc.get_str("$db").is_ok();
        let transformed = trans.transform(&format!("{}.{}", ref_db, ref_coll));
        let (to_db, to_coll) = transformed
            .split_once('.')
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .unwrap_or((ref_db.clone(), ref_coll.clone()));
        for (k, v) in doc {
            match k.as_str() {
                "$ref" => {
                    out.insert("$ref", to_coll.clone());
                }
                "$db" => {
                    out.insert("$db", to_db.clone());
                }
                _ => {
                    out.insert(k, transform_dbref_value(v, db, trans));
                }
            }
        }
        if !had_db && to_db != ref_db {
            out.insert("$db", to_db);
        }
        return out;
    }
    for (k, v) in doc {
        out.insert(k, transform_dbref_value(v, db, trans));
    }
    out
}

fn transform_dbref_value(v: Bson, db: &str, trans: &NamespaceTransform) -> Bson {
    match v {
        Bson::Document(d) => Bson::Document(transform_dbref(d, db, trans)),
        Bson::Array(items) => Bson::Array(
            items
                .into_iter()
                .map(|item| transform_dbref_value(item, db, trans))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::doc;

    #[test]
    fn test_ns_parse() {
        let ns = Ns::parse("bb.items").unwrap();
        assert_eq!(ns, Ns::new("bb", "items"));
        assert_eq!(ns.str(), "bb.items");
        // collection names may contain dots themselves.
        assert_eq!(
            Ns::parse("bb.system.profile").unwrap(),
            Ns::new("bb", "system.profile")
        );
        assert!(Ns::parse("nodot").is_none());
    }

    #[test]
    fn test_transform_exact_and_prefix() {
        let trans =
            NamespaceTransform::new(&["srcdb.a:dstdb.b".to_string(), "olddb:newdb".to_string()])
                .unwrap();
        assert_eq!(trans.transform("srcdb.a"), "dstdb.b");
        assert_eq!(trans.transform("olddb.users"), "newdb.users");
        assert_eq!(trans.transform("olddb"), "newdb");
        assert_eq!(trans.transform("other.coll"), "other.coll");
        // prefix match must stop at a dot boundary.
        assert_eq!(trans.transform("olddb2.users"), "olddb2.users");
    }

    #[test]
    fn test_transform_rejects_bad_rule() {
        assert!(NamespaceTransform::new(&["nocolon".to_string()]).is_err());
        assert!(NamespaceTransform::new(&[":dst".to_string()]).is_err());
    }

    #[test]
    fn test_db_transform_fanout() {
        let trans = DbTransform::new(&[
            "a.x:b.x".to_string(),
            "a.y:c.y".to_string(),
            "d:e".to_string(),
        ])
        .unwrap();
        assert_eq!(trans.transform("a"), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(trans.transform("d"), vec!["e".to_string()]);
        assert_eq!(trans.transform("zzz"), vec!["zzz".to_string()]);
    }

    #[test]
    fn test_dbref_rewrite() {
        let trans = NamespaceTransform::new(&["olddb:newdb".to_string()]).unwrap();
        let doc = doc! {
            "link": { "$ref": "users", "$id": 7 },
            "nested": { "inner": { "$ref": "users", "$id": 8, "$db": "olddb" } },
        };
        let out = transform_dbref(doc, "olddb", &trans);
        let link = out.get_document("link").unwrap();
        assert_eq!(link.get_str("$ref").unwrap(), "users");
        assert_eq!(link.get_str("$db").unwrap(), "newdb");
        let inner = out
            .get_document("nested")
            .unwrap()
            .get_document("inner")
            .unwrap();
        assert_eq!(inner.get_str("$db").unwrap(), "newdb");
    }

    #[test]
    fn test_dbref_untouched_without_rule() {
        let trans = NamespaceTransform::default();
        let doc = doc! { "link": { "$ref": "users", "$id": 7 } };
        let out = transform_dbref(doc.clone(), "db1", &trans);
        assert_eq!(out, doc);
    }
}
