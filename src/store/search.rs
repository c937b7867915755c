//! Translation of a [`SearchCriteria`] into a SQL `WHERE` clause over the
//! `emails` table. Free-text queries go through the FTS index; everything else
//! composes as AND-ed predicates with arrays expanding to OR.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

pub const DEFAULT_SEARCH_LIMIT: u32 = 30;

/// Search criteria shared by the local store and the IMAP search translation.
/// The store ignores `gmail_query`; the IMAP side treats it as authoritative.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchCriteria {
    /// Free-text query, matched against the full-text index.
    pub query: Option<String>,
    /// Native Gmail query, passed through X-GM-RAW on the IMAP side.
    pub gmail_query: Option<String>,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub has_attachments: Option<bool>,
    pub is_unread: Option<bool>,
    pub is_starred: Option<bool>,
    pub folder: Option<String>,
    pub folders: Vec<String>,
    pub thread_id: Option<String>,
    pub labels: Vec<String>,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// A built query fragment: the WHERE clause body and its bind values.
pub struct SqlFilter {
    pub clause: String,
    pub params: Vec<Value>,
}

fn substring_param(needle: &str) -> Value {
    Value::Text(format!("%{}%", needle))
}

/// Build the WHERE fragment for `criteria`. Returns `1 = 1` with no params
/// when nothing is constrained.
pub fn build_filter(criteria: &SearchCriteria) -> SqlFilter {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if let Some(query) = criteria.query.as_deref().filter(|q| !q.trim().is_empty()) {
        clauses.push("id IN (SELECT rowid FROM emails_fts WHERE emails_fts MATCH ?)".to_string());
        params.push(Value::Text(query.to_string()));
    }

    if !criteria.from.is_empty() {
        let ors = vec!["from_address LIKE ?"; criteria.from.len()].join(" OR ");
        clauses.push(format!("({})", ors));
        for sender in &criteria.from {
            params.push(substring_param(sender));
        }
    }

    if !criteria.to.is_empty() {
        let ors = vec!["to_addresses LIKE ?"; criteria.to.len()].join(" OR ");
        clauses.push(format!("({})", ors));
        for recipient in &criteria.to {
            params.push(substring_param(recipient));
        }
    }

    if let Some(subject) = &criteria.subject {
        clauses.push("subject LIKE ?".to_string());
        params.push(substring_param(subject));
    }

    if let Some(since) = &criteria.since {
        clauses.push("date_sent >= ?".to_string());
        params.push(Value::Integer(since.timestamp()));
    }

    if let Some(before) = &criteria.before {
        clauses.push("date_sent <= ?".to_string());
        params.push(Value::Integer(before.timestamp()));
    }

    if let Some(has) = criteria.has_attachments {
        if has {
            clauses.push("attachment_count > 0".to_string());
        } else {
            clauses.push("attachment_count = 0".to_string());
        }
    }

    if let Some(unread) = criteria.is_unread {
        clauses.push("is_read = ?".to_string());
        params.push(Value::Integer(if unread { 0 } else { 1 }));
    }

    if let Some(starred) = criteria.is_starred {
        clauses.push("is_starred = ?".to_string());
        params.push(Value::Integer(if starred { 1 } else { 0 }));
    }

    if let Some(folder) = &criteria.folder {
        clauses.push("folder = ?".to_string());
        params.push(Value::Text(folder.clone()));
    } else if !criteria.folders.is_empty() {
        let marks = vec!["?"; criteria.folders.len()].join(", ");
        clauses.push(format!("folder IN ({})", marks));
        for folder in &criteria.folders {
            params.push(Value::Text(folder.clone()));
        }
    }

    if let Some(thread_id) = &criteria.thread_id {
        clauses.push("thread_id = ?".to_string());
        params.push(Value::Text(thread_id.clone()));
    }

    // Label subset match against the JSON array column.
    for label in &criteria.labels {
        clauses.push("labels LIKE ?".to_string());
        params.push(Value::Text(format!(
            "%{}%",
            serde_json::to_string(label).unwrap_or_default()
        )));
    }

    if let Some(min) = criteria.min_size {
        clauses.push("size_bytes >= ?".to_string());
        params.push(Value::Integer(min as i64));
    }

    if let Some(max) = criteria.max_size {
        clauses.push("size_bytes <= ?".to_string());
        params.push(Value::Integer(max as i64));
    }

    let clause = if clauses.is_empty() {
        "1 = 1".to_string()
    } else {
        clauses.join(" AND ")
    };

    SqlFilter { clause, params }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_criteria_matches_everything() {
        let filter = build_filter(&SearchCriteria::default());
        assert_eq!(filter.clause, "1 = 1");
        assert!(filter.params.is_empty());
    }

    #[test]
    fn sender_array_expands_to_or() {
        let criteria = SearchCriteria {
            from: vec!["a@x.com".to_string(), "b@y.com".to_string()],
            ..Default::default()
        };
        let filter = build_filter(&criteria);
        assert_eq!(filter.clause, "(from_address LIKE ? OR from_address LIKE ?)");
        assert_eq!(filter.params.len(), 2);
    }

    #[test]
    fn free_text_goes_through_fts() {
        let criteria = SearchCriteria {
            query: Some("invoice".to_string()),
            is_unread: Some(true),
            ..Default::default()
        };
        let filter = build_filter(&criteria);
        assert!(filter.clause.contains("emails_fts MATCH ?"));
        assert!(filter.clause.contains("is_read = ?"));
    }

    #[test]
    fn single_folder_wins_over_folder_list() {
        let criteria = SearchCriteria {
            folder: Some("INBOX".to_string()),
            folders: vec!["Spam".to_string()],
            ..Default::default()
        };
        let filter = build_filter(&criteria);
        assert!(filter.clause.contains("folder = ?"));
        assert!(!filter.clause.contains("folder IN"));
    }
}
