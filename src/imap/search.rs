//! Translation of a [`SearchCriteria`] into a server-side IMAP SEARCH
//! expression. A native Gmail query short-circuits everything else and is
//! passed through X-GM-RAW; otherwise the fields compose as an AND of
//! predicates, with sender/recipient arrays expanding to nested ORs.

use chrono::{DateTime, Datelike, Utc};

use crate::store::SearchCriteria;

/// Render a date in the `DD-Mon-YYYY` form IMAP SEARCH expects.
pub fn imap_date(date: &DateTime<Utc>) -> String {
    let month = match date.month() {
        1 => "Jan",
        2 => "Feb",
        3 => "Mar",
        4 => "Apr",
        5 => "May",
        6 => "Jun",
        7 => "Jul",
        8 => "Aug",
        9 => "Sep",
        10 => "Oct",
        11 => "Nov",
        _ => "Dec",
    };
    format!("{}-{}-{}", date.day(), month, date.year())
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Fold `FIELD "a" / FIELD "b" / ...` into nested IMAP ORs.
fn or_group(field: &str, values: &[String]) -> String {
    let mut terms: Vec<String> = values
        .iter()
        .map(|v| format!("{} {}", field, quote(v)))
        .collect();
    let mut expr = terms.pop().unwrap_or_default();
    while let Some(term) = terms.pop() {
        expr = format!("OR {} {}", term, expr);
    }
    expr
}

/// Build the SEARCH expression for `criteria`. Defaults to `ALL` when no
/// field is constrained.
pub fn build_search_expression(criteria: &SearchCriteria) -> String {
    // A native Gmail query is authoritative; every other field is ignored.
    if let Some(gmail_query) = criteria.gmail_query.as_deref() {
        return format!("X-GM-RAW {}", quote(gmail_query));
    }

    let mut terms: Vec<String> = Vec::new();

    if let Some(since) = &criteria.since {
        terms.push(format!("SINCE {}", imap_date(since)));
    }
    if let Some(before) = &criteria.before {
        terms.push(format!("BEFORE {}", imap_date(before)));
    }
    if !criteria.from.is_empty() {
        terms.push(or_group("FROM", &criteria.from));
    }
    if !criteria.to.is_empty() {
        terms.push(or_group("TO", &criteria.to));
    }
    if let Some(subject) = &criteria.subject {
        terms.push(format!("SUBJECT {}", quote(subject)));
    }
    match criteria.is_unread {
        Some(true) => terms.push("UNSEEN".to_string()),
        Some(false) => terms.push("SEEN".to_string()),
        None => {}
    }
    match criteria.is_starred {
        Some(true) => terms.push("FLAGGED".to_string()),
        Some(false) => terms.push("UNFLAGGED".to_string()),
        None => {}
    }
    if let Some(min) = criteria.min_size {
        terms.push(format!("LARGER {}", min));
    }
    if let Some(max) = criteria.max_size {
        terms.push(format!("SMALLER {}", max));
    }
    if let Some(query) = criteria.query.as_deref().filter(|q| !q.trim().is_empty()) {
        terms.push(format!("TEXT {}", quote(query)));
    }

    if terms.is_empty() {
        "ALL".to_string()
    } else {
        terms.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_criteria_is_all() {
        assert_eq!(build_search_expression(&SearchCriteria::default()), "ALL");
    }

    #[test]
    fn gmail_query_overrides_everything_else() {
        let criteria = SearchCriteria {
            gmail_query: Some("is:unread from:me".to_string()),
            from: vec!["boss@".to_string()],
            is_unread: Some(true),
            ..Default::default()
        };
        assert_eq!(
            build_search_expression(&criteria),
            "X-GM-RAW \"is:unread from:me\""
        );
    }

    #[test]
    fn senders_expand_to_nested_ors() {
        let criteria = SearchCriteria {
            from: vec![
                "a@x.com".to_string(),
                "b@y.com".to_string(),
                "c@z.com".to_string(),
            ],
            ..Default::default()
        };
        assert_eq!(
            build_search_expression(&criteria),
            "OR FROM \"a@x.com\" OR FROM \"b@y.com\" FROM \"c@z.com\""
        );
    }

    #[test]
    fn predicates_compose_as_and() {
        let criteria = SearchCriteria {
            since: DateTime::from_timestamp(1_700_000_000, 0),
            subject: Some("report".to_string()),
            is_unread: Some(true),
            min_size: Some(1024),
            ..Default::default()
        };
        let expr = build_search_expression(&criteria);
        assert!(expr.starts_with("SINCE 14-Nov-2023"));
        assert!(expr.contains("SUBJECT \"report\""));
        assert!(expr.contains("UNSEEN"));
        assert!(expr.contains("LARGER 1024"));
    }

    #[test]
    fn date_renders_in_imap_form() {
        let date = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(imap_date(&date), "14-Nov-2023");
    }
}
