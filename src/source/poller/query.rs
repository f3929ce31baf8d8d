//! Query and attribute projection assembly for the item poller.
//!
//! A query is built from up to three kinds of clauses, each wrapped in
//! parentheses and joined with `and`:
//!
//! 1. the incremental clause (steady state only), comparing the item's mtime
//!    with the checkpoint the poller stamped on it
//! 2. one `ends(__name, '<suffix>')` per configured suffix, joined with `or`
//! 3. user supplied clauses, verbatim

/// Attributes every fetch requests, before the checkpoint and user attributes
pub const BUILTIN_ATTRIBUTES: [&str; 5] = [
    "__name",
    "__mtime_secs",
    "__mtime_nsecs",
    "__obj_type",
    "__size",
];

const CHECKPOINT_ATTRIBUTE_PREFIX: &str = "__eventsource_vip_";

/// Seconds and nanoseconds checkpoint attributes, in that order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointAttributes {
    pub secs: String,
    pub nsecs: String,
}

impl CheckpointAttributes {
    pub fn for_source(source_id: &str) -> Self {
        let prefix = format!("{CHECKPOINT_ATTRIBUTE_PREFIX}{source_id}");
        Self {
            secs: format!("{prefix}_secs"),
            nsecs: format!("{prefix}_nsecs"),
        }
    }
}

/// Comma separated projection: built-ins, checkpoint attributes, user attributes
pub fn attributes_to_request(checkpoint: &CheckpointAttributes, user_attributes: &[String]) -> String {
    BUILTIN_ATTRIBUTES
        .iter()
        .copied()
        .chain([checkpoint.secs.as_str(), checkpoint.nsecs.as_str()])
        .chain(user_attributes.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(",")
}

/// Items modified after the checkpoint stamped on them
pub fn incremental_clause(checkpoint: &CheckpointAttributes) -> String {
    format!(
        "__mtime_secs > {secs} or (__mtime_secs == {secs} and __mtime_nsecs > {nsecs})",
        secs = checkpoint.secs,
        nsecs = checkpoint.nsecs,
    )
}

/// `None` when there are no suffixes, so no empty group is emitted
pub fn suffix_clause(suffixes: &[String]) -> Option<String> {
    if suffixes.is_empty() {
        return None;
    }

    Some(
        suffixes
            .iter()
            .map(|suffix| format!("ends(__name, '{suffix}')"))
            .collect::<Vec<_>>()
            .join(" or "),
    )
}

#[derive(Debug, Clone)]
pub struct QueryParts<'a> {
    pub first_poll: bool,
    pub incremental: bool,
    pub checkpoint: &'a CheckpointAttributes,
    pub suffixes: &'a [String],
    pub user_queries: &'a [String],
}

pub fn build_query(parts: &QueryParts<'_>) -> String {
    let mut clauses = Vec::new();

    // checkpoint attributes do not exist on any item before the first cycle
    if parts.incremental && !parts.first_poll {
        clauses.push(incremental_clause(parts.checkpoint));
    }

    clauses.extend(suffix_clause(parts.suffixes));
    clauses.extend(parts.user_queries.iter().cloned());

    clauses
        .iter()
        .map(|clause| format!("({clause})"))
        .collect::<Vec<_>>()
        .join(" and ")
}
