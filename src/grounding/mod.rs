//! Query grounding validator
//!
//! Statically checks a generated query against the live schema snapshot and a
//! statement allowlist before anything reaches the analytic store. Checks run
//! in order and short-circuit on the first failure:
//!
//! 1. the statement is a single read-only SELECT (WITH...SELECT allowed);
//! 2. every referenced table/view exists in the snapshot;
//! 3. every referenced column exists on its table;
//! 4. no denylisted function is called;
//! 5. a row-limit ceiling is present or injected.
//!
//! Comments are stripped before any check so they cannot smuggle statements
//! past the scanner. Rejections are structured so a query-generation retry
//! can carry them back as feedback. [`ValidatedQuery`] is only constructible
//! here; the analytic store boundary accepts nothing else.

use crate::schema::SchemaSnapshot;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Validator configuration
#[derive(Debug, Clone)]
pub struct GroundingConfig {
    /// Function names (lowercase) that must never appear in a query
    pub denied_functions: HashSet<String>,
    /// Row-limit ceiling injected when a query carries no LIMIT clause
    pub max_rows: u64,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        let denied = [
            "load_extension",
            "readfile",
            "writefile",
            "fts3_tokenizer",
            "zipfile",
            "edit",
            "pg_read_file",
            "pg_sleep",
            "dblink",
            "sleep",
        ];
        Self {
            denied_functions: denied.iter().map(|s| s.to_string()).collect(),
            max_rows: 1000,
        }
    }
}

/// Structured reason a query was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum GroundingRejection {
    /// The query was empty after comment stripping
    #[error("query is empty")]
    Empty,
    /// More than one statement was supplied
    #[error("multiple statements are not allowed")]
    MultipleStatements,
    /// The statement mutates data or schema
    #[error("statement '{statement}' is not read-only")]
    NotReadOnly {
        /// The offending keyword
        statement: String,
    },
    /// A referenced table/view does not exist in the schema snapshot
    #[error("unknown table '{table}'")]
    UnknownTable {
        /// The unresolved relation name
        table: String,
    },
    /// A referenced column does not exist on its table
    #[error("unknown column '{column}'{}", .table.as_ref().map(|t| format!(" on table '{t}'")).unwrap_or_default())]
    UnknownColumn {
        /// The table the column was checked against, when qualified
        table: Option<String>,
        /// The unresolved column name
        column: String,
    },
    /// A denylisted function was called
    #[error("function '{function}' is not allowed")]
    ForbiddenFunction {
        /// The denylisted function name
        function: String,
    },
}

/// A query that passed all grounding checks
///
/// Carries the normalized SQL (whitespace collapsed, comments stripped,
/// row limit ensured) and the real tables it references. Fields are private:
/// the only way to obtain one is through [`GroundingValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedQuery {
    sql: String,
    referenced_tables: Vec<String>,
}

impl ValidatedQuery {
    /// The normalized, limit-capped SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Snapshot tables referenced by the query
    pub fn referenced_tables(&self) -> &[String] {
        &self.referenced_tables
    }
}

/// Validation outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The query is grounded and safe to execute
    Approved(ValidatedQuery),
    /// The query failed a check
    Rejected(GroundingRejection),
}

/// The grounding validator
#[derive(Debug, Clone, Default)]
pub struct GroundingValidator {
    config: GroundingConfig,
}

// Statements that read nothing or change something; any appearance rejects.
const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "REPLACE", "GRANT",
    "REVOKE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "ANALYZE", "MERGE", "COPY",
    "CALL", "EXEC", "EXECUTE", "INTO",
];

const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "BY", "ORDER", "HAVING", "LIMIT", "OFFSET", "AS", "ON",
    "AND", "OR", "NOT", "IN", "IS", "NULL", "LIKE", "BETWEEN", "CASE", "WHEN", "THEN", "ELSE",
    "END", "JOIN", "LEFT", "RIGHT", "INNER", "OUTER", "FULL", "CROSS", "UNION", "ALL", "DISTINCT",
    "WITH", "RECURSIVE", "ASC", "DESC", "OVER", "PARTITION", "ROWS", "RANGE", "PRECEDING",
    "FOLLOWING", "UNBOUNDED", "CURRENT", "ROW", "EXISTS", "CAST", "INTERVAL", "EXTRACT", "FILTER",
    "WITHIN", "USING", "NATURAL", "VALUES", "TRUE", "FALSE", "NULLS", "FIRST", "LAST", "ESCAPE",
    "FOR", "LEADING", "TRAILING", "BOTH", "CURRENT_DATE", "CURRENT_TIMESTAMP", "CURRENT_TIME",
    "LOCALTIME", "LOCALTIMESTAMP",
    // Date-part names appear as bare identifiers in EXTRACT/DATE_TRUNC forms.
    "YEAR", "QUARTER", "MONTH", "WEEK", "DAY", "HOUR", "MINUTE", "SECOND", "EPOCH", "DOW", "DOY",
];

// Functions whose argument list contains a non-relational FROM/AS keyword.
const KEYWORD_ARG_FUNCTIONS: &[&str] = &["EXTRACT", "SUBSTRING", "TRIM", "OVERLAY", "POSITION"];

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident { text: String, quoted: bool },
    Number(String),
    Str(String),
    Punct(char),
}

impl Tok {
    fn unquoted_upper(&self) -> Option<String> {
        match self {
            Tok::Ident {
                text,
                quoted: false,
            } => Some(text.to_uppercase()),
            _ => None,
        }
    }

    fn ident_text(&self) -> Option<&str> {
        match self {
            Tok::Ident { text, .. } => Some(text),
            _ => None,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        matches!(self, Tok::Punct(p) if *p == c)
    }
}

fn is_keyword(upper: &str) -> bool {
    KEYWORDS.contains(&upper) || MUTATING_KEYWORDS.contains(&upper)
}

/// Strip comments and collapse whitespace; string literals are preserved
/// verbatim. The trailing statement terminator is dropped.
pub fn normalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '-' if chars.peek() == Some(&'-') => {
                // Line comment: skip to end of line.
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                pending_space = true;
            }
            '\'' => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push('\'');
                while let Some(next) = chars.next() {
                    out.push(next);
                    if next == '\'' {
                        if chars.peek() == Some(&'\'') {
                            out.push(chars.next().expect("peeked escape quote"));
                        } else {
                            break;
                        }
                    }
                }
            }
            c if c.is_whitespace() => {
                pending_space = true;
            }
            c => {
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }

    let trimmed = out.trim();
    trimmed.strip_suffix(';').unwrap_or(trimmed).trim().to_string()
}

fn tokenize(sql: &str) -> Vec<Tok> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(Tok::Ident {
                text: chars[start..i].iter().collect(),
                quoted: false,
            });
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Tok::Number(chars[start..i].iter().collect()));
        } else if c == '\'' {
            let start = i;
            i += 1;
            while i < chars.len() {
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(Tok::Str(chars[start..i].iter().collect()));
        } else if c == '"' || c == '`' {
            let close = c;
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != close {
                i += 1;
            }
            tokens.push(Tok::Ident {
                text: chars[start..i.min(chars.len())].iter().collect(),
                quoted: true,
            });
            i += 1;
        } else if c == '[' {
            let start = i + 1;
            i += 1;
            while i < chars.len() && chars[i] != ']' {
                i += 1;
            }
            tokens.push(Tok::Ident {
                text: chars[start..i.min(chars.len())].iter().collect(),
                quoted: true,
            });
            i += 1;
        } else {
            tokens.push(Tok::Punct(c));
            i += 1;
        }
    }

    tokens
}

/// Skip a balanced parenthesized group; `open` indexes the '('. Returns the
/// index one past the matching ')'.
fn skip_balanced(tokens: &[Tok], open: usize) -> usize {
    let mut depth = 0usize;
    let mut i = open;
    while i < tokens.len() {
        if tokens[i].is_punct('(') {
            depth += 1;
        } else if tokens[i].is_punct(')') {
            depth -= 1;
            if depth == 0 {
                return i + 1;
            }
        }
        i += 1;
    }
    tokens.len()
}

/// Token indices of FROM keywords that sit inside keyword-argument function
/// calls (e.g. EXTRACT(month FROM order_date)) and must not start a relation
/// list.
fn non_relational_from_indices(tokens: &[Tok]) -> HashSet<usize> {
    let mut skip = HashSet::new();
    for i in 0..tokens.len() {
        let Some(upper) = tokens[i].unquoted_upper() else {
            continue;
        };
        if !KEYWORD_ARG_FUNCTIONS.contains(&upper.as_str()) {
            continue;
        }
        if i + 1 >= tokens.len() || !tokens[i + 1].is_punct('(') {
            continue;
        }
        let end = skip_balanced(tokens, i + 1);
        let mut depth = 0usize;
        for (j, tok) in tokens.iter().enumerate().take(end).skip(i + 1) {
            if tok.is_punct('(') {
                depth += 1;
            } else if tok.is_punct(')') {
                depth -= 1;
            } else if depth == 1 && tok.unquoted_upper().as_deref() == Some("FROM") {
                skip.insert(j);
            }
        }
    }
    skip
}

#[derive(Debug, Clone)]
enum Relation {
    /// A named table or view from the snapshot
    Table(String),
    /// A CTE or derived table; its columns cannot be checked statically
    Wildcard,
}

impl GroundingValidator {
    /// Create a validator with the given configuration
    pub fn new(config: GroundingConfig) -> Self {
        Self { config }
    }

    /// Validate a generated query against the schema snapshot
    ///
    /// # Arguments
    /// * `raw_sql` - The query text as produced by the query-generation agent
    /// * `snapshot` - The schema snapshot for this plan execution
    ///
    /// # Returns
    /// * `Verdict::Approved` - With the normalized, limit-capped query
    /// * `Verdict::Rejected` - With the structured reason of the first failed check
    pub fn validate(&self, raw_sql: &str, snapshot: &SchemaSnapshot) -> Verdict {
        let normalized = normalize(raw_sql);
        if normalized.is_empty() {
            return Verdict::Rejected(GroundingRejection::Empty);
        }

        let tokens = tokenize(&normalized);

        // An interior semicolon means a second statement follows.
        if tokens.iter().any(|t| t.is_punct(';')) {
            return Verdict::Rejected(GroundingRejection::MultipleStatements);
        }

        // Check 1: read-only statement type.
        let first_kw = tokens.iter().find_map(|t| t.unquoted_upper());
        match first_kw.as_deref() {
            Some("SELECT") | Some("WITH") => {}
            Some(other) => {
                return Verdict::Rejected(GroundingRejection::NotReadOnly {
                    statement: other.to_string(),
                });
            }
            None => return Verdict::Rejected(GroundingRejection::Empty),
        }
        for tok in &tokens {
            if let Some(upper) = tok.unquoted_upper() {
                if MUTATING_KEYWORDS.contains(&upper.as_str()) {
                    return Verdict::Rejected(GroundingRejection::NotReadOnly { statement: upper });
                }
            }
        }

        // Check 2: every referenced relation exists.
        let cte_names = collect_cte_names(&tokens);
        let (relations, aliases) = collect_relations(&tokens, &cte_names);

        let mut referenced_tables = Vec::new();
        for relation in &relations {
            if let Relation::Table(name) = relation {
                if snapshot.table(name).is_none() {
                    return Verdict::Rejected(GroundingRejection::UnknownTable {
                        table: name.clone(),
                    });
                }
                if !referenced_tables.iter().any(|t| t == name) {
                    referenced_tables.push(name.clone());
                }
            }
        }

        // Check 3 + 4: column references and the function denylist.
        if let Some(rejection) =
            self.check_columns_and_functions(&tokens, snapshot, &referenced_tables, &aliases)
        {
            return Verdict::Rejected(rejection);
        }

        // Check 5: row-limit ceiling.
        let has_limit = tokens
            .iter()
            .any(|t| t.unquoted_upper().as_deref() == Some("LIMIT"));
        let sql = if has_limit {
            normalized
        } else {
            format!("{} LIMIT {}", normalized, self.config.max_rows)
        };

        Verdict::Approved(ValidatedQuery {
            sql,
            referenced_tables,
        })
    }

    fn check_columns_and_functions(
        &self,
        tokens: &[Tok],
        snapshot: &SchemaSnapshot,
        referenced_tables: &[String],
        aliases: &HashMap<String, Relation>,
    ) -> Option<GroundingRejection> {
        let has_wildcard_relation = aliases
            .values()
            .any(|r| matches!(r, Relation::Wildcard));

        // Select-list and expression aliases come into scope for GROUP BY /
        // ORDER BY; collecting every post-AS identifier covers them.
        let mut output_aliases: HashSet<String> = HashSet::new();
        for window in 0..tokens.len().saturating_sub(1) {
            if tokens[window].unquoted_upper().as_deref() == Some("AS") {
                if let Some(name) = tokens[window + 1].ident_text() {
                    output_aliases.insert(name.to_lowercase());
                }
            }
        }

        let mut i = 0;
        while i < tokens.len() {
            let Some(text) = tokens[i].ident_text().map(str::to_string) else {
                i += 1;
                continue;
            };
            let quoted = matches!(tokens[i], Tok::Ident { quoted: true, .. });
            let upper = text.to_uppercase();
            let lower = text.to_lowercase();

            if !quoted && is_keyword(&upper) {
                i += 1;
                continue;
            }

            // Function call: denylist check, arguments scanned as usual.
            if i + 1 < tokens.len() && tokens[i + 1].is_punct('(') {
                if self.config.denied_functions.contains(&lower) {
                    return Some(GroundingRejection::ForbiddenFunction { function: lower });
                }
                i += 1;
                continue;
            }

            // Qualified reference: alias.column or table.column.
            if i + 2 < tokens.len() && tokens[i + 1].is_punct('.') {
                match aliases.get(&lower) {
                    Some(Relation::Table(table)) => {
                        if tokens[i + 2].is_punct('*') {
                            i += 3;
                            continue;
                        }
                        let Some(column) = tokens[i + 2].ident_text() else {
                            i += 3;
                            continue;
                        };
                        if !snapshot.has_column(table, column) {
                            return Some(GroundingRejection::UnknownColumn {
                                table: Some(table.clone()),
                                column: column.to_string(),
                            });
                        }
                        i += 3;
                        continue;
                    }
                    Some(Relation::Wildcard) => {
                        i += 3;
                        continue;
                    }
                    None => {
                        return Some(GroundingRejection::UnknownTable { table: lower });
                    }
                }
            }

            // Unqualified identifier: relation name, output alias, or column.
            if aliases.contains_key(&lower) || output_aliases.contains(&lower) {
                i += 1;
                continue;
            }
            let known = referenced_tables
                .iter()
                .any(|table| snapshot.has_column(table, &text));
            if !known && !has_wildcard_relation {
                return Some(GroundingRejection::UnknownColumn {
                    table: None,
                    column: text,
                });
            }
            i += 1;
        }

        None
    }
}

fn collect_cte_names(tokens: &[Tok]) -> HashSet<String> {
    let mut names = HashSet::new();
    if tokens
        .first()
        .and_then(|t| t.unquoted_upper())
        .as_deref()
        != Some("WITH")
    {
        return names;
    }

    let mut i = 1;
    if tokens
        .get(i)
        .and_then(|t| t.unquoted_upper())
        .as_deref()
        == Some("RECURSIVE")
    {
        i += 1;
    }

    loop {
        let Some(name) = tokens.get(i).and_then(|t| t.ident_text()) else {
            break;
        };
        names.insert(name.to_lowercase());
        i += 1;
        // Optional column list: name (a, b) AS (...)
        if tokens.get(i).map(|t| t.is_punct('(')).unwrap_or(false) {
            i = skip_balanced(tokens, i);
        }
        if tokens
            .get(i)
            .and_then(|t| t.unquoted_upper())
            .as_deref()
            != Some("AS")
        {
            break;
        }
        i += 1;
        if !tokens.get(i).map(|t| t.is_punct('(')).unwrap_or(false) {
            break;
        }
        i = skip_balanced(tokens, i);
        if tokens.get(i).map(|t| t.is_punct(',')).unwrap_or(false) {
            i += 1;
            continue;
        }
        break;
    }

    names
}

/// Collect relations referenced after FROM/JOIN, plus the alias scope.
///
/// The alias map covers table aliases, bare table names, CTE names, and
/// derived-table aliases (as wildcards).
fn collect_relations(
    tokens: &[Tok],
    cte_names: &HashSet<String>,
) -> (Vec<Relation>, HashMap<String, Relation>) {
    let skip_from = non_relational_from_indices(tokens);
    let mut relations = Vec::new();
    let mut aliases: HashMap<String, Relation> = HashMap::new();

    for name in cte_names {
        aliases.insert(name.clone(), Relation::Wildcard);
    }

    let mut i = 0;
    while i < tokens.len() {
        let keyword = tokens[i].unquoted_upper();
        let is_from = keyword.as_deref() == Some("FROM") && !skip_from.contains(&i);
        let is_join = keyword.as_deref() == Some("JOIN");
        if !is_from && !is_join {
            i += 1;
            continue;
        }
        i += 1;

        loop {
            // Derived table: ( SELECT ... ) alias. The subquery is validated
            // recursively so its relations are grounded too.
            if tokens.get(i).map(|t| t.is_punct('(')).unwrap_or(false) {
                let end = skip_balanced(tokens, i);
                if end >= i + 2 {
                    let (inner_relations, inner_aliases) =
                        collect_relations(&tokens[i + 1..end - 1], cte_names);
                    relations.extend(inner_relations);
                    for (name, relation) in inner_aliases {
                        aliases.entry(name).or_insert(relation);
                    }
                }
                i = end;
                relations.push(Relation::Wildcard);
                i = register_alias(tokens, i, &mut aliases, Relation::Wildcard);
            } else {
                let Some(name) = tokens.get(i).and_then(|t| t.ident_text()) else {
                    break;
                };
                let mut last = name.to_string();
                i += 1;
                // Qualified name: keep the last segment.
                while tokens.get(i).map(|t| t.is_punct('.')).unwrap_or(false) {
                    i += 1;
                    if let Some(part) = tokens.get(i).and_then(|t| t.ident_text()) {
                        last = part.to_string();
                        i += 1;
                    }
                }
                let lower = last.to_lowercase();
                let relation = if cte_names.contains(&lower) {
                    Relation::Wildcard
                } else {
                    Relation::Table(lower.clone())
                };
                relations.push(relation.clone());
                aliases.insert(lower, relation.clone());
                i = register_alias(tokens, i, &mut aliases, relation);
            }

            // Only a FROM clause carries a comma-separated relation list.
            if is_from && tokens.get(i).map(|t| t.is_punct(',')).unwrap_or(false) {
                i += 1;
                continue;
            }
            break;
        }
    }

    (relations, aliases)
}

/// Register `[AS] alias` following a relation, returning the next index.
fn register_alias(
    tokens: &[Tok],
    mut i: usize,
    aliases: &mut HashMap<String, Relation>,
    relation: Relation,
) -> usize {
    if tokens
        .get(i)
        .and_then(|t| t.unquoted_upper())
        .as_deref()
        == Some("AS")
    {
        i += 1;
    }
    if let Some(tok) = tokens.get(i) {
        if let Some(alias) = tok.ident_text() {
            let upper = alias.to_uppercase();
            let quoted = matches!(tok, Tok::Ident { quoted: true, .. });
            if quoted || !is_keyword(&upper) {
                aliases.insert(alias.to_lowercase(), relation);
                return i + 1;
            }
        }
    }
    i
}
