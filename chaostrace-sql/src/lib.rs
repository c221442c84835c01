//! ChaosTrace SQL - Statement Classifier
//!
//! Parses raw SQL text into a normalized [`ParsedStatement`]: operation
//! kind, referenced tables and columns, predicate presence, and estimated
//! row scope. Pure and deterministic: identical input always yields
//! identical output, with no clock, network, or shared-state dependence.
//!
//! Classification failure is never fatal. Text the classifier cannot make
//! sense of is passed through as operation `Other` with the raw text
//! preserved; only policy and chaos decisions may block traffic.

mod scanner;

pub use scanner::{Scanner, SqlToken};

use chaostrace_core::{
    statement_hash, DdlKind, ParsedStatement, RowScope, SqlOperation,
};
use std::collections::BTreeSet;

/// Keywords that terminate a table list or column region.
const CLAUSE_KEYWORDS: &[&str] = &[
    "select", "from", "where", "group", "order", "having", "limit", "offset", "set", "values",
    "join", "inner", "left", "right", "full", "cross", "outer", "on", "using", "as", "and", "or",
    "not", "in", "like", "between", "is", "null", "into", "returning", "union", "except",
    "intersect", "distinct", "all", "exists", "case", "when", "then", "else", "end", "asc",
    "desc", "by", "insert", "update", "delete", "table", "if", "cascade", "restrict", "to",
];

fn is_clause_keyword(word: &str) -> bool {
    CLAUSE_KEYWORDS.iter().any(|kw| word.eq_ignore_ascii_case(kw))
}

/// Classify a raw SQL statement.
///
/// Multi-statement input is classified by its first statement; the raw
/// text is always carried whole.
pub fn classify(sql: &str) -> ParsedStatement {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return ParsedStatement::unparseable(sql, "empty statement");
    }

    let tokens = Scanner::new(trimmed).tokenize();
    let Some(first_word) = tokens.iter().find_map(|t| match t {
        SqlToken::Word(w) => Some(w.to_ascii_lowercase()),
        _ => None,
    }) else {
        return ParsedStatement::unparseable(sql, "no leading keyword");
    };

    let (operation, ddl_kind) = match leading_operation(&first_word, &tokens) {
        Some(pair) => pair,
        None => {
            return ParsedStatement::unparseable(
                sql,
                format!("unrecognized leading keyword: {}", first_word),
            )
        }
    };

    let tables = extract_tables(&tokens, operation, ddl_kind);
    let columns = extract_columns(&tokens, operation);
    let has_where = tokens.iter().any(|t| t.is_keyword("where"));
    let has_limit = tokens.iter().any(|t| t.is_keyword("limit"));
    let row_scope = estimate_row_scope(&tokens, operation, has_where, has_limit);

    ParsedStatement {
        operation,
        ddl_kind,
        tables,
        columns,
        has_where,
        has_limit,
        row_scope,
        statement_hash: statement_hash(trimmed),
        raw_text: sql.to_string(),
        parse_error: None,
    }
}

/// Determine the operation from the leading keyword. CTEs (`WITH ...`)
/// classify by the first top-level verb that follows.
fn leading_operation(first: &str, tokens: &[SqlToken]) -> Option<(SqlOperation, Option<DdlKind>)> {
    let classify_word = |word: &str| -> Option<(SqlOperation, Option<DdlKind>)> {
        match word {
            "select" => Some((SqlOperation::Select, None)),
            "insert" => Some((SqlOperation::Insert, None)),
            "update" => Some((SqlOperation::Update, None)),
            "delete" => Some((SqlOperation::Delete, None)),
            "create" => Some((SqlOperation::Ddl, Some(DdlKind::Create))),
            "alter" => Some((SqlOperation::Ddl, Some(DdlKind::Alter))),
            "drop" => Some((SqlOperation::Ddl, Some(DdlKind::Drop))),
            "truncate" => Some((SqlOperation::Ddl, Some(DdlKind::Truncate))),
            "grant" => Some((SqlOperation::Ddl, Some(DdlKind::Grant))),
            "revoke" => Some((SqlOperation::Ddl, Some(DdlKind::Revoke))),
            "begin" | "start" | "commit" | "rollback" | "set" | "show" | "explain" | "vacuum"
            | "analyze" | "copy" => Some((SqlOperation::Other, None)),
            _ => None,
        }
    };

    if first == "with" {
        // First DML verb after the CTE definitions wins.
        for token in tokens.iter().skip(1) {
            if let SqlToken::Word(w) = token {
                let word = w.to_ascii_lowercase();
                if matches!(word.as_str(), "select" | "insert" | "update" | "delete") {
                    return classify_word(&word);
                }
            }
        }
        return Some((SqlOperation::Other, None));
    }

    classify_word(first)
}

/// Collect referenced table names: after FROM and JOIN (including
/// comma-separated lists with aliases), after INSERT INTO, after UPDATE,
/// after DDL's TABLE keyword, after bare TRUNCATE, and after ON for
/// GRANT/REVOKE.
fn extract_tables(
    tokens: &[SqlToken],
    operation: SqlOperation,
    ddl_kind: Option<DdlKind>,
) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();
    let grant_like = matches!(ddl_kind, Some(DdlKind::Grant | DdlKind::Revoke));

    let mut i = 0;
    while i < tokens.len() {
        let intro = match &tokens[i] {
            SqlToken::Word(w) => {
                let w = w.to_ascii_lowercase();
                match w.as_str() {
                    "from" | "join" | "into" => true,
                    "update" if operation == SqlOperation::Update && i == 0 => true,
                    "table" => true,
                    "truncate" if i == 0 => {
                        // TRUNCATE users (TABLE keyword optional)
                        !matches!(tokens.get(i + 1), Some(t) if t.is_keyword("table"))
                    }
                    "on" if grant_like => true,
                    _ => false,
                }
            }
            _ => false,
        };

        if intro {
            i += 1;
            // IF EXISTS / IF NOT EXISTS between TABLE and the name
            while matches!(&tokens.get(i), Some(SqlToken::Word(w))
                if matches!(w.to_ascii_lowercase().as_str(), "if" | "not" | "exists" | "only"))
            {
                i += 1;
            }
            i = consume_table_list(tokens, i, &mut tables);
        } else {
            i += 1;
        }
    }

    tables
}

/// Consume `ident(.ident)* [alias] (, ident...)*` starting at `i`,
/// recording the last dotted segment of each reference as the table name.
/// Returns the index after the list.
fn consume_table_list(tokens: &[SqlToken], mut i: usize, tables: &mut BTreeSet<String>) -> usize {
    loop {
        // Subquery in table position: skip, its FROM is scanned anyway.
        if matches!(tokens.get(i), Some(SqlToken::Symbol('('))) {
            return i;
        }

        let Some(name) = dotted_name(tokens, &mut i) else {
            return i;
        };
        tables.insert(name);

        // Optional alias: a bare word that is not a clause keyword.
        if let Some(SqlToken::Word(w)) = tokens.get(i) {
            if !is_clause_keyword(w) {
                i += 1;
            }
        }

        if matches!(tokens.get(i), Some(SqlToken::Symbol(','))) {
            i += 1;
            continue;
        }
        return i;
    }
}

/// Read `ident(.ident)*` and return the final segment, lowercased.
fn dotted_name(tokens: &[SqlToken], i: &mut usize) -> Option<String> {
    let mut last = match tokens.get(*i) {
        Some(t @ (SqlToken::Word(_) | SqlToken::QuotedIdent(_))) => {
            if let SqlToken::Word(w) = t {
                if is_clause_keyword(w) {
                    return None;
                }
            }
            t.ident()?
        }
        _ => return None,
    };
    *i += 1;

    while matches!(tokens.get(*i), Some(SqlToken::Symbol('.'))) {
        match tokens.get(*i + 1) {
            Some(t @ (SqlToken::Word(_) | SqlToken::QuotedIdent(_))) => {
                last = t.ident()?;
                *i += 2;
            }
            _ => break,
        }
    }
    Some(last)
}

/// Column regions per operation kind:
/// the select list, SET assignments, the INSERT column list, and
/// identifiers referenced inside WHERE.
fn extract_columns(tokens: &[SqlToken], operation: SqlOperation) -> BTreeSet<String> {
    let mut columns = BTreeSet::new();

    match operation {
        SqlOperation::Select => {
            collect_region_idents(tokens, "select", &["from"], &mut columns);
        }
        SqlOperation::Update => {
            collect_set_targets(tokens, &mut columns);
        }
        SqlOperation::Insert => {
            collect_insert_columns(tokens, &mut columns);
        }
        _ => {}
    }

    collect_region_idents(
        tokens,
        "where",
        &["group", "order", "limit", "returning"],
        &mut columns,
    );

    columns
}

/// Identifiers between `start` and any of `stops`, skipping function
/// calls (`ident(`) and clause keywords. `a.b` records only `b`.
fn collect_region_idents(
    tokens: &[SqlToken],
    start: &str,
    stops: &[&str],
    columns: &mut BTreeSet<String>,
) {
    let Some(begin) = tokens.iter().position(|t| t.is_keyword(start)) else {
        return;
    };

    let mut i = begin + 1;
    while i < tokens.len() {
        if let SqlToken::Word(w) = &tokens[i] {
            let lower = w.to_ascii_lowercase();
            if stops.contains(&lower.as_str()) {
                break;
            }
            if is_clause_keyword(&lower) {
                i += 1;
                continue;
            }
        }

        match &tokens[i] {
            SqlToken::Word(_) | SqlToken::QuotedIdent(_) => {
                let mut j = i;
                if let Some(name) = dotted_name(tokens, &mut j) {
                    // ident( is a function call, not a column
                    if matches!(tokens.get(j), Some(SqlToken::Symbol('('))) {
                        i = j + 1;
                        continue;
                    }
                    columns.insert(name);
                    i = j;
                    continue;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
}

/// SET a = ..., b = ... assignment targets.
fn collect_set_targets(tokens: &[SqlToken], columns: &mut BTreeSet<String>) {
    let Some(begin) = tokens.iter().position(|t| t.is_keyword("set")) else {
        return;
    };

    let mut i = begin + 1;
    let mut expect_target = true;
    while i < tokens.len() {
        if tokens[i].is_keyword("where") || tokens[i].is_keyword("returning") {
            break;
        }
        match &tokens[i] {
            SqlToken::Word(_) | SqlToken::QuotedIdent(_) if expect_target => {
                let mut j = i;
                if let Some(name) = dotted_name(tokens, &mut j) {
                    if matches!(tokens.get(j), Some(SqlToken::Symbol('='))) {
                        columns.insert(name);
                    }
                    i = j;
                    expect_target = false;
                    continue;
                }
                i += 1;
            }
            SqlToken::Symbol(',') => {
                expect_target = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
}

/// INSERT INTO t (a, b, c) VALUES ... column list.
fn collect_insert_columns(tokens: &[SqlToken], columns: &mut BTreeSet<String>) {
    let Some(into) = tokens.iter().position(|t| t.is_keyword("into")) else {
        return;
    };

    let mut i = into + 1;
    if dotted_name(tokens, &mut i).is_none() {
        return;
    }
    if !matches!(tokens.get(i), Some(SqlToken::Symbol('('))) {
        return;
    }
    i += 1;
    while i < tokens.len() {
        match &tokens[i] {
            SqlToken::Symbol(')') => break,
            SqlToken::Symbol(',') => i += 1,
            SqlToken::Word(_) | SqlToken::QuotedIdent(_) => {
                if let Some(name) = tokens[i].ident() {
                    columns.insert(name);
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
}

/// Estimate the row scope.
///
/// DML without WHERE is unbounded; an explicit LIMIT bounds it; a WHERE
/// consisting of a single equality predicate is treated as single-row;
/// everything else is unknown. INSERT ... VALUES with one tuple is
/// single-row, several tuples are bounded, INSERT ... SELECT is unknown.
fn estimate_row_scope(
    tokens: &[SqlToken],
    operation: SqlOperation,
    has_where: bool,
    has_limit: bool,
) -> RowScope {
    match operation {
        SqlOperation::Delete | SqlOperation::Update => {
            if !has_where {
                RowScope::Unbounded
            } else if single_equality_where(tokens) {
                RowScope::Single
            } else if has_limit {
                RowScope::Bounded
            } else {
                RowScope::Unknown
            }
        }
        SqlOperation::Select => {
            if has_limit {
                RowScope::Bounded
            } else if !has_where {
                RowScope::Unbounded
            } else if single_equality_where(tokens) {
                RowScope::Single
            } else {
                RowScope::Unknown
            }
        }
        SqlOperation::Insert => {
            if tokens.iter().any(|t| t.is_keyword("select")) {
                RowScope::Unknown
            } else if count_value_tuples(tokens) > 1 {
                RowScope::Bounded
            } else {
                RowScope::Single
            }
        }
        SqlOperation::Ddl | SqlOperation::Other => RowScope::Unknown,
    }
}

/// A WHERE clause of exactly one `=` comparison with no OR/IN/LIKE.
fn single_equality_where(tokens: &[SqlToken]) -> bool {
    let Some(begin) = tokens.iter().position(|t| t.is_keyword("where")) else {
        return false;
    };
    let region = &tokens[begin + 1..];
    let eq_count = region
        .iter()
        .filter(|t| matches!(t, SqlToken::Symbol('=')))
        .count();
    let widening = region.iter().any(|t| {
        t.is_keyword("or") || t.is_keyword("in") || t.is_keyword("like") || t.is_keyword("between")
    });
    eq_count == 1 && !widening
}

/// Count `(...)` tuples following VALUES.
fn count_value_tuples(tokens: &[SqlToken]) -> usize {
    let Some(values) = tokens.iter().position(|t| t.is_keyword("values")) else {
        return 0;
    };
    let mut tuples = 0;
    let mut depth = 0usize;
    for token in &tokens[values + 1..] {
        match token {
            SqlToken::Symbol('(') => {
                if depth == 0 {
                    tuples += 1;
                }
                depth += 1;
            }
            SqlToken::Symbol(')') => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    tuples
}

// ============================================================================
// TESTS
// ============================================================================
