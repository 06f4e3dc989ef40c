// ABOUTME: Lightweight DML statement classification
// ABOUTME: Extracts the operation and target table from INSERT/UPDATE/DELETE statements

use crate::audit::Operation;

/// Classify a statement, returning its operation and target table.
///
/// Returns `None` for anything the capture path should pass through
/// untouched: SELECTs, DDL, and DML whose target table cannot be
/// determined (multi-table or otherwise non-trivial statements).
pub fn classify(sql: &str) -> Option<(Operation, String)> {
    let operation = parse_operation(sql)?;
    let table = extract_table_name(sql, operation)?;
    Some((operation, table))
}

/// Parse the leading keyword into an operation.
pub fn parse_operation(sql: &str) -> Option<Operation> {
    let first = words(sql).next()?;
    if first.eq_ignore_ascii_case("INSERT") {
        Some(Operation::Insert)
    } else if first.eq_ignore_ascii_case("UPDATE") {
        Some(Operation::Update)
    } else if first.eq_ignore_ascii_case("DELETE") {
        Some(Operation::Delete)
    } else {
        None
    }
}

/// Extract the target table name for a classified statement.
///
/// Handles the SQLite conflict-clause forms (`INSERT OR REPLACE INTO`,
/// `UPDATE OR IGNORE`) and quoted or schema-qualified identifiers.
fn extract_table_name(sql: &str, operation: Operation) -> Option<String> {
    let mut scan = words(sql);
    scan.next()?; // the keyword itself

    match operation {
        Operation::Insert => {
            let mut word = scan.next()?;
            if word.eq_ignore_ascii_case("OR") {
                scan.next()?; // conflict action
                word = scan.next()?;
            }
            if !word.eq_ignore_ascii_case("INTO") {
                return None;
            }
            normalize_identifier(scan.next()?)
        }
        Operation::Update => {
            let mut word = scan.next()?;
            if word.eq_ignore_ascii_case("OR") {
                scan.next()?;
                word = scan.next()?;
            }
            normalize_identifier(word)
        }
        Operation::Delete => {
            let word = scan.next()?;
            if !word.eq_ignore_ascii_case("FROM") {
                return None;
            }
            normalize_identifier(scan.next()?)
        }
    }
}

/// Extract the WHERE clause body of a statement, if any.
///
/// The clause is cut before any trailing ORDER BY / GROUP BY / LIMIT /
/// OFFSET / RETURNING. Used to re-select the rows a predicate matches.
pub fn extract_where_clause(sql: &str) -> Option<String> {
    let upper = sql.to_ascii_uppercase();
    let idx = find_keyword(&upper, "WHERE")?;
    let mut clause = &sql[idx + "WHERE".len()..];

    let clause_upper = &upper[idx + "WHERE".len()..];
    let mut cut = clause.len();
    for terminator in ["ORDER BY", "GROUP BY", "LIMIT", "OFFSET", "RETURNING"] {
        if let Some(pos) = find_keyword(clause_upper, terminator) {
            cut = cut.min(pos);
        }
    }
    clause = &clause[..cut];

    let trimmed = clause.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Find an upper-cased keyword at a word boundary.
fn find_keyword(upper: &str, keyword: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(rel) = upper[from..].find(keyword) {
        let idx = from + rel;
        let before_ok = idx == 0
            || !upper.as_bytes()[idx - 1].is_ascii_alphanumeric()
                && upper.as_bytes()[idx - 1] != b'_';
        let after = idx + keyword.len();
        let after_ok = after >= upper.len()
            || !upper.as_bytes()[after].is_ascii_alphanumeric() && upper.as_bytes()[after] != b'_';
        if before_ok && after_ok {
            return Some(idx);
        }
        from = idx + keyword.len();
    }
    None
}

/// Iterate whitespace-separated words, splitting before `(` so that
/// `INSERT INTO users(id, name)` yields `users`.
fn words(sql: &str) -> impl Iterator<Item = &str> {
    sql.split_whitespace()
        .flat_map(|w| w.splitn(2, '(').take(1))
        .filter(|w| !w.is_empty())
}

/// Strip quoting and schema qualification from an identifier.
///
/// Returns `None` when the remainder is empty or contains characters a
/// plain SQLite table name cannot, which sends the statement down the
/// uncaptured path instead of risking a bad re-query.
fn normalize_identifier(raw: &str) -> Option<String> {
    let unquoted = raw
        .trim_matches(|c| c == '"' || c == '`' || c == '\'' || c == '[' || c == ']')
        .trim();
    let name = unquoted.rsplit('.').next()?.trim_matches(|c| {
        c == '"' || c == '`' || c == '\'' || c == '[' || c == ']'
    });

    if name.is_empty() {
        return None;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some(name.to_string())
}

/// Validate a table or column name before splicing it into SQL.
pub fn validate_identifier(name: &str) -> Result<(), crate::error::SyncError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if ok {
        Ok(())
    } else {
        Err(crate::error::SyncError::Config(format!(
            "invalid identifier '{}'",
            name
        )))
    }
}

/// Quote an identifier for SQLite.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_insert() {
        assert_eq!(
            classify("INSERT INTO users (name) VALUES ('a')"),
            Some((Operation::Insert, "users".to_string()))
        );
        assert_eq!(
            classify("insert into users(name) values ('a')"),
            Some((Operation::Insert, "users".to_string()))
        );
        assert_eq!(
            classify("INSERT OR REPLACE INTO \"orders\" VALUES (1)"),
            Some((Operation::Insert, "orders".to_string()))
        );
    }

    #[test]
    fn classifies_update_and_delete() {
        assert_eq!(
            classify("UPDATE orders SET status = 'done' WHERE id = 1"),
            Some((Operation::Update, "orders".to_string()))
        );
        assert_eq!(
            classify("UPDATE OR IGNORE `users` SET name = 'x'"),
            Some((Operation::Update, "users".to_string()))
        );
        assert_eq!(
            classify("DELETE FROM users WHERE id = 2"),
            Some((Operation::Delete, "users".to_string()))
        );
    }

    #[test]
    fn non_dml_is_other() {
        assert_eq!(classify("SELECT * FROM users"), None);
        assert_eq!(classify("CREATE TABLE t (id INTEGER)"), None);
        assert_eq!(classify("PRAGMA journal_mode=WAL"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn malformed_dml_is_other() {
        // DELETE without FROM (MySQL multi-table form) is out of scope
        assert_eq!(classify("DELETE users FROM users JOIN x"), None);
        // Garbage identifier
        assert_eq!(classify("INSERT INTO ??? VALUES (1)"), None);
    }

    #[test]
    fn schema_qualified_names() {
        assert_eq!(
            classify("INSERT INTO main.users VALUES (1)"),
            Some((Operation::Insert, "users".to_string()))
        );
    }

    #[test]
    fn where_clause_extraction() {
        assert_eq!(
            extract_where_clause("UPDATE users SET name = 'x' WHERE id = ?"),
            Some("id = ?".to_string())
        );
        assert_eq!(
            extract_where_clause("DELETE FROM users WHERE age > 10 ORDER BY id LIMIT 5"),
            Some("age > 10".to_string())
        );
        assert_eq!(extract_where_clause("DELETE FROM users"), None);
    }

    #[test]
    fn where_keyword_inside_identifier_is_ignored() {
        assert_eq!(
            extract_where_clause("UPDATE t SET anywhere_flag = 1"),
            None
        );
    }

    #[test]
    fn identifier_validation() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("_audit_log").is_ok());
        assert!(validate_identifier("users; DROP TABLE users").is_err());
        assert!(validate_identifier("1users").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn quoting() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
