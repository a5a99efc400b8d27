//! Keyspace-prefix statement rewriting
//!
//! CQL statements are rewritten textually but structurally: after each
//! keyword context below, the following identifier (or its dotted
//! qualifier) is prefixed with the tenant's internal token. Word
//! boundaries are whitespace and `;`. Quoted identifiers take the prefix
//! inside the quotes. Identifiers in the `system*` namespaces are never
//! rewritten, and an identifier that already carries the token is left
//! alone, which makes the rewrite idempotent.
//!
//! | context                          | rule                                |
//! |----------------------------------|-------------------------------------|
//! | `USE ks`                         | prefix the identifier               |
//! | `FROM ks.tbl`                    | prefix the qualifier, qualified only|
//! | `INTO` / `UPDATE`                | prefix qualifier, else the table    |
//! | `TABLE ks.tbl` / `ON ks.tbl`     | prefix the qualifier, qualified only|
//! | `KEYSPACE ks` / `SCHEMA ks`      | prefix the final identifier, past   |
//! |                                  | any `IF NOT EXISTS`                 |
//! | `USER name` / `TO name` / `OF name` | prefix the name                  |
//!
//! Rewriting is one left-to-right token walk over the statement; there is
//! no regex machinery to backtrack on long statements.

/// How a keyword context selects what to prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    /// Prefix the following identifier unconditionally
    Identifier,
    /// Prefix the dotted qualifier; unqualified names pass through
    QualifierOnly,
    /// Prefix the dotted qualifier, or the bare table name itself
    QualifierOrTable,
    /// Prefix the final identifier, skipping IF / NOT / EXISTS
    KeyspaceName,
}

fn rule_for(keyword: &str) -> Option<Rule> {
    const CONTEXTS: &[(&str, Rule)] = &[
        ("USE", Rule::Identifier),
        ("USER", Rule::Identifier),
        ("TO", Rule::Identifier),
        ("OF", Rule::Identifier),
        ("FROM", Rule::QualifierOnly),
        ("TABLE", Rule::QualifierOnly),
        ("ON", Rule::QualifierOnly),
        ("INTO", Rule::QualifierOrTable),
        ("UPDATE", Rule::QualifierOrTable),
        ("KEYSPACE", Rule::KeyspaceName),
        ("SCHEMA", Rule::KeyspaceName),
    ];
    CONTEXTS
        .iter()
        .find(|(kw, _)| keyword.eq_ignore_ascii_case(kw))
        .map(|&(_, rule)| rule)
}

fn is_conditional_word(word: &str) -> bool {
    word.eq_ignore_ascii_case("IF")
        || word.eq_ignore_ascii_case("NOT")
        || word.eq_ignore_ascii_case("EXISTS")
}

/// Rewrite a statement so tenant keyspace references carry `token`.
/// With an empty token (unauthenticated session) the text passes through.
pub fn rewrite_statement(statement: &str, token: &str) -> String {
    if token.is_empty() {
        return statement.to_string();
    }

    let spans = word_spans(statement);
    let mut insertions: Vec<usize> = Vec::new();

    let mut i = 0;
    while i < spans.len() {
        let word = span_text(statement, spans[i]);
        let Some(rule) = rule_for(word) else {
            i += 1;
            continue;
        };

        let mut target = i + 1;
        if rule == Rule::KeyspaceName {
            while target < spans.len() && is_conditional_word(span_text(statement, spans[target])) {
                target += 1;
            }
        }
        if target >= spans.len() {
            break;
        }

        let (start, _) = spans[target];
        if let Some(pos) = insertion_point(span_text(statement, spans[target]), start, rule, token)
        {
            insertions.push(pos);
        }

        // The target may itself open the next context (e.g. ON KEYSPACE ks).
        i = target;
    }

    splice(statement, &insertions, token)
}

/// A statement is interesting when its results may expose cross-tenant
/// metadata: it names `system`, `permissions`, or `users`, preceded by
/// whitespace so tenant keyspaces like `mysystem` do not trip it.
pub fn is_interesting(statement: &str) -> bool {
    let lower = statement.to_ascii_lowercase();
    ["system", "permissions", "users"].iter().any(|needle| {
        let mut from = 0;
        while let Some(idx) = lower[from..].find(needle) {
            let abs = from + idx;
            if abs > 0 && lower.as_bytes()[abs - 1].is_ascii_whitespace() {
                return true;
            }
            from = abs + 1;
        }
        false
    })
}

/// Maximal runs of non-whitespace, non-`;` bytes
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() || c == ';' {
            if let Some(s) = start.take() {
                spans.push((s, i));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

fn span_text(text: &str, (start, end): (usize, usize)) -> &str {
    &text[start..end]
}

/// Where the token goes inside `word`, or `None` when the word must not
/// be rewritten under `rule`.
fn insertion_point(word: &str, word_start: usize, rule: Rule, token: &str) -> Option<usize> {
    // Quoted identifiers take the prefix inside the opening quote.
    let quote_offset = match word.as_bytes().first() {
        Some(b'"') | Some(b'\'') => 1,
        _ => 0,
    };
    let inner = word[quote_offset..].trim_end_matches(['"', '\'']);
    if inner.is_empty() {
        return None;
    }

    let dot = inner.find('.');
    let checked = match rule {
        Rule::QualifierOnly => &inner[..dot?],
        Rule::QualifierOrTable => match dot {
            Some(d) => &inner[..d],
            None => inner,
        },
        Rule::Identifier | Rule::KeyspaceName => match dot {
            Some(d) => &inner[..d],
            None => inner,
        },
    };

    if is_exempt(checked, token) {
        return None;
    }
    Some(word_start + quote_offset)
}

/// `system*` namespaces pass through, and an identifier already carrying
/// the token is never prefixed twice.
fn is_exempt(ident: &str, token: &str) -> bool {
    let bytes = ident.as_bytes();
    (bytes.len() >= 6 && bytes[..6].eq_ignore_ascii_case(b"system")) || ident.starts_with(token)
}

fn splice(statement: &str, insertions: &[usize], token: &str) -> String {
    let mut out = String::with_capacity(statement.len() + insertions.len() * token.len());
    let mut last = 0;
    for &pos in insertions {
        out.push_str(&statement[last..pos]);
        out.push_str(token);
        last = pos;
    }
    out.push_str(&statement[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "tttttttttttttttttttt";

    fn rw(statement: &str) -> String {
        rewrite_statement(statement, TOKEN)
    }

    #[test]
    fn test_use_statement() {
        assert_eq!(rw("USE app;"), format!("USE {}app;", TOKEN));
        assert_eq!(rw("use app"), format!("use {}app", TOKEN));
    }

    #[test]
    fn test_use_quoted_prefixes_inside_quotes() {
        assert_eq!(rw("USE \"app\";"), format!("USE \"{}app\";", TOKEN));
    }

    #[test]
    fn test_from_qualified_only() {
        assert_eq!(
            rw("SELECT * FROM app.events WHERE id = 1;"),
            format!("SELECT * FROM {}app.events WHERE id = 1;", TOKEN)
        );
        // Unqualified FROM resolves through USE; left alone.
        assert_eq!(rw("SELECT * FROM events;"), "SELECT * FROM events;");
    }

    #[test]
    fn test_into_prefixes_bare_table() {
        assert_eq!(
            rw("INSERT INTO events (id) VALUES (1);"),
            format!("INSERT INTO {}events (id) VALUES (1);", TOKEN)
        );
        assert_eq!(
            rw("INSERT INTO app.events (id) VALUES (1);"),
            format!("INSERT INTO {}app.events (id) VALUES (1);", TOKEN)
        );
    }

    #[test]
    fn test_update_matches_into() {
        assert_eq!(
            rw("UPDATE counters SET n = n + 1;"),
            format!("UPDATE {}counters SET n = n + 1;", TOKEN)
        );
        assert_eq!(
            rw("UPDATE app.counters SET n = n + 1;"),
            format!("UPDATE {}app.counters SET n = n + 1;", TOKEN)
        );
    }

    #[test]
    fn test_create_keyspace_with_conditionals() {
        assert_eq!(
            rw("CREATE KEYSPACE app WITH replication = {'class': 'SimpleStrategy'};"),
            format!(
                "CREATE KEYSPACE {}app WITH replication = {{'class': 'SimpleStrategy'}};",
                TOKEN
            )
        );
        assert_eq!(
            rw("CREATE KEYSPACE IF NOT EXISTS app;"),
            format!("CREATE KEYSPACE IF NOT EXISTS {}app;", TOKEN)
        );
        assert_eq!(
            rw("CREATE SCHEMA app;"),
            format!("CREATE SCHEMA {}app;", TOKEN)
        );
    }

    #[test]
    fn test_drop_table_qualified() {
        assert_eq!(
            rw("DROP TABLE app.events;"),
            format!("DROP TABLE {}app.events;", TOKEN)
        );
        assert_eq!(rw("DROP TABLE events;"), "DROP TABLE events;");
    }

    #[test]
    fn test_grant_on_keyspace_to_user() {
        assert_eq!(
            rw("GRANT SELECT ON KEYSPACE app TO alice;"),
            format!("GRANT SELECT ON KEYSPACE {}app TO {}alice;", TOKEN, TOKEN)
        );
    }

    #[test]
    fn test_user_statements() {
        assert_eq!(
            rw("CREATE USER alice WITH PASSWORD 'p';"),
            format!("CREATE USER {}alice WITH PASSWORD 'p';", TOKEN)
        );
        assert_eq!(
            rw("LIST ALL PERMISSIONS OF 'bob';"),
            format!("LIST ALL PERMISSIONS OF '{}bob';", TOKEN)
        );
    }

    #[test]
    fn test_system_keyspaces_untouched() {
        for q in [
            "SELECT * FROM system.local;",
            "SELECT * FROM system.schema_keyspaces;",
            "SELECT * FROM system_auth.users;",
            "USE system;",
            "USE SYSTEM_TRACES;",
        ] {
            assert_eq!(rw(q), q, "system reference was rewritten: {}", q);
        }
    }

    #[test]
    fn test_tenant_keyspace_resembling_system_is_rewritten() {
        assert_eq!(
            rw("SELECT * FROM mysystem.t;"),
            format!("SELECT * FROM {}mysystem.t;", TOKEN)
        );
    }

    #[test]
    fn test_idempotence() {
        for q in [
            "USE app;",
            "SELECT * FROM app.events;",
            "INSERT INTO events (id) VALUES (1);",
            "CREATE KEYSPACE IF NOT EXISTS app;",
            "GRANT SELECT ON KEYSPACE app TO alice;",
            "SELECT * FROM system.local;",
            "USE \"app\";",
        ] {
            let once = rw(q);
            assert_eq!(rw(&once), once, "double rewrite diverged for: {}", q);
        }
    }

    #[test]
    fn test_empty_token_is_identity() {
        assert_eq!(rewrite_statement("USE app;", ""), "USE app;");
    }

    #[test]
    fn test_keyword_at_end_of_statement() {
        assert_eq!(rw("USE"), "USE");
        assert_eq!(rw("SELECT * FROM"), "SELECT * FROM");
    }

    #[test]
    fn test_interesting_detection() {
        assert!(is_interesting("SELECT * FROM system.local;"));
        assert!(is_interesting("SELECT * FROM system_auth.users;"));
        assert!(is_interesting("LIST ALL PERMISSIONS OF bob;"));
        assert!(is_interesting("select name from SYSTEM_AUTH.USERS;"));
        assert!(!is_interesting("SELECT * FROM app.events;"));
        // Tenant keyspace that merely resembles a metadata name.
        assert!(!is_interesting("SELECT * FROM mysystem.t;"));
    }
}
