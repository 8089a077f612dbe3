//! Injection-safe construction of FTS5 `MATCH` expressions.
//!
//! User input never reaches SQLite as raw syntax. Every term is reduced to
//! letters, digits, `_` and `-`, then emitted as a double-quoted FTS5 string,
//! so operators, column filters and special characters in the input are inert.
//!
//! Shape of the generated expression:
//!
//! ```text
//! {title content} : (("refund"* "policy"*) NOT "draft") AND tenant_id : "t1"
//! ```
//!
//! - plain words become prefix terms (`"word"*`)
//! - `-word` becomes an exclusion (`NOT "word"`)
//! - embedded wildcards move to the end (`re*und` -> `"reund"*`)
//! - balanced `"quoted phrases"` stay exact phrases; unbalanced quotes are dropped
//! - the tenant filter goes through the same quoting path as user terms

use crate::config::{MAX_QUERY_CHARS, MAX_QUERY_TERMS, MAX_TENANT_ID_LEN, MAX_TERM_CHARS};
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Sequences that only appear in statement injection attempts.
const CONTROL_SEQUENCES: [&str; 4] = ["--", ";", "/*", "*/"];

/// Statement keywords stripped from queries when they appear as whole tokens.
static SQL_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "EXEC", "UNION", "SELECT",
        "FROM",
    ]
    .into_iter()
    .collect()
});

/// Columns user terms are matched against.
const SEARCH_COLUMNS: &str = "{title content}";

/// Column holding the tenant id in the FTS table.
const TENANT_COLUMN: &str = "tenant_id";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Phrase(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Prefix(String),
    Phrase(String),
    Exclude(String),
}

/// Checks a tenant id against `^[a-zA-Z0-9_-]+$` with a bounded length.
///
/// At least one letter or digit is required: `_` and `-` are separators to
/// the tokenizer, and the tenant filter needs a token to match on.
pub fn is_valid_tenant_id(tenant_id: &str) -> bool {
    tenant_id.len() <= MAX_TENANT_ID_LEN
        && tenant_id.bytes().any(|b| b.is_ascii_alphanumeric())
        && tenant_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Builds the user part of a `MATCH` expression.
///
/// Returns `None` when nothing safe and positive remains, in which case the
/// caller answers with an empty result instead of running a query.
pub fn build_match_expression(raw: &str) -> Option<String> {
    let truncated: String = raw.chars().take(MAX_QUERY_CHARS).collect();

    if CONTROL_SEQUENCES.iter().any(|seq| truncated.contains(seq)) {
        return None;
    }

    let mut terms = Vec::new();
    for token in tokenize(&truncated) {
        if terms.len() >= MAX_QUERY_TERMS {
            break;
        }
        if let Some(term) = to_term(token) {
            terms.push(term);
        }
    }

    let positives: Vec<String> = terms
        .iter()
        .filter_map(|t| match t {
            Term::Prefix(word) => Some(format!("{}*", quote(word))),
            Term::Phrase(phrase) => Some(quote(phrase)),
            Term::Exclude(_) => None,
        })
        .collect();

    // FTS5 NOT is binary; a query of only exclusions has nothing to subtract from.
    if positives.is_empty() {
        return None;
    }

    let mut expr = format!("({})", positives.join(" "));
    for term in &terms {
        if let Term::Exclude(word) = term {
            expr.push_str(" NOT ");
            expr.push_str(&quote(word));
        }
    }

    Some(format!("{} : ({})", SEARCH_COLUMNS, expr))
}

/// Scopes a match expression to one tenant.
///
/// The tenant id must already have passed [`is_valid_tenant_id`].
pub fn scope_to_tenant(expression: &str, tenant_id: &str) -> String {
    format!(
        "{} AND {} : {}",
        expression,
        TENANT_COLUMN,
        quote(&sanitize_term(tenant_id))
    )
}

/// Keeps letters, digits, `_` and `-`.
fn sanitize_term(term: &str) -> String {
    term.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

fn is_sql_keyword(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    SQL_KEYWORDS.contains(upper.as_str()) || upper.starts_with("XP_") || upper.starts_with("SP_")
}

fn quote(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

/// Splits on whitespace, keeping balanced double-quoted spans together.
fn tokenize(text: &str) -> Vec<Token> {
    let balanced = text.matches('"').count() % 2 == 0;
    let text = if balanced {
        text.to_string()
    } else {
        text.replace('"', " ")
    };

    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let phrase: String = chars.by_ref().take_while(|&c| c != '"').collect();
            tokens.push(Token::Phrase(phrase));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == '"' {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }
    tokens
}

fn to_term(token: Token) -> Option<Term> {
    match token {
        Token::Word(word) => {
            if word.chars().count() > MAX_TERM_CHARS {
                return None;
            }
            let (negated, body) = match word.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, word.as_str()),
            };
            if is_sql_keyword(body) {
                return None;
            }
            let clean = sanitize_term(body);
            if clean.is_empty() {
                return None;
            }
            if negated {
                Some(Term::Exclude(clean))
            } else {
                Some(Term::Prefix(clean))
            }
        }
        Token::Phrase(phrase) => {
            let words: Vec<String> = phrase
                .split_whitespace()
                .filter(|w| w.chars().count() <= MAX_TERM_CHARS && !is_sql_keyword(w))
                .map(sanitize_term)
                .filter(|w| !w.is_empty())
                .collect();
            if words.is_empty() {
                None
            } else {
                Some(Term::Phrase(words.join(" ")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_become_prefix_terms() {
        assert_eq!(
            build_match_expression("refund policy").unwrap(),
            r#"{title content} : (("refund"* "policy"*))"#
        );
    }

    #[test]
    fn test_wildcards_move_to_the_end() {
        assert_eq!(
            build_match_expression("*ref*und").unwrap(),
            r#"{title content} : (("refund"*))"#
        );
    }

    #[test]
    fn test_negation() {
        assert_eq!(
            build_match_expression("policy -draft").unwrap(),
            r#"{title content} : (("policy"*) NOT "draft")"#
        );
        // Exclusions alone have nothing to subtract from
        assert!(build_match_expression("-draft -old").is_none());
    }

    #[test]
    fn test_phrases() {
        assert_eq!(
            build_match_expression(r#""refund policy" fast"#).unwrap(),
            r#"{title content} : (("refund policy" "fast"*))"#
        );
        // Unbalanced quote is dropped, words survive
        assert_eq!(
            build_match_expression(r#"refund "policy"#).unwrap(),
            r#"{title content} : (("refund"* "policy"*))"#
        );
    }

    #[test]
    fn test_injection_degrades_to_none() {
        assert!(build_match_expression("; DROP TABLE x; --").is_none());
        assert!(build_match_expression("refund /* comment */").is_none());
        assert!(build_match_expression("DROP SELECT").is_none());
    }

    #[test]
    fn test_keywords_are_stripped_per_token() {
        assert_eq!(
            build_match_expression("select fromage").unwrap(),
            r#"{title content} : (("fromage"*))"#
        );
        assert!(build_match_expression("xp_cmdshell").is_none());
    }

    #[test]
    fn test_fts_syntax_is_neutralized() {
        // Column filters, operators and parentheses lose their meaning
        let expr = build_match_expression("tenant_id:t2 OR (a)").unwrap();
        assert_eq!(
            expr,
            r#"{title content} : (("tenant_idt2"* "OR"* "a"*))"#
        );
    }

    #[test]
    fn test_term_limits() {
        let long = "x".repeat(MAX_TERM_CHARS + 1);
        assert!(build_match_expression(&long).is_none());

        let many: Vec<String> = (0..50).map(|i| format!("w{}", i)).collect();
        let expr = build_match_expression(&many.join(" ")).unwrap();
        assert_eq!(expr.matches('*').count(), MAX_QUERY_TERMS);
        assert!(expr.contains("\"w19\"*"));
        assert!(!expr.contains("\"w20\""));
    }

    #[test]
    fn test_long_query_is_truncated_not_rejected() {
        let query = format!("refund {}", "a ".repeat(MAX_QUERY_CHARS));
        assert!(build_match_expression(&query).is_some());
    }

    #[test]
    fn test_tenant_validation() {
        assert!(is_valid_tenant_id("t1"));
        assert!(is_valid_tenant_id("acme-co_2"));
        assert!(!is_valid_tenant_id(""));
        assert!(!is_valid_tenant_id("t1\" OR \"t2"));
        assert!(!is_valid_tenant_id("t 1"));
        assert!(!is_valid_tenant_id(&"a".repeat(MAX_TENANT_ID_LEN + 1)));
        // Separators alone tokenize to nothing
        assert!(!is_valid_tenant_id("___"));
        assert!(!is_valid_tenant_id("--"));
        assert!(!is_valid_tenant_id("-_-"));
        assert!(is_valid_tenant_id("_a"));
    }

    #[test]
    fn test_scope_to_tenant() {
        let expr = build_match_expression("refund").unwrap();
        assert_eq!(
            scope_to_tenant(&expr, "t1"),
            r#"{title content} : (("refund"*)) AND tenant_id : "t1""#
        );
    }
}
