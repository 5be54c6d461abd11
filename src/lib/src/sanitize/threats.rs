//! Injection neutralization for metadata strings
//!
//! Four passes run in a fixed order on every string:
//!
//! 1. markup/script injection substrings are removed
//! 2. `< > " '` are HTML-entity encoded
//! 3. SQL metacharacters, comment markers, DDL/DML keywords and
//!    stored-procedure prefixes are removed
//! 4. shell metacharacters, command substitutions and destructive verbs are
//!    removed
//!
//! The passes repeat until the string stops changing, so removals cannot
//! splice a new threat together (`<scr<scriptipt>`).

use regex::Regex;
use std::borrow::Cow;
use std::sync::LazyLock;

/// Passes applied before giving up on a string that keeps changing.
const MAX_ROUNDS: usize = 16;

static MARKUP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)<\s*/?\s*script",
        r"(?i)javascript\s*:",
        r"(?i)vbscript\s*:",
        r"(?i)data\s*:\s*text/html",
        r"(?i)<\s*/?\s*iframe",
        r"(?i)<\s*/?\s*object",
        r"(?i)<\s*/?\s*embed",
        r"(?i)\bon[a-z]+\s*=",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid markup pattern"))
    .collect()
});

static SQL_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:select|insert|update|delete|drop|create|alter|truncate|union|exec|execute|grant|revoke|merge|declare)\b",
    )
    .expect("invalid SQL keyword pattern")
});

static SQL_PROCEDURE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:xp|sp)_\w*").expect("invalid stored procedure pattern")
});

static SHELL_VERBS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:rm|rmdir|mkfs(?:\.\w+)?|dd|shred|shutdown|reboot|halt|poweroff|killall|chmod|chown)\b",
    )
    .expect("invalid shell verb pattern")
});

/// Literal sequences removed by the SQL pass
const SQL_SEQUENCES: &[&str] = &["--", "/*", "*/", "'", "\"", ";"];

/// Literal sequences removed by the shell pass
const SHELL_SEQUENCES: &[&str] = &["$(", "${", "`", "|", "&", ";"];

/// Which catalogue a surviving threat belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatKind {
    Markup,
    Sql,
    Shell,
}

fn remove_all<'a>(input: Cow<'a, str>, pattern: &Regex) -> Cow<'a, str> {
    if pattern.is_match(&input) {
        Cow::Owned(pattern.replace_all(&input, "").into_owned())
    } else {
        input
    }
}

fn remove_sequences<'a>(input: Cow<'a, str>, sequences: &[&str]) -> Cow<'a, str> {
    if !sequences.iter().any(|s| input.contains(s)) {
        return input;
    }
    let mut out = input.into_owned();
    for seq in sequences {
        out = out.replace(seq, "");
    }
    Cow::Owned(out)
}

fn strip_markup(input: &str) -> Cow<'_, str> {
    MARKUP_PATTERNS
        .iter()
        .fold(Cow::Borrowed(input), |acc, pattern| remove_all(acc, pattern))
}

/// HTML-entity encode `< > " '`.
pub fn encode_entities(input: &str) -> Cow<'_, str> {
    if !input.contains(['<', '>', '"', '\'']) {
        return Cow::Borrowed(input);
    }
    let mut out = String::with_capacity(input.len() + 16);
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn strip_sql(input: &str) -> Cow<'_, str> {
    let out = remove_sequences(Cow::Borrowed(input), SQL_SEQUENCES);
    let out = remove_all(out, &SQL_KEYWORDS);
    remove_all(out, &SQL_PROCEDURE_PREFIX)
}

fn strip_shell(input: &str) -> Cow<'_, str> {
    let out = remove_sequences(Cow::Borrowed(input), SHELL_SEQUENCES);
    remove_all(out, &SHELL_VERBS)
}

fn single_round(input: &str) -> String {
    let markup = strip_markup(input);
    let encoded = encode_entities(&markup);
    let sql = strip_sql(&encoded);
    strip_shell(&sql).into_owned()
}

/// Run all passes to a fixed point.
///
/// Returns `None` if the string was still changing after the round limit.
pub fn neutralize(input: &str) -> Option<String> {
    let mut current = input.to_string();
    for _ in 0..MAX_ROUNDS {
        let next = single_round(&current);
        if next == current {
            return Some(current);
        }
        current = next;
    }
    None
}

/// First threat still present in `input`, if any.
pub fn find_threat(input: &str) -> Option<ThreatKind> {
    if MARKUP_PATTERNS.iter().any(|p| p.is_match(input)) || input.contains(['<', '>']) {
        return Some(ThreatKind::Markup);
    }
    if SQL_SEQUENCES.iter().any(|s| input.contains(s))
        || SQL_KEYWORDS.is_match(input)
        || SQL_PROCEDURE_PREFIX.is_match(input)
    {
        return Some(ThreatKind::Sql);
    }
    if SHELL_SEQUENCES.iter().any(|s| input.contains(s)) || SHELL_VERBS.is_match(input) {
        return Some(ThreatKind::Shell);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_unchanged() {
        assert_eq!(neutralize("Sunset over the bay").unwrap(), "Sunset over the bay");
        assert_eq!(neutralize("Created 2026-01-01").unwrap(), "Created 2026-01-01");
        assert!(matches!(strip_markup("plain"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_script_removed() {
        let out = neutralize("<script>alert(1)</script>").unwrap();
        assert!(!out.to_lowercase().contains("script"));
        assert!(find_threat(&out).is_none());
    }

    #[test]
    fn test_spliced_script_removed() {
        let out = neutralize("<scr<scriptipt>alert(1)").unwrap();
        assert!(!out.to_lowercase().contains("<script"));
        assert!(find_threat(&out).is_none());
    }

    #[test]
    fn test_event_handler_removed() {
        let out = neutralize("<img src=x OnError=alert(1)>").unwrap();
        assert!(!out.to_lowercase().contains("onerror"));
        assert!(find_threat(&out).is_none());
    }

    #[test]
    fn test_entity_encoding() {
        assert_eq!(encode_entities("a<b>\"c'"), "a&lt;b&gt;&quot;c&#x27;");
    }

    #[test]
    fn test_sql_removed() {
        let out = neutralize("x'; DROP TABLE users; --").unwrap();
        assert!(!out.to_lowercase().contains("drop"));
        assert!(!out.contains("--"));
        assert!(!out.contains(';'));
        assert!(find_threat(&out).is_none());

        let out = neutralize("EXEC xp_cmdshell 'dir'").unwrap();
        assert!(!out.to_lowercase().contains("xp_"));
    }

    #[test]
    fn test_shell_removed() {
        let out = neutralize("photo $(rm -rf /)`id` | nc host & ").unwrap();
        for needle in ["$(", "`", "|", "&", "rm "] {
            assert!(!out.contains(needle), "{needle} survived in {out}");
        }
        assert!(find_threat(&out).is_none());
    }

    #[test]
    fn test_find_threat_categories() {
        assert_eq!(find_threat("<iframe src=x>"), Some(ThreatKind::Markup));
        assert_eq!(find_threat("1 UNION SELECT"), Some(ThreatKind::Sql));
        assert_eq!(find_threat("a | b"), Some(ThreatKind::Shell));
        assert_eq!(find_threat("Canon EOS R5"), None);
    }
}
