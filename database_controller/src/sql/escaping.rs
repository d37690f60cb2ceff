//! Quoting for statements that cannot use bind parameters (identifiers, DDL, and
//! `CREATE USER ... PASSWORD` which neither engine accepts as a placeholder).

pub trait Escaping {
    /// Mimics Postgres `quote_ident()`, but always quotes.
    /// **Not idempotent**: an already quoted string is quoted again.
    fn pg_quote(&self) -> String;

    /// Backtick-quoted MySQL identifier.
    fn mysql_quote(&self) -> String;
}

impl Escaping for str {
    fn pg_quote(&self) -> String {
        format!("\"{}\"", self.replace('"', "\"\""))
    }

    fn mysql_quote(&self) -> String {
        format!("`{}`", self.replace('`', "``"))
    }
}

/// Postgres string literal, switching to the `E''` form when backslashes are present.
pub fn escape_literal(s: &str) -> String {
    let res = s.replace('\'', "''").replace('\\', "\\\\");

    if res.contains('\\') {
        format!("E'{res}'")
    } else {
        format!("'{res}'")
    }
}

/// MySQL string literal. Safe regardless of `NO_BACKSLASH_ESCAPES`.
pub fn mysql_escape_literal(s: &str) -> String {
    let mut res = String::with_capacity(s.len() + 2);
    res.push('\'');
    for c in s.chars() {
        match c {
            '\'' => res.push_str("''"),
            '\\' => res.push_str("\\\\"),
            '\0' => res.push_str("\\0"),
            '\n' => res.push_str("\\n"),
            '\r' => res.push_str("\\r"),
            _ => res.push(c),
        }
    }
    res.push('\'');
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert_eq!("cloud_inst-a".pg_quote(), "\"cloud_inst-a\"");
        assert_eq!("we\"ird".pg_quote(), "\"we\"\"ird\"");
        assert_eq!("cloud_inst-a".mysql_quote(), "`cloud_inst-a`");
        assert_eq!("we`ird".mysql_quote(), "`we``ird`");
    }

    #[test]
    fn literals() {
        assert_eq!(escape_literal("abc"), "'abc'");
        assert_eq!(escape_literal("it's"), "'it''s'");
        assert_eq!(escape_literal("a\\b"), "E'a\\\\b'");
        assert_eq!(mysql_escape_literal("it's\\"), "'it''s\\\\'");
    }
}
