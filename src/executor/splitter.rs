//! Statement splitting
//!
//! Splits a script on `;` outside of quoted text and drops comments. Quoted
//! regions are `'...'`, `"..."` and `` `...` ``, plus dollar quotes
//! (`$$...$$`, `$tag$...$tag$`) where the dialect has them. A doubled quote
//! closes and reopens its region, which leaves the text intact either way.
//! Backslash escapes depend on the dialect, see [`SplitRules`].
//!
//! Triggers and stored routines carry `BEGIN ... END` bodies whose inner
//! statements end in `;`. Once a statement opens with
//! `CREATE ... TRIGGER|PROCEDURE|FUNCTION|EVENT`, the splitter counts
//! `BEGIN`/`CASE` against `END` and only splits at depth zero.

/// Dialect switches for [`split_statements_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitRules {
    /// `\` escapes the next character inside `'...'` and `"..."`
    pub backslash_escapes: bool,
    /// `\` escapes inside `E'...'` strings only
    pub escape_strings: bool,
    /// `$tag$ ... $tag$` bodies are opaque
    pub dollar_quotes: bool,
}

impl SplitRules {
    /// Standard quoting: no backslash escapes, no dollar quotes
    pub const STANDARD: Self = Self { backslash_escapes: false, escape_strings: false, dollar_quotes: false };
    pub const POSTGRES: Self = Self { backslash_escapes: false, escape_strings: true, dollar_quotes: true };
    pub const MYSQL: Self = Self { backslash_escapes: true, escape_strings: false, dollar_quotes: false };
}

/// Split `sql` into trimmed, non-empty statements using standard quoting
#[must_use]
pub fn split_statements(sql: &str) -> Vec<String> {
    split_statements_with(sql, SplitRules::STANDARD)
}

/// Split `sql` into trimmed, non-empty statements with comments removed
#[must_use]
pub fn split_statements_with(sql: &str, rules: SplitRules) -> Vec<String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut blocks = BlockDepth::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' => {
                let escapes = rules.backslash_escapes || (rules.escape_strings && escape_prefix(&chars, i));
                i = copy_quoted(&chars, i, escapes, &mut current);
            }
            '"' => i = copy_quoted(&chars, i, rules.backslash_escapes, &mut current),
            '`' => i = copy_quoted(&chars, i, false, &mut current),
            '$' if rules.dollar_quotes => match dollar_tag(&chars, i) {
                Some(tag) => i = copy_dollar_quoted(&chars, i, &tag, &mut current),
                None => {
                    current.push(c);
                    i += 1;
                }
            },
            '-' if chars.get(i + 1) == Some(&'-') => {
                // line comment: keep the newline so tokens stay separated
                match chars[i..].iter().position(|&ch| ch == '\n') {
                    Some(offset) => {
                        current.push('\n');
                        i += offset + 1;
                    }
                    None => i = chars.len(),
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let body = i + 2;
                i = chars[body..]
                    .windows(2)
                    .position(|pair| pair == ['*', '/'])
                    .map_or(chars.len(), |offset| body + offset + 2);
                current.push(' ');
            }
            ';' => {
                if blocks.at_boundary() {
                    push_statement(&mut statements, &mut current);
                    blocks = BlockDepth::default();
                } else {
                    current.push(c);
                }
                i += 1;
            }
            _ if starts_word(&chars, i) => {
                let len = chars[i..].iter().take_while(|&&ch| is_word_char(ch)).count();
                let word: String = chars[i..i + len].iter().collect();
                blocks.observe(&word);
                current.push_str(&word);
                i += len;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }
    push_statement(&mut statements, &mut current);

    statements
}

/// Tracks `BEGIN ... END` nesting inside trigger and routine definitions
#[derive(Debug, Default)]
struct BlockDepth {
    words: usize,
    definer_words: usize,
    head_done: bool,
    compound: bool,
    depth: usize,
    pending_end: bool,
}

impl BlockDepth {
    fn observe(&mut self, word: &str) {
        let word = word.to_ascii_uppercase();
        if !self.head_done {
            self.words += 1;
            let leading = match word.as_str() {
                "CREATE" => self.words == 1,
                "OR" | "REPLACE" | "TEMP" | "TEMPORARY" | "CONSTRAINT" => self.words > 1,
                "DEFINER" => {
                    // user and host may follow unquoted
                    self.definer_words = 2;
                    self.words > 1
                }
                "TRIGGER" | "PROCEDURE" | "FUNCTION" | "EVENT" if self.words > 1 => {
                    self.compound = true;
                    false
                }
                _ if self.definer_words > 0 => {
                    self.definer_words -= 1;
                    true
                }
                _ => false,
            };
            if !leading {
                self.head_done = true;
            }
            return;
        }
        if !self.compound {
            return;
        }

        if self.pending_end {
            self.pending_end = false;
            match word.as_str() {
                // END IF / END LOOP close blocks that never opened a level
                "IF" | "LOOP" | "WHILE" | "REPEAT" => return,
                "CASE" => {
                    self.close_block();
                    return;
                }
                _ => self.close_block(),
            }
        }

        match word.as_str() {
            "BEGIN" | "CASE" => self.depth += 1,
            "END" if self.depth > 0 => self.pending_end = true,
            _ => {}
        }
    }

    fn close_block(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Whether a `;` here ends the statement
    fn at_boundary(&mut self) -> bool {
        if self.pending_end {
            self.pending_end = false;
            self.close_block();
        }
        self.depth == 0
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn starts_word(chars: &[char], i: usize) -> bool {
    (chars[i].is_alphabetic() || chars[i] == '_') && (i == 0 || !is_word_char(chars[i - 1]))
}

/// `E'...'` opening at `quote`
fn escape_prefix(chars: &[char], quote: usize) -> bool {
    quote > 0
        && matches!(chars[quote - 1], 'E' | 'e')
        && (quote == 1 || !is_word_char(chars[quote - 2]))
}

/// Copy a quoted region starting at `start`; returns the index after it
fn copy_quoted(chars: &[char], start: usize, escapes: bool, out: &mut String) -> usize {
    let open = chars[start];
    out.push(open);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        if escapes && c == '\\' {
            if let Some(&escaped) = chars.get(i + 1) {
                out.push(escaped);
            }
            i += 2;
            continue;
        }
        i += 1;
        if c == open {
            return i;
        }
    }
    chars.len()
}

/// `$tag$` opening at `start`, if any. Tags follow identifier rules and a
/// `$` inside an identifier (`a$b`) never opens one.
fn dollar_tag(chars: &[char], start: usize) -> Option<Vec<char>> {
    if start > 0 && (chars[start - 1].is_alphanumeric() || chars[start - 1] == '_') {
        return None;
    }
    let body = start + 1;
    let len = chars[body..].iter().take_while(|c| c.is_alphanumeric() || **c == '_').count();
    if chars.get(body + len) != Some(&'$') || chars.get(body).is_some_and(char::is_ascii_digit) {
        return None;
    }
    Some(chars[start..=body + len].to_vec())
}

fn copy_dollar_quoted(chars: &[char], start: usize, tag: &[char], out: &mut String) -> usize {
    out.extend(tag);
    let mut i = start + tag.len();
    while i < chars.len() {
        if chars[i..].starts_with(tag) {
            out.extend(tag);
            return i + tag.len();
        }
        out.push(chars[i]);
        i += 1;
    }
    chars.len()
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_statement_is_unchanged() {
        assert_eq!(split_statements("SELECT 1"), vec!["SELECT 1"]);
        assert_eq!(split_statements("SELECT 1;"), vec!["SELECT 1"]);
        assert_eq!(split_statements(&split_statements("SELECT * FROM t")[0]), vec!["SELECT * FROM t"]);
    }

    #[test]
    fn test_semicolon_inside_literal() {
        assert_eq!(split_statements("INSERT INTO t VALUES ('a;b')"), vec!["INSERT INTO t VALUES ('a;b')"]);
    }

    #[test]
    fn test_multiple_statements() {
        let script = "CREATE TABLE t (id INT);\nINSERT INTO t VALUES (1);\n\nSELECT * FROM t;";
        assert_eq!(
            split_statements(script),
            vec!["CREATE TABLE t (id INT)", "INSERT INTO t VALUES (1)", "SELECT * FROM t"]
        );
    }

    #[test]
    fn test_quotes_of_other_kinds_do_not_toggle() {
        let sql = r#"SELECT 'it"s; fine', "col;'x", `we;ird` FROM t; SELECT 2"#;
        assert_eq!(
            split_statements(sql),
            vec![r#"SELECT 'it"s; fine', "col;'x", `we;ird` FROM t"#, "SELECT 2"]
        );
    }

    #[test]
    fn test_backslash_escape_in_mysql_literal() {
        let sql = r"INSERT INTO t VALUES ('a\';b'); SELECT 1";
        assert_eq!(split_statements_with(sql, SplitRules::MYSQL), vec![r"INSERT INTO t VALUES ('a\';b')", "SELECT 1"]);

        let sql = r#"SELECT "say \"hi\"; bye"; SELECT 2"#;
        assert_eq!(split_statements_with(sql, SplitRules::MYSQL), vec![r#"SELECT "say \"hi\"; bye""#, "SELECT 2"]);
    }

    #[test]
    fn test_backslash_is_literal_in_standard_strings() {
        let sql = r"SELECT 'C:\'; SELECT 2";
        assert_eq!(split_statements(sql), vec![r"SELECT 'C:\'", "SELECT 2"]);
        assert_eq!(split_statements_with(sql, SplitRules::POSTGRES), vec![r"SELECT 'C:\'", "SELECT 2"]);

        let sql = r#"SELECT "a\"; SELECT `b\`; SELECT 3"#;
        assert_eq!(split_statements(sql), vec![r#"SELECT "a\""#, r"SELECT `b\`", "SELECT 3"]);
        assert_eq!(split_statements_with(r"SELECT `b\`; SELECT 3", SplitRules::MYSQL), vec![r"SELECT `b\`", "SELECT 3"]);
    }

    #[test]
    fn test_postgres_escape_strings() {
        let sql = r"SELECT E'it\'s;'; SELECT 2";
        assert_eq!(split_statements_with(sql, SplitRules::POSTGRES), vec![r"SELECT E'it\'s;'", "SELECT 2"]);

        // a trailing E on an identifier is not a prefix
        let sql = r"SELECT note'\'; SELECT 2";
        assert_eq!(split_statements_with(sql, SplitRules::POSTGRES), vec![r"SELECT note'\'", "SELECT 2"]);
    }

    #[test]
    fn test_doubled_quote_in_literal() {
        let sql = "INSERT INTO t VALUES ('O''Brien;'); SELECT 1";
        assert_eq!(split_statements(sql), vec!["INSERT INTO t VALUES ('O''Brien;')", "SELECT 1"]);
    }

    #[test]
    fn test_comments_are_stripped() {
        let sql = "-- header; with semicolon\nSELECT 1; /* block; comment */ SELECT /*inline*/2 -- trailing";
        assert_eq!(split_statements(sql), vec!["SELECT 1", "SELECT  2"]);
    }

    #[test]
    fn test_comment_markers_inside_literals_are_kept() {
        let sql = "SELECT '--not a comment', '/* nor this */'";
        assert_eq!(split_statements(sql), vec![sql]);
    }

    #[test]
    fn test_empty_statements_dropped() {
        assert!(split_statements("").is_empty());
        assert!(split_statements(" ;; \n ; -- only a comment").is_empty());
        assert_eq!(split_statements(";;SELECT 1;;"), vec!["SELECT 1"]);
    }

    #[test]
    fn test_dollar_quoted_bodies() {
        let body = "CREATE FUNCTION one() RETURNS int AS $$ BEGIN RETURN 1; END; $$ LANGUAGE plpgsql";
        let script = format!("{body}; SELECT one()");
        assert_eq!(split_statements_with(&script, SplitRules::POSTGRES), vec![body, "SELECT one()"]);

        let tagged = "DO $fn$ BEGIN PERFORM 'x;y'; END $fn$";
        assert_eq!(split_statements_with(tagged, SplitRules::POSTGRES), vec![tagged]);
    }

    #[test]
    fn test_dollar_outside_tags() {
        let sql = "SELECT $1; SELECT a$b$ FROM t";
        assert_eq!(split_statements_with(sql, SplitRules::POSTGRES), vec!["SELECT $1", "SELECT a$b$ FROM t"]);
    }

    #[test]
    fn test_dollar_is_plain_text_without_dollar_quotes() {
        assert_eq!(split_statements("SELECT '$a$'; SELECT $a$;"), vec!["SELECT '$a$'", "SELECT $a$"]);
    }

    #[test]
    fn test_trigger_body_is_one_statement() {
        let trigger = "CREATE TRIGGER users_touch AFTER INSERT ON users BEGIN SELECT 1; UPDATE t SET n = n + 1; END";
        let script = format!("DROP TRIGGER users_touch; {trigger}; SELECT 2");
        assert_eq!(split_statements(&script), vec!["DROP TRIGGER users_touch", trigger, "SELECT 2"]);

        let temp = "create temp trigger t2 before delete on users begin select raise(abort, 'no;'); end";
        assert_eq!(split_statements(&format!("{temp};")), vec![temp]);
    }

    #[test]
    fn test_case_inside_trigger_body() {
        let trigger = "CREATE TRIGGER tr AFTER UPDATE ON t BEGIN \
                       UPDATE t SET flag = CASE WHEN new.n > 0 THEN 1 ELSE 0 END WHERE id = new.id; \
                       SELECT 1; END";
        assert_eq!(split_statements(&format!("{trigger}; SELECT 2")), vec![trigger, "SELECT 2"]);
    }

    #[test]
    fn test_mysql_routine_bodies() {
        let procedure = "CREATE DEFINER=`root`@`%` PROCEDURE bump(IN n INT) BEGIN \
                         IF n > 0 THEN UPDATE t SET c = c + n; END IF; \
                         WHILE n > 0 DO SET n = n - 1; END WHILE; \
                         CASE n WHEN 0 THEN SELECT 'zero'; ELSE SELECT 'other'; END CASE; \
                         inner_block: BEGIN SELECT 1; END inner_block; END";
        let script = format!("DROP PROCEDURE bump; {procedure}; CALL bump(1)");
        assert_eq!(
            split_statements_with(&script, SplitRules::MYSQL),
            vec!["DROP PROCEDURE bump", procedure, "CALL bump(1)"]
        );

        let definer = "CREATE DEFINER = root@localhost TRIGGER tr BEFORE INSERT ON t FOR EACH ROW BEGIN SET NEW.a = 1; END";
        assert_eq!(split_statements_with(&format!("{definer}; SELECT 1"), SplitRules::MYSQL), vec![definer, "SELECT 1"]);
    }

    #[test]
    fn test_block_words_outside_routines_do_not_nest() {
        let sql = "BEGIN; CREATE TABLE log (event TEXT, begin INT); SELECT CASE WHEN 1 THEN 2 END; COMMIT";
        assert_eq!(
            split_statements(sql),
            vec!["BEGIN", "CREATE TABLE log (event TEXT, begin INT)", "SELECT CASE WHEN 1 THEN 2 END", "COMMIT"]
        );

        // single-statement trigger without a block
        let sql = "CREATE TRIGGER tr BEFORE INSERT ON t FOR EACH ROW SET NEW.a = 1; SELECT 1";
        assert_eq!(
            split_statements_with(sql, SplitRules::MYSQL),
            vec!["CREATE TRIGGER tr BEFORE INSERT ON t FOR EACH ROW SET NEW.a = 1", "SELECT 1"]
        );
    }

    #[test]
    fn test_trigger_keywords_inside_comments_and_literals() {
        let trigger = "CREATE TRIGGER tr AFTER INSERT ON t BEGIN SELECT 'end;'; \n END";
        let script = "CREATE TRIGGER tr AFTER INSERT ON t BEGIN SELECT 'end;'; -- end;\n END; SELECT 2";
        assert_eq!(split_statements(script), vec![trigger, "SELECT 2"]);
    }

    #[test]
    fn test_unterminated_block_comment() {
        assert_eq!(split_statements("SELECT 1; /* never closed; SELECT 2"), vec!["SELECT 1"]);
    }
}
