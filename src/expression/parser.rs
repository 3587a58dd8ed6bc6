use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// 表达式解析结果：引用到的列名（按出现顺序去重）与合法性
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedExpression {
    pub columns: Vec<String>,
    pub is_valid: bool,
    pub error: Option<String>,
}

impl ParsedExpression {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            columns: Vec::new(),
            is_valid: false,
            error: Some(message.into()),
        }
    }

    /// 不在 available 里的列（大小写不敏感，忽略 `*`）
    pub fn missing_columns<'a>(&self, available: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let known: HashSet<String> = available
            .into_iter()
            .map(|c| c.to_ascii_lowercase())
            .collect();
        self.columns
            .iter()
            .filter(|c| c.as_str() != "*" && !known.contains(&c.to_ascii_lowercase()))
            .cloned()
            .collect()
    }
}

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "null", "case", "when", "then", "else", "end", "as", "distinct", "in",
    "is", "like", "ilike", "between", "true", "false", "filter", "where", "over", "partition",
    "by", "order", "asc", "desc", "interval", "all", "any", "escape", "collate", "nulls",
    "first", "last",
];

const TYPE_NAMES: &[&str] = &[
    "integer", "int", "bigint", "smallint", "double", "real", "float", "text", "varchar",
    "char", "date", "time", "timestamp", "boolean", "bool", "numeric", "decimal", "blob",
];

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\d+(?:\.\d+)?(?:[eE][+-]?\d+)?|[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*|\*|\(",
        )
        .unwrap()
    })
}

fn is_reserved(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    KEYWORDS.contains(&lower.as_str()) || TYPE_NAMES.contains(&lower.as_str())
}

/// 把字符串字面量抹成空格，双引号标识符换成占位符，返回处理后的文本和被引用的标识符
fn strip_literals(expr: &str) -> Result<(String, Vec<String>), String> {
    let mut out = String::with_capacity(expr.len());
    let mut quoted = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\'' | '"' => {
                let mut body = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == ch {
                        // 连续两个引号是转义
                        if chars.peek() == Some(&ch) {
                            chars.next();
                            body.push(c);
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    body.push(c);
                }
                if !closed {
                    return Err(if ch == '\'' {
                        "unterminated string literal".to_string()
                    } else {
                        "unterminated quoted identifier".to_string()
                    });
                }
                if ch == '"' {
                    out.push_str(&format!(" __quoted_{}__ ", quoted.len()));
                    quoted.push(body);
                } else {
                    out.push(' ');
                }
            }
            _ => out.push(ch),
        }
    }
    Ok((out, quoted))
}

fn paren_balanced(s: &str) -> bool {
    let mut depth = 0i32;
    for ch in s.chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// 解析 measure 表达式，提取其中引用的列名。
///
/// 函数名（标识符后紧跟 `(`）、SQL 关键字和类型名不算列；
/// 限定名 `t.col` 只取最后一段；`*` 只在紧跟 `(` 时记录。
pub fn parse_expression(expr: &str) -> ParsedExpression {
    let expr = expr.trim();
    if expr.is_empty() {
        return ParsedExpression::invalid("expression is empty");
    }

    let (stripped, quoted) = match strip_literals(expr) {
        Ok(v) => v,
        Err(msg) => return ParsedExpression::invalid(msg),
    };
    if !paren_balanced(&stripped) {
        return ParsedExpression::invalid("unbalanced parentheses");
    }

    let mut columns: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |name: String| {
        if seen.insert(name.to_ascii_lowercase()) {
            columns.push(name);
        }
    };

    let mut prev_open = false;
    for m in token_re().find_iter(&stripped) {
        let token = m.as_str();
        let first = token.chars().next().unwrap_or(' ');

        if token == "(" {
            prev_open = true;
            continue;
        }
        if token == "*" {
            if prev_open {
                push("*".to_string());
            }
            prev_open = false;
            continue;
        }
        prev_open = false;
        if first.is_ascii_digit() {
            continue;
        }

        let is_call = stripped[m.end()..].trim_start().starts_with('(');
        if is_call || is_reserved(token) {
            continue;
        }

        let last = token.rsplit('.').next().unwrap_or(token);
        let name = last
            .strip_prefix("__quoted_")
            .and_then(|rest| rest.strip_suffix("__"))
            .and_then(|idx| idx.parse::<usize>().ok())
            .and_then(|idx| quoted.get(idx).cloned())
            .unwrap_or_else(|| last.to_string());
        push(name);
    }

    ParsedExpression {
        columns,
        is_valid: true,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_aggregate() {
        let parsed = parse_expression("sum(nonexistent_col)");
        assert!(parsed.is_valid);
        assert_eq!(parsed.columns, vec!["nonexistent_col"]);
        assert_eq!(
            parsed.missing_columns(["impressions", "publisher"]),
            vec!["nonexistent_col"]
        );
    }

    #[test]
    fn test_count_star_is_ignored_when_checking() {
        let parsed = parse_expression("count(*)");
        assert_eq!(parsed.columns, vec!["*"]);
        assert!(parsed.missing_columns(Vec::<&str>::new()).is_empty());

        let parsed = parse_expression("avg(price) * 2");
        assert_eq!(parsed.columns, vec!["price"]);
    }

    #[test]
    fn test_keywords_literals_and_types() {
        let parsed = parse_expression(
            "sum(CASE WHEN status = 'done' THEN 1 ELSE 0 END) / count(DISTINCT User_Id)",
        );
        assert_eq!(parsed.columns, vec!["status", "User_Id"]);

        let parsed = parse_expression("sum(CAST(bid_price AS INTEGER)) + 1e3");
        assert_eq!(parsed.columns, vec!["bid_price"]);
        assert!(parsed.missing_columns(["BID_PRICE"]).is_empty());
    }

    #[test]
    fn test_quoted_and_qualified_names() {
        let parsed = parse_expression(r#"sum("Gross Revenue") - sum(t.cost) + max(cost)"#);
        assert_eq!(parsed.columns, vec!["Gross Revenue", "cost"]);
    }

    #[test]
    fn test_invalid_expressions() {
        assert_eq!(
            parse_expression("   ").error.as_deref(),
            Some("expression is empty")
        );
        let parsed = parse_expression("sum(a");
        assert!(!parsed.is_valid);
        assert_eq!(parsed.error.as_deref(), Some("unbalanced parentheses"));
        assert!(!parse_expression("count(x))").is_valid);
        assert_eq!(
            parse_expression("sum(a) where b = 'x").error.as_deref(),
            Some("unterminated string literal")
        );
        // 括号出现在字符串里不影响配平
        assert!(parse_expression("count(CASE WHEN name = ')' THEN 1 END)").is_valid);
    }
}
