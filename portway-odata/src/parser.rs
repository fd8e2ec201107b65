use crate::lexer::{Token, lex};
use crate::{ODataError, SqlValue};

/// Comparison operators of the supported subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }

    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "eq" => Some(CompareOp::Eq),
            "ne" => Some(CompareOp::Ne),
            "gt" => Some(CompareOp::Gt),
            "ge" => Some(CompareOp::Ge),
            "lt" => Some(CompareOp::Lt),
            "le" => Some(CompareOp::Le),
            _ => None,
        }
    }
}

/// String functions of the supported subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFn {
    Contains,
    StartsWith,
    EndsWith,
}

impl StringFn {
    fn from_ident(ident: &str) -> Option<Self> {
        match ident {
            "contains" => Some(StringFn::Contains),
            "startswith" => Some(StringFn::StartsWith),
            "endswith" => Some(StringFn::EndsWith),
            _ => None,
        }
    }
}

/// Parsed `$filter` expression tree. Fields are still aliases here;
/// resolution happens at emission.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Compare {
        field: String,
        op: CompareOp,
        value: SqlValue,
    },
    Function {
        func: StringFn,
        field: String,
        value: String,
    },
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
}

/// One `$orderby` item, field still an alias.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub field: String,
    pub descending: bool,
}

fn syntax(message: impl Into<String>) -> ODataError {
    ODataError::Syntax {
        clause: "$filter",
        message: message.into(),
    }
}

/// Parse a `$filter` expression.
///
/// Precedence: `not` binds tightest, then `and`, then `or`; parentheses
/// override.
pub fn parse_filter(input: &str) -> Result<FilterExpr, ODataError> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(syntax(format!(
            "unexpected trailing {}",
            parser.tokens[parser.pos].describe()
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ODataError> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(syntax(format!("expected {what}, found {}", token.describe()))),
            None => Err(syntax(format!("expected {what}, found end of input"))),
        }
    }

    fn parse_or(&mut self) -> Result<FilterExpr, ODataError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Ident(id)) if id == "or") {
            self.next();
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr, ODataError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::Ident(id)) if id == "and") {
            self.next();
            let right = self.parse_unary()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterExpr, ODataError> {
        if matches!(self.peek(), Some(Token::Ident(id)) if id == "not") {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<FilterExpr, ODataError> {
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Some(Token::Ident(ident)) => {
                if let Some(func) = StringFn::from_ident(&ident) {
                    return self.parse_function(func);
                }
                self.parse_comparison(ident)
            }
            Some(token) => Err(syntax(format!("expected expression, found {}", token.describe()))),
            None => Err(syntax("expected expression, found end of input")),
        }
    }

    fn parse_function(&mut self, func: StringFn) -> Result<FilterExpr, ODataError> {
        self.expect(&Token::LParen, "'('")?;
        let field = match self.next() {
            Some(Token::Ident(field)) => field,
            Some(token) => return Err(syntax(format!("expected field name, found {}", token.describe()))),
            None => return Err(syntax("expected field name, found end of input")),
        };
        self.expect(&Token::Comma, "','")?;
        let value = match self.next() {
            Some(Token::Str(value)) => value,
            Some(token) => {
                return Err(syntax(format!(
                    "string functions take a string literal, found {}",
                    token.describe()
                )));
            }
            None => return Err(syntax("expected string literal, found end of input")),
        };
        self.expect(&Token::RParen, "')'")?;
        Ok(FilterExpr::Function { func, field, value })
    }

    fn parse_comparison(&mut self, field: String) -> Result<FilterExpr, ODataError> {
        let op = match self.next() {
            Some(Token::Ident(ident)) => CompareOp::from_ident(&ident)
                .ok_or_else(|| syntax(format!("unknown operator '{ident}'")))?,
            Some(token) => return Err(syntax(format!("expected operator, found {}", token.describe()))),
            None => return Err(syntax("expected operator, found end of input")),
        };
        let value = match self.next() {
            Some(Token::Str(s)) => SqlValue::String(s),
            Some(Token::Int(n)) => SqlValue::I64(n),
            Some(Token::Float(f)) => SqlValue::F64(f),
            Some(Token::Bool(b)) => SqlValue::Bool(b),
            Some(Token::Null) => SqlValue::Null,
            Some(Token::Guid(g)) => SqlValue::Guid(g),
            Some(Token::Date(d)) => SqlValue::Date(d),
            Some(Token::DateTime(dt)) => SqlValue::DateTime(dt),
            Some(token) => return Err(syntax(format!("expected literal, found {}", token.describe()))),
            None => return Err(syntax("expected literal, found end of input")),
        };
        if value == SqlValue::Null && !matches!(op, CompareOp::Eq | CompareOp::Ne) {
            return Err(syntax("null only supports eq/ne"));
        }
        Ok(FilterExpr::Compare { field, op, value })
    }
}

/// Parse a `$select` list into its aliases.
pub fn parse_select(input: &str) -> Result<Vec<String>, ODataError> {
    let aliases: Vec<String> = input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();
    if aliases.is_empty() {
        return Err(ODataError::Syntax {
            clause: "$select",
            message: "empty select list".into(),
        });
    }
    Ok(aliases)
}

/// Parse an `$orderby` list (`alias [asc|desc]`, default ascending).
pub fn parse_orderby(input: &str) -> Result<Vec<OrderByItem>, ODataError> {
    let mut items = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut words = part.split_whitespace();
        let field = words
            .next()
            .ok_or_else(|| ODataError::Syntax {
                clause: "$orderby",
                message: "missing field".into(),
            })?
            .to_string();
        let descending = match words.next() {
            None => false,
            Some(dir) if dir.eq_ignore_ascii_case("asc") => false,
            Some(dir) if dir.eq_ignore_ascii_case("desc") => true,
            Some(dir) => {
                return Err(ODataError::Syntax {
                    clause: "$orderby",
                    message: format!("unknown direction '{dir}'"),
                });
            }
        };
        if words.next().is_some() {
            return Err(ODataError::Syntax {
                clause: "$orderby",
                message: format!("too many words in '{part}'"),
            });
        }
        items.push(OrderByItem { field, descending });
    }
    if items.is_empty() {
        return Err(ODataError::Syntax {
            clause: "$orderby",
            message: "empty orderby list".into(),
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_comparison() {
        let expr = parse_filter("Name eq 'Widget'").unwrap();
        assert_eq!(
            expr,
            FilterExpr::Compare {
                field: "Name".into(),
                op: CompareOp::Eq,
                value: SqlValue::String("Widget".into()),
            }
        );
    }

    #[test]
    fn test_precedence_not_and_or() {
        // not A and B or C  ==  ((not A) and B) or C
        let expr = parse_filter("not Active eq true and Price gt 5 or Qty lt 2").unwrap();
        match expr {
            FilterExpr::Or(left, _) => match *left {
                FilterExpr::And(l, _) => assert!(matches!(*l, FilterExpr::Not(_))),
                other => panic!("expected And, got {other:?}"),
            },
            other => panic!("expected Or at root, got {other:?}"),
        }
    }

    #[test]
    fn test_parentheses_override() {
        // A and (B or C)
        let expr = parse_filter("Active eq true and (Price gt 5 or Qty lt 2)").unwrap();
        match expr {
            FilterExpr::And(_, right) => assert!(matches!(*right, FilterExpr::Or(_, _))),
            other => panic!("expected And at root, got {other:?}"),
        }
    }

    #[test]
    fn test_functions() {
        let expr = parse_filter("startswith(Code,'X-')").unwrap();
        assert_eq!(
            expr,
            FilterExpr::Function {
                func: StringFn::StartsWith,
                field: "Code".into(),
                value: "X-".into(),
            }
        );
        assert!(parse_filter("contains(Code,42)").is_err());
    }

    #[test]
    fn test_null_comparison() {
        assert!(parse_filter("Deleted eq null").is_ok());
        assert!(parse_filter("Deleted ne null").is_ok());
        assert!(parse_filter("Deleted gt null").is_err());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        assert!(parse_filter("Name eq 'x' bogus").is_err());
        assert!(parse_filter("(Name eq 'x'").is_err());
    }

    #[test]
    fn test_parse_select() {
        assert_eq!(parse_select("Code, Name").unwrap(), vec!["Code", "Name"]);
        assert!(parse_select(" , ").is_err());
    }

    #[test]
    fn test_parse_orderby() {
        let items = parse_orderby("Name desc, Code").unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].descending);
        assert!(!items[1].descending);
        assert!(parse_orderby("Name sideways").is_err());
    }
}
