//! Tokenizer and parser for branch conditions.

use super::{ExprError, Func, Node, Op, Value, ValueType, Var, VarPath};

#[derive(Clone, Debug, PartialEq)]
enum Token {
    LParen,
    RParen,
    Var(Var),
    Const(Value),
    Op(Op),
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn err(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            pos: self.pos,
            message: message.into(),
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn next(&mut self) -> Result<Option<Token>, ExprError> {
        self.skip_ws();
        if self.pos >= self.src.len() {
            return Ok(None);
        }

        let rest = &self.src[self.pos..];
        // Two-byte operators before their one-byte prefixes.
        for (sym, op) in [
            ("==", Op::Eq),
            ("!=", Op::Ne),
            (">=", Op::Ge),
            ("<=", Op::Le),
            ("&&", Op::And),
            ("||", Op::Or),
        ] {
            if rest.starts_with(sym.as_bytes()) {
                self.pos += 2;
                return Ok(Some(Token::Op(op)));
            }
        }

        match rest[0] {
            b'>' => {
                self.pos += 1;
                Ok(Some(Token::Op(Op::Gt)))
            }
            b'<' => {
                self.pos += 1;
                Ok(Some(Token::Op(Op::Lt)))
            }
            b'+' => {
                self.pos += 1;
                Ok(Some(Token::Op(Op::Add)))
            }
            b'-' => {
                self.pos += 1;
                Ok(Some(Token::Op(Op::Sub)))
            }
            b'(' => {
                self.pos += 1;
                Ok(Some(Token::LParen))
            }
            b')' => {
                self.pos += 1;
                Ok(Some(Token::RParen))
            }
            b'{' => self.scan_var().map(Some),
            b'"' => self.scan_string().map(Some),
            _ => self.scan_word().map(Some),
        }
    }

    /// `{path}` or `{type: path}`.
    fn scan_var(&mut self) -> Result<Token, ExprError> {
        let start = self.pos;
        let end = self.src[start..]
            .iter()
            .position(|&b| b == b'}')
            .map(|i| start + i)
            .ok_or_else(|| self.err("missing }"))?;
        let content = std::str::from_utf8(&self.src[start + 1..end])
            .map_err(|_| self.err("variable is not valid utf-8"))?;
        self.pos = end + 1;

        let (ty, path) = match content.split_once(':') {
            Some((ty, path)) => {
                let ty = match ty.trim() {
                    "num" => ValueType::Num,
                    "str" => ValueType::Str,
                    other => return Err(self.err(format!("unknown value type {}", other))),
                };
                (ty, path.trim())
            }
            None => (ValueType::Num, content.trim()),
        };

        let path = if let Some(field) = path.strip_prefix("event.") {
            if field.is_empty() {
                return Err(self.err("empty event field"));
            }
            VarPath::EventField(field.to_string())
        } else if let Some(name) = path.strip_prefix("func.") {
            let func = match name {
                "year" => Func::Year,
                "month" => Func::Month,
                "day" => Func::Day,
                "wf_step_crowd" => Func::StepCrowd,
                "wf_step_ttl" => Func::StepTtl,
                other => return Err(ExprError::UnknownFunc(other.to_string())),
            };
            VarPath::Func(func)
        } else {
            return Err(self.err(format!("unsupported variable path {}", path)));
        };

        Ok(Token::Var(Var { ty, path }))
    }

    /// `"..."` with `\"` and `\\` escapes.
    fn scan_string(&mut self) -> Result<Token, ExprError> {
        self.pos += 1;
        let mut value = Vec::new();
        loop {
            if self.pos >= self.src.len() {
                return Err(self.err("missing \""));
            }
            match self.src[self.pos] {
                b'"' => {
                    self.pos += 1;
                    let s = String::from_utf8(value)
                        .map_err(|_| self.err("string literal is not valid utf-8"))?;
                    return Ok(Token::Const(Value::Str(s)));
                }
                b'\\' if self.pos + 1 < self.src.len() => {
                    value.push(self.src[self.pos + 1]);
                    self.pos += 2;
                }
                b => {
                    value.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    /// A run of non-delimiter bytes: an integer constant if it parses as
    /// one, otherwise a bare string constant.
    fn scan_word(&mut self) -> Result<Token, ExprError> {
        let start = self.pos;
        while self.pos < self.src.len() {
            let b = self.src[self.pos];
            if b.is_ascii_whitespace() || b"(){}\"<>=!&|+-".contains(&b) {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.err(format!("unexpected byte {:?}", self.src[start] as char)));
        }
        let word = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("constant is not valid utf-8"))?;
        match word.parse::<i64>() {
            Ok(n) => Ok(Token::Const(Value::Num(n))),
            Err(_) => Ok(Token::Const(Value::Str(word.to_string()))),
        }
    }
}

pub(crate) fn parse(input: &str) -> Result<Node, ExprError> {
    let mut tokens = Vec::new();
    let mut lexer = Lexer::new(input);
    while let Some(token) = lexer.next()? {
        tokens.push(token);
    }
    if tokens.is_empty() {
        return Err(ExprError::Parse {
            pos: 0,
            message: "empty expression".to_string(),
        });
    }

    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse {
            pos: input.len(),
            message: "trailing tokens after expression".to_string(),
        });
    }
    Ok(node)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn err(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            pos: self.pos,
            message: message.into(),
        }
    }

    /// `operand (op operand)*`, folded left to right.
    fn expr(&mut self) -> Result<Node, ExprError> {
        let first = self.operand()?;
        let mut rest = Vec::new();
        while let Some(Token::Op(op)) = self.tokens.get(self.pos) {
            let op = *op;
            self.pos += 1;
            rest.push((op, self.operand()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Node::Chain {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn operand(&mut self) -> Result<Node, ExprError> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(self.err("missing )")),
                }
            }
            Some(Token::Var(var)) => {
                self.pos += 1;
                Ok(Node::Var(var))
            }
            Some(Token::Const(value)) => {
                self.pos += 1;
                Ok(Node::Const(value))
            }
            Some(other) => Err(self.err(format!("unexpected token {:?}", other))),
            None => Err(self.err("unexpected end of expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typed_var_comparison() {
        let node = parse("{num: event.uid} == 1").unwrap();
        match node {
            Node::Chain { first, rest } => {
                assert_eq!(
                    *first,
                    Node::Var(Var {
                        ty: ValueType::Num,
                        path: VarPath::EventField("uid".to_string()),
                    })
                );
                assert_eq!(rest, vec![(Op::Eq, Node::Const(Value::Num(1)))]);
            }
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[test]
    fn test_parse_default_type_is_num() {
        let node = parse("{event.uid} > 10").unwrap();
        match node {
            Node::Chain { first, .. } => match *first {
                Node::Var(var) => assert_eq!(var.ty, ValueType::Num),
                other => panic!("unexpected node: {:?}", other),
            },
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[test]
    fn test_parse_func_var() {
        let node = parse("{num: func.wf_step_ttl} > 0").unwrap();
        match node {
            Node::Chain { first, .. } => match *first {
                Node::Var(var) => assert_eq!(var.path, VarPath::Func(Func::StepTtl)),
                other => panic!("unexpected node: {:?}", other),
            },
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[test]
    fn test_parse_string_literal_with_escape() {
        let node = parse(r#"{str: event.city} == "ber\"lin""#).unwrap();
        match node {
            Node::Chain { rest, .. } => {
                assert_eq!(
                    rest,
                    vec![(Op::Eq, Node::Const(Value::Str("ber\"lin".to_string())))]
                );
            }
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_func() {
        assert_eq!(
            parse("{num: func.nope} == 1"),
            Err(ExprError::UnknownFunc("nope".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_unclosed_var() {
        assert!(matches!(
            parse("{num: event.uid == 1"),
            Err(ExprError::Parse { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(matches!(parse("   "), Err(ExprError::Parse { .. })));
    }
}
