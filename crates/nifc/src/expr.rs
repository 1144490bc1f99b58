//! The schema expression language used by `cond`, `vercond`, `arr1`, `arr2` and `arg`.
//!
//! Parsing produces a canonical tree: rendering it with `Display` gives one spelling per
//! expression (single spaces around binary operators, parentheses only where precedence
//! needs them), so textual comparisons between guards are insensitive to source spacing.

use std::collections::BTreeSet;
use std::fmt;

use nif_runtime::VersionNumber;
use serde::{Serialize, Serializer};

pub const VERSION_IDENT: &str = "Version";
pub const USER_VERSION_IDENT: &str = "User Version";
pub const USER_VERSION_2_IDENT: &str = "User Version 2";

pub fn is_reserved_ident(name: &str) -> bool {
    matches!(name, VERSION_IDENT | USER_VERSION_IDENT | USER_VERSION_2_IDENT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    BitAnd,
    BitXor,
    BitOr,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitXor => "^",
            BinaryOp::BitOr => "|",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }

    /// Binding strength; higher binds tighter. All binary operators are left associative.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::BitOr => 3,
            BinaryOp::BitXor => 4,
            BinaryOp::BitAnd => 5,
            BinaryOp::Eq | BinaryOp::Ne => 6,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 7,
            BinaryOp::Shl | BinaryOp::Shr => 8,
            BinaryOp::Add | BinaryOp::Sub => 9,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 10,
        }
    }

    /// True for operators whose result is a truth value.
    pub fn is_boolean(self) -> bool {
        matches!(
            self,
            BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::And
                | BinaryOp::Or
        )
    }

    fn negated_comparison(self) -> Option<BinaryOp> {
        Some(match self {
            BinaryOp::Eq => BinaryOp::Ne,
            BinaryOp::Ne => BinaryOp::Eq,
            BinaryOp::Lt => BinaryOp::Ge,
            BinaryOp::Ge => BinaryOp::Lt,
            BinaryOp::Le => BinaryOp::Gt,
            BinaryOp::Gt => BinaryOp::Le,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Expr {
    Int(i64),
    /// A dotted version literal, folded to its packed value.
    Version(u32),
    Ident(String),
    /// The constructor argument (`ARG` / `#ARG#`).
    Arg,
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at byte {})", self.message, self.position)
    }
}

impl std::error::Error for ExprError {}

/// Values an expression can observe while being evaluated.
pub trait Env {
    fn ident(&self, name: &str) -> i64;
    fn arg(&self) -> i64;
}

impl Expr {
    pub fn parse(text: &str) -> Result<Expr, ExprError> {
        let tokens = lex(text)?;
        let mut p = Parser {
            tokens,
            pos: 0,
            end: text.len(),
        };
        let expr = p.parse_binary(0)?;
        if let Some((at, tok)) = p.tokens.get(p.pos) {
            return Err(ExprError {
                position: *at,
                message: format!("unexpected {tok}"),
            });
        }
        Ok(expr)
    }

    pub fn ident(name: &str) -> Expr {
        Expr::Ident(name.to_string())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// True when the expression's value is a truth value rather than an integer.
    pub fn is_boolean(&self) -> bool {
        match self {
            Expr::Unary(UnaryOp::Not, _) => true,
            Expr::Binary(op, _, _) => op.is_boolean(),
            _ => false,
        }
    }

    /// Every identifier the expression reads, reserved ones included.
    pub fn idents(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_idents(&mut out);
        out
    }

    fn collect_idents<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Ident(name) => {
                out.insert(name.as_str());
            }
            Expr::Unary(_, e) => e.collect_idents(out),
            Expr::Binary(_, l, r) => {
                l.collect_idents(out);
                r.collect_idents(out);
            }
            Expr::Int(_) | Expr::Version(_) | Expr::Arg => {}
        }
    }

    pub fn references(&self, name: &str) -> bool {
        match self {
            Expr::Ident(n) => n == name,
            Expr::Unary(_, e) => e.references(name),
            Expr::Binary(_, l, r) => l.references(name) || r.references(name),
            Expr::Int(_) | Expr::Version(_) | Expr::Arg => false,
        }
    }

    pub fn as_ident(&self) -> Option<&str> {
        match self {
            Expr::Ident(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            Expr::Version(v) => Some(i64::from(*v)),
            Expr::Unary(UnaryOp::Neg, e) => e.as_constant().map(i64::wrapping_neg),
            _ => None,
        }
    }

    /// The logical negation, simplified for comparisons and double negation.
    pub fn negate(&self) -> Expr {
        match self {
            Expr::Unary(UnaryOp::Not, inner) => (**inner).clone(),
            Expr::Binary(op, l, r) => match op.negated_comparison() {
                Some(neg) => Expr::Binary(neg, l.clone(), r.clone()),
                None => Expr::Unary(UnaryOp::Not, Box::new(self.clone())),
            },
            _ => Expr::Unary(UnaryOp::Not, Box::new(self.clone())),
        }
    }

    /// True when exactly one of `self` and `other` holds for every input.
    pub fn is_complement_of(&self, other: &Expr) -> bool {
        self.negate() == *other || other.negate() == *self
    }

    /// Splits `d == c` (either operand order) into discriminant and constant.
    pub fn eq_test(&self) -> Option<(&Expr, i64)> {
        let Expr::Binary(BinaryOp::Eq, l, r) = self else {
            return None;
        };
        match (l.as_constant(), r.as_constant()) {
            (None, Some(c)) => Some((l, c)),
            (Some(c), None) => Some((r, c)),
            _ => None,
        }
    }

    /// True when no input can satisfy both `self` and `other`.
    pub fn is_disjoint_from(&self, other: &Expr) -> bool {
        if self.is_complement_of(other) {
            return true;
        }
        match (self.eq_test(), other.eq_test()) {
            (Some((d1, c1)), Some((d2, c2))) => d1 == d2 && c1 != c2,
            _ => false,
        }
    }

    /// Evaluates with wrapping integer arithmetic; truth values are 0 or 1 and division
    /// by zero yields 0.
    pub fn eval(&self, env: &dyn Env) -> i64 {
        match self {
            Expr::Int(v) => *v,
            Expr::Version(v) => i64::from(*v),
            Expr::Ident(name) => env.ident(name),
            Expr::Arg => env.arg(),
            Expr::Unary(UnaryOp::Not, e) => i64::from(e.eval(env) == 0),
            Expr::Unary(UnaryOp::Neg, e) => e.eval(env).wrapping_neg(),
            Expr::Binary(op, l, r) => {
                let a = l.eval(env);
                let b = r.eval(env);
                match op {
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::Div => a.checked_div(b).unwrap_or(0),
                    BinaryOp::Rem => a.checked_rem(b).unwrap_or(0),
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Shl => a.wrapping_shl(b as u32),
                    BinaryOp::Shr => a.wrapping_shr(b as u32),
                    BinaryOp::Lt => i64::from(a < b),
                    BinaryOp::Le => i64::from(a <= b),
                    BinaryOp::Gt => i64::from(a > b),
                    BinaryOp::Ge => i64::from(a >= b),
                    BinaryOp::Eq => i64::from(a == b),
                    BinaryOp::Ne => i64::from(a != b),
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::BitXor => a ^ b,
                    BinaryOp::BitOr => a | b,
                    BinaryOp::And => i64::from(a != 0 && b != 0),
                    BinaryOp::Or => i64::from(a != 0 || b != 0),
                }
            }
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary(op, _, _) => op.precedence(),
            Expr::Unary(..) => 11,
            _ => 12,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{v}"),
            Expr::Version(v) => write!(f, "{}", VersionNumber::from_raw(*v)),
            Expr::Ident(name) => f.write_str(name),
            Expr::Arg => f.write_str("ARG"),
            Expr::Unary(op, e) => {
                f.write_str(match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "-",
                })?;
                if e.precedence() < 11 {
                    write!(f, "({e})")
                } else {
                    write!(f, "{e}")
                }
            }
            Expr::Binary(op, l, r) => {
                let prec = op.precedence();
                if l.precedence() < prec {
                    write!(f, "({l})")?;
                } else {
                    write!(f, "{l}")?;
                }
                write!(f, " {} ", op.as_str())?;
                if r.precedence() <= prec {
                    write!(f, "({r})")
                } else {
                    write!(f, "{r}")
                }
            }
        }
    }
}

impl Serialize for Expr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Version(u32),
    Ident(String),
    Arg,
    Op(&'static str),
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Int(v) => write!(f, "number {v}"),
            Token::Version(v) => write!(f, "version {}", VersionNumber::from_raw(*v)),
            Token::Ident(name) => write!(f, "identifier {name:?}"),
            Token::Arg => f.write_str("ARG"),
            Token::Op(op) => write!(f, "operator {op:?}"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

// Longest first so that `<=` wins over `<`.
const OPERATORS: &[&str] = &[
    "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "*", "/", "%", "+", "-", "<", ">", "&", "^",
    "|", "!",
];

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn lex(text: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == b'(' {
            out.push((start, Token::LParen));
            i += 1;
            continue;
        }
        if c == b')' {
            out.push((start, Token::RParen));
            i += 1;
            continue;
        }
        if text[i..].starts_with("#ARG#") {
            out.push((start, Token::Arg));
            i += "#ARG#".len();
            continue;
        }
        if c.is_ascii_digit() {
            if text[i..].starts_with("0x") || text[i..].starts_with("0X") {
                i += 2;
                while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
                let digits = &text[start + 2..i];
                let value = u64::from_str_radix(digits, 16).map_err(|_| ExprError {
                    position: start,
                    message: format!("bad hex literal {:?}", &text[start..i]),
                })?;
                out.push((start, Token::Int(value as i64)));
                continue;
            }
            let mut dotted = false;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                dotted |= bytes[i] == b'.';
                i += 1;
            }
            let lit = &text[start..i];
            let tok = if dotted {
                let v = VersionNumber::parse(lit).ok_or_else(|| ExprError {
                    position: start,
                    message: format!("bad version literal {lit:?}"),
                })?;
                Token::Version(v.raw())
            } else {
                Token::Int(lit.parse::<i64>().map_err(|_| ExprError {
                    position: start,
                    message: format!("integer literal {lit:?} out of range"),
                })?)
            };
            out.push((start, tok));
            continue;
        }
        if is_ident_start(c) {
            i += 1;
            loop {
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                // a single interior space joins two words of one identifier
                if i + 1 < bytes.len() && bytes[i] == b' ' && is_ident_continue(bytes[i + 1]) {
                    i += 1;
                    continue;
                }
                break;
            }
            let name = &text[start..i];
            let tok = if name == "ARG" {
                Token::Arg
            } else {
                Token::Ident(name.to_string())
            };
            out.push((start, tok));
            continue;
        }
        match OPERATORS.iter().find(|op| text[i..].starts_with(**op)) {
            Some(op) => {
                out.push((start, Token::Op(op)));
                i += op.len();
            }
            None => {
                return Err(ExprError {
                    position: start,
                    message: format!("unexpected character {:?}", char::from(c)),
                })
            }
        }
    }
    Ok(out)
}

fn binary_op(op: &str) -> Option<BinaryOp> {
    Some(match op {
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Rem,
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "<<" => BinaryOp::Shl,
        ">>" => BinaryOp::Shr,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "&" => BinaryOp::BitAnd,
        "^" => BinaryOp::BitXor,
        "|" => BinaryOp::BitOr,
        "&&" => BinaryOp::And,
        "||" => BinaryOp::Or,
        _ => return None,
    })
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn here(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(at, _)| *at)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) => match binary_op(op) {
                    Some(op) if op.precedence() > min_prec => op,
                    _ => break,
                },
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_binary(op.precedence())?;
            lhs = Expr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let at = self.here();
        let Some((_, tok)) = self.tokens.get(self.pos).cloned() else {
            return Err(ExprError {
                position: at,
                message: "unexpected end of expression".to_string(),
            });
        };
        self.pos += 1;
        match tok {
            Token::Int(v) => Ok(Expr::Int(v)),
            Token::Version(v) => Ok(Expr::Version(v)),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::Arg => Ok(Expr::Arg),
            Token::Op("!") => Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?))),
            Token::Op("-") => {
                let inner = self.parse_unary()?;
                Ok(match inner {
                    Expr::Int(v) => Expr::Int(v.wrapping_neg()),
                    other => Expr::Unary(UnaryOp::Neg, Box::new(other)),
                })
            }
            Token::LParen => {
                let inner = self.parse_binary(0)?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(ExprError {
                        position: self.here(),
                        message: "expected ')'".to_string(),
                    }),
                }
            }
            other => Err(ExprError {
                position: at,
                message: format!("unexpected {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Vars(BTreeMap<&'static str, i64>, i64);

    impl Env for Vars {
        fn ident(&self, name: &str) -> i64 {
            self.0.get(name).copied().unwrap_or(0)
        }

        fn arg(&self) -> i64 {
            self.1
        }
    }

    fn canon(s: &str) -> String {
        Expr::parse(s).unwrap().to_string()
    }

    #[test]
    fn identifiers_may_contain_single_spaces() {
        assert_eq!(
            Expr::parse("Num UV Sets 2 > 0").unwrap(),
            Expr::binary(BinaryOp::Gt, Expr::ident("Num UV Sets 2"), Expr::Int(0))
        );
        assert!(Expr::parse("Has  Normals").is_err());
    }

    #[test]
    fn rendering_is_canonical() {
        assert_eq!(canon("(Flags&4)!=0"), "(Flags & 4) != 0");
        assert_eq!(canon("((A) + (B * C))"), "A + B * C");
        assert_eq!(canon("A - (B - C)"), "A - (B - C)");
        assert_eq!(canon("!(Has Normals)"), "!Has Normals");
        assert_eq!(canon("!(A == 1)"), "!(A == 1)");
        assert_eq!(canon("#ARG# == 2"), "ARG == 2");
        assert_eq!(canon("Version >= 20.2.0.7"), "Version >= 20.2.0.7");
        assert_eq!(canon("0x10"), "16");
    }

    #[test]
    fn version_literals_fold_to_packed_values() {
        assert_eq!(
            Expr::parse("20.2.0.7").unwrap(),
            Expr::Version(0x1402_0007)
        );
        assert!(Expr::parse("1.2.3.4.5").is_err());
    }

    #[test]
    fn precedence_and_associativity() {
        let e = Expr::parse("A || B && C == 1 + 2 * 3").unwrap();
        let vars = Vars([("A", 0), ("B", 1), ("C", 7)].into_iter().collect(), 0);
        assert_eq!(e.eval(&vars), 1);
        assert_eq!(Expr::parse("10 - 4 - 3").unwrap().eval(&vars), 3);
        assert_eq!(Expr::parse("1 << 2 + 1").unwrap().eval(&vars), 8);
    }

    #[test]
    fn eval_is_total() {
        let vars = Vars(BTreeMap::new(), 5);
        assert_eq!(Expr::parse("ARG / 0").unwrap().eval(&vars), 0);
        assert_eq!(Expr::parse("ARG % 0").unwrap().eval(&vars), 0);
        assert_eq!(Expr::parse("-ARG").unwrap().eval(&vars), -5);
        assert_eq!(Expr::parse("!Missing").unwrap().eval(&vars), 1);
    }

    #[test]
    fn complements_and_disjointness() {
        let p = |s: &str| Expr::parse(s).unwrap();
        assert!(p("A == 1").is_complement_of(&p("A != 1")));
        assert!(p("Has UV").is_complement_of(&p("!Has UV")));
        assert!(p("A <= 3").is_complement_of(&p("A > 3")));
        assert!(!p("A < 3").is_complement_of(&p("A > 3")));
        assert!(p("A == 1").is_disjoint_from(&p("A == 2")));
        assert!(p("1 == A").is_disjoint_from(&p("A == 2")));
        assert!(!p("A == 1").is_disjoint_from(&p("B == 2")));
        assert!(!p("A == 1").is_disjoint_from(&p("A == 1")));
    }

    #[test]
    fn errors_carry_positions() {
        let err = Expr::parse("A == (B").unwrap_err();
        assert_eq!(err.position, 7);
        let err = Expr::parse("A $ B").unwrap_err();
        assert_eq!(err.position, 2);
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("(A) B").is_err());
    }
}
