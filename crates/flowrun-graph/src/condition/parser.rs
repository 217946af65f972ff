//! Parser for the condition grammar
//!
//! The grammar is deliberately tiny: a single comparison between two
//! operands, or a bare operand whose truthiness is the result.

use super::lexer::Token;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

/// Literal values
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

/// A comparison operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Variable reference, resolved against the variable map
    Var(String),

    Lit(Literal),
}

/// A parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `lhs op rhs`
    Compare {
        lhs: Operand,
        op: CmpOp,
        rhs: Operand,
    },

    /// A bare operand; evaluates to its truthiness
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty expression")]
    Empty,

    #[error("expected an operand, found {0:?}")]
    ExpectedOperand(Option<Token>),

    #[error("trailing tokens after expression")]
    TrailingTokens,
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

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(Operand::Var(name)),
            Some(Token::Number(n)) => Ok(Operand::Lit(Literal::Number(n))),
            Some(Token::Str(s)) => Ok(Operand::Lit(Literal::Str(s))),
            Some(Token::True) => Ok(Operand::Lit(Literal::Bool(true))),
            Some(Token::False) => Ok(Operand::Lit(Literal::Bool(false))),
            Some(Token::Null) => Ok(Operand::Lit(Literal::Null)),
            other => Err(ParseError::ExpectedOperand(other)),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::Le) => CmpOp::Le,
            _ => return Ok(Expr::Truthy(lhs)),
        };

        self.pos += 1; // consume the operator
        let rhs = self.parse_operand()?;

        Ok(Expr::Compare { lhs, op, rhs })
    }
}

/// Parse a token stream into an expression
pub fn parse(tokens: Vec<Token>) -> Result<Expr, ParseError> {
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;

    if parser.peek().is_some() {
        return Err(ParseError::TrailingTokens);
    }

    Ok(expr)
}
