//! The recursive-descent parser for rule expressions.
//!
//! Operators in precedence order, high to low: `!`/`NOT` and `( ... )`,
//! implicit OR (adjacency), `AND`, `EXCEPT`. Operator parsing is left to
//! right, so `a EXCEPT b EXCEPT c` is `(a) EXCEPT ((b) EXCEPT (c))`.
//!
//! Operands are matcher invocations in three forms: `NAME: VALUE`, a bare
//! `NAME`, or a bare value that goes through the default terminals (IP
//! address forms first, then hostnames).

use std::fmt;

use crate::hostinfo::HostInfo;
use crate::lexer::{self, LexError, Op, Token};
use crate::matchers::{self, BadArg, Matcher};
use crate::memo::Memos;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0}")]
    Lex(#[from] LexError),
    #[error("nothing to parse")]
    Empty,
    #[error("expecting term, got {0}")]
    ExpectedTerm(String),
    #[error("expecting closing ), got {0}")]
    ExpectedClose(String),
    #[error("expected argument for {0}, got {1}")]
    ExpectedArgument(String, String),
    #[error("empty OR list")]
    EmptyOrList,
    #[error("empty right AND clause")]
    EmptyAnd,
    #[error("empty right EXCEPT clause")]
    EmptyExcept,
    #[error("expected end of line, got {0}")]
    TrailingTokens(String),
    #[error("{0}")]
    Arg(#[from] BadArg),
}

/// An expression tree whose leaves are ready-to-eval matchers.
#[derive(Debug, Clone)]
pub enum Expr {
    Not(Box<Expr>),
    Or(Vec<Expr>),
    And(Box<Expr>, Box<Expr>),
    Except(Box<Expr>, Box<Expr>),
    Leaf(Matcher),
}

impl Expr {
    /// Left-to-right, short-circuit evaluation. `a EXCEPT b` is
    /// `a && !b`.
    pub fn eval(&self, hi: &mut HostInfo) -> bool {
        match self {
            Expr::Not(child) => !child.eval(hi),
            Expr::Or(children) => children.iter().any(|c| c.eval(hi)),
            Expr::And(left, right) => left.eval(hi) && right.eval(hi),
            Expr::Except(left, right) => left.eval(hi) && !right.eval(hi),
            Expr::Leaf(matcher) => matcher.eval(hi),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Not(child) => write!(f, "!({child})"),
            Expr::Or(children) => {
                let mut first = true;
                for child in children {
                    if !first {
                        f.write_str(" ")?;
                    }
                    write!(f, "{child}")?;
                    first = false;
                }
                Ok(())
            }
            Expr::And(left, right) => write!(f, "({left}) AND ({right})"),
            Expr::Except(left, right) => write!(f, "({left}) EXCEPT ({right})"),
            Expr::Leaf(matcher) => matcher.fmt(f),
        }
    }
}

fn pretty(token: &Token) -> String {
    match token {
        Token::Eol => "EOL".to_owned(),
        Token::Word(w) => w.clone(),
        Token::Op(op) => op.to_string(),
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    memos: &'a mut Memos,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eol)
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        self.pos += 1;

        token
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        self.bump();
        let Some(mut res) = self.parse_term()? else {
            return Err(ParseError::ExpectedTerm(pretty(self.peek())));
        };
        // Terms normally get finalized during OR-list processing, but NOT
        // consumes its term directly and must finalize it itself.
        if let Expr::Leaf(matcher) = &mut res {
            matcher.finalize(self.memos)?;
        }

        Ok(Expr::Not(Box::new(res)))
    }

    fn parse_brackets(&mut self) -> Result<Expr, ParseError> {
        self.bump();
        let root = self.parse_except()?;
        if *self.peek() != Token::Op(Op::Close) {
            return Err(ParseError::ExpectedClose(pretty(self.peek())));
        }
        self.bump();

        Ok(root)
    }

    /// One terminal: a negation, a bracketed expression, `NAME: VALUE`,
    /// or a bare name/value. Returns `None` on a token that cannot start
    /// a terminal, which ends the enclosing OR list.
    fn parse_term(&mut self) -> Result<Option<Expr>, ParseError> {
        let word = match self.peek() {
            Token::Op(Op::Not) => return self.parse_not().map(Some),
            Token::Op(Op::Open) => return self.parse_brackets().map(Some),
            Token::Word(w) => w.clone(),
            Token::Op(_) | Token::Eol => return Ok(None),
        };
        self.bump();

        // Terminals with values end in a colon; everything else does not.
        if word.ends_with(':') {
            let Token::Word(val) = self.peek().clone() else {
                return Err(ParseError::ExpectedArgument(word, pretty(self.peek())));
            };
            self.bump();

            return Ok(Some(Expr::Leaf(matchers::make_matcher(
                &word,
                Some(&val),
                self.memos,
            )?)));
        }

        // Either a bare terminal or a value for the default handlers.
        let matcher = match matchers::make_matcher(&word, None, self.memos) {
            Ok(matcher) => matcher,
            Err(BadArg::UnknownMatcher(_)) => matchers::default_matcher(&word, self.memos)?,
            Err(other) => return Err(other.into()),
        };

        Ok(Some(Expr::Leaf(matcher)))
    }

    /// Implicit OR: adjacent terms. Consecutive mergeable leaves collapse
    /// into one matcher; every mergeable leaf is finalized before the list
    /// is done with it.
    fn parse_or_list(&mut self) -> Result<Expr, ParseError> {
        let mut list: Vec<Expr> = Vec::new();
        let mut pending_merge = false;
        while let Some(term) = self.parse_term()? {
            if pending_merge
                && let Expr::Leaf(new) = &term
                && let Some(Expr::Leaf(last)) = list.last_mut()
                && last.try_merge(new)
            {
                continue;
            }
            if pending_merge
                && let Some(Expr::Leaf(last)) = list.last_mut()
            {
                last.finalize(self.memos)?;
            }
            pending_merge = matches!(&term, Expr::Leaf(m) if m.is_mergeable());
            list.push(term);
        }
        if list.is_empty() {
            return Err(ParseError::EmptyOrList);
        }
        if pending_merge
            && let Some(Expr::Leaf(last)) = list.last_mut()
        {
            last.finalize(self.memos)?;
        }

        // Avoid pointless order-1 OR nodes.
        if list.len() == 1 {
            Ok(list.remove(0))
        } else {
            Ok(Expr::Or(list))
        }
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_or_list()?;
        if *self.peek() != Token::Op(Op::And) {
            return Ok(left);
        }
        self.bump();
        if *self.peek() == Token::Eol {
            return Err(ParseError::EmptyAnd);
        }

        Ok(Expr::And(Box::new(left), Box::new(self.parse_and()?)))
    }

    fn parse_except(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_and()?;
        if *self.peek() != Token::Op(Op::Except) {
            return Ok(left);
        }
        self.bump();
        if *self.peek() == Token::Eol {
            return Err(ParseError::EmptyExcept);
        }

        Ok(Expr::Except(Box::new(left), Box::new(self.parse_except()?)))
    }

    fn parse(&mut self) -> Result<Expr, ParseError> {
        if *self.peek() == Token::Eol {
            return Err(ParseError::Empty);
        }
        let root = self.parse_except()?;
        if *self.peek() != Token::Eol {
            return Err(ParseError::TrailingTokens(pretty(self.peek())));
        }

        Ok(root)
    }
}

/// Parses one rule expression into an evaluatable tree.
pub fn parse(s: &str, memos: &mut Memos) -> Result<Expr, ParseError> {
    let tokens = lexer::tokenize(s)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        memos,
    };

    parser.parse()
}
