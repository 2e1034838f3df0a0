//! Precedence-climbing parser over the token stream.

use lore_core::Record;

use super::lexer::{tokenize, Token, TokenKind};
use super::tree::{BinaryOp, NameRef, Node, SystemCall, Target, UnaryOp};
use crate::error::KbError;

/// Deepest expression tree, and deepest parser recursion, accepted.
pub const MAX_EXPRESSION_DEPTH: usize = 128;

/// Parses source text into an unfolded tree.
pub fn parse(source: &str) -> Result<Node, KbError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };
    let node = parser.sequence()?;
    let trailing = parser.peek();
    if trailing.kind != TokenKind::Eof {
        return Err(KbError::syntax(
            trailing.position,
            format!("unexpected {}", describe(&trailing.kind)),
        ));
    }
    if node.depth() > MAX_EXPRESSION_DEPTH {
        return Err(too_deep(0));
    }
    Ok(node)
}

fn too_deep(position: usize) -> KbError {
    KbError::syntax(
        position,
        format!("expression nested deeper than {MAX_EXPRESSION_DEPTH} levels"),
    )
}

/// Depth of a node joining `lhs` and `rhs`. `known` caches the depth of
/// `lhs` across a chain of operators.
fn joined_depth(
    known: Option<usize>,
    lhs: &Node,
    rhs: &Node,
    position: usize,
) -> Result<usize, KbError> {
    let depth = known.unwrap_or_else(|| lhs.depth()).max(rhs.depth()) + 1;
    if depth > MAX_EXPRESSION_DEPTH {
        return Err(too_deep(position));
    }
    Ok(depth)
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Integer(v) => format!("number {v}"),
        TokenKind::Double(v) => format!("number {v}"),
        TokenKind::Str(_) => "string literal".to_string(),
        TokenKind::Ident(name) => format!("name '{name}'"),
        TokenKind::System(name) => format!("system call '#{name}'"),
        TokenKind::Eof => "end of expression".to_string(),
        TokenKind::MinIntegerMagnitude => format!("number {}", i64::MIN.unsigned_abs()),
        other => format!("{other:?}"),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Active recursive descents into nested sub-expressions.
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The lexer always ends the stream with `Eof`.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), KbError> {
        if self.eat(kind) {
            return Ok(());
        }
        let token = self.peek();
        Err(KbError::syntax(
            token.position,
            format!("expected {what}, found {}", describe(&token.kind)),
        ))
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Result<Node, KbError>) -> Result<Node, KbError> {
        if self.nesting >= MAX_EXPRESSION_DEPTH {
            return Err(too_deep(self.peek().position));
        }
        self.nesting += 1;
        let node = parse(self);
        self.nesting -= 1;
        node
    }

    fn at_sequence_end(&self) -> bool {
        matches!(
            self.peek().kind,
            TokenKind::Eof | TokenKind::RParen | TokenKind::RBracket
        )
    }

    // sequence := both (';' both?)*
    fn sequence(&mut self) -> Result<Node, KbError> {
        let mut items = Vec::new();
        loop {
            while self.eat(&TokenKind::Semicolon) {}
            if self.at_sequence_end() {
                break;
            }
            items.push(self.both()?);
            if !self.eat(&TokenKind::Semicolon) {
                break;
            }
        }
        Ok(match items.len() {
            0 => Node::Literal(Record::empty()),
            1 => items.remove(0),
            _ => Node::Sequence(items),
        })
    }

    fn both(&mut self) -> Result<Node, KbError> {
        let mut node = self.implies()?;
        let mut depth = None;
        while self.eat(&TokenKind::Comma) {
            let position = self.peek().position;
            let rhs = self.implies()?;
            depth = Some(joined_depth(depth, &node, &rhs, position)?);
            node = Node::Both(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn implies(&mut self) -> Result<Node, KbError> {
        let lhs = self.assignment()?;
        if self.eat(&TokenKind::Implies) {
            let rhs = self.nested(Self::implies)?;
            return Ok(Node::Implies(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn assignment(&mut self) -> Result<Node, KbError> {
        let position = self.peek().position;
        let lhs = self.or()?;
        let op = match self.peek().kind {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinaryOp::Add),
            TokenKind::MinusAssign => Some(BinaryOp::Sub),
            TokenKind::StarAssign => Some(BinaryOp::Mul),
            TokenKind::SlashAssign => Some(BinaryOp::Div),
            _ => return Ok(lhs),
        };
        self.advance();
        let target = into_target(lhs, position)?;
        let value = self.nested(Self::assignment)?;
        Ok(Node::Assign {
            target,
            op,
            value: Box::new(value),
        })
    }

    fn or(&mut self) -> Result<Node, KbError> {
        let mut node = self.and()?;
        let mut depth = None;
        while self.eat(&TokenKind::OrOr) {
            let position = self.peek().position;
            let rhs = self.and()?;
            depth = Some(joined_depth(depth, &node, &rhs, position)?);
            node = Node::Or(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn and(&mut self) -> Result<Node, KbError> {
        let mut node = self.equality()?;
        let mut depth = None;
        while self.eat(&TokenKind::AndAnd) {
            let position = self.peek().position;
            let rhs = self.equality()?;
            depth = Some(joined_depth(depth, &node, &rhs, position)?);
            node = Node::And(Box::new(node), Box::new(rhs));
        }
        Ok(node)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> Result<Node, KbError>,
        table: &[(TokenKind, BinaryOp)],
    ) -> Result<Node, KbError> {
        let mut node = next(self)?;
        let mut depth = None;
        'outer: loop {
            for (kind, op) in table {
                if self.eat(kind) {
                    let position = self.peek().position;
                    let rhs = next(self)?;
                    depth = Some(joined_depth(depth, &node, &rhs, position)?);
                    node = Node::Binary {
                        op: *op,
                        lhs: Box::new(node),
                        rhs: Box::new(rhs),
                    };
                    continue 'outer;
                }
            }
            return Ok(node);
        }
    }

    fn equality(&mut self) -> Result<Node, KbError> {
        self.binary_level(
            Self::relational,
            &[(TokenKind::EqEq, BinaryOp::Eq), (TokenKind::NotEq, BinaryOp::Ne)],
        )
    }

    fn relational(&mut self) -> Result<Node, KbError> {
        self.binary_level(
            Self::additive,
            &[
                (TokenKind::Lt, BinaryOp::Lt),
                (TokenKind::Le, BinaryOp::Le),
                (TokenKind::Gt, BinaryOp::Gt),
                (TokenKind::Ge, BinaryOp::Ge),
            ],
        )
    }

    fn additive(&mut self) -> Result<Node, KbError> {
        self.binary_level(
            Self::multiplicative,
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
        )
    }

    fn multiplicative(&mut self) -> Result<Node, KbError> {
        self.binary_level(
            Self::prefix,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Rem),
            ],
        )
    }

    fn prefix(&mut self) -> Result<Node, KbError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Bang => {
                self.advance();
                let operand = self.nested(Self::prefix)?;
                Ok(Node::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            TokenKind::Minus => {
                self.advance();
                if self.eat(&TokenKind::MinIntegerMagnitude) {
                    return Ok(Node::Literal(Record::integer(i64::MIN)));
                }
                let operand = self.nested(Self::prefix)?;
                Ok(Node::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(operand),
                })
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                self.advance();
                let delta = if token.kind == TokenKind::PlusPlus { 1 } else { -1 };
                let operand_position = self.peek().position;
                let operand = self.nested(Self::prefix)?;
                Ok(Node::Step {
                    target: into_target(operand, operand_position)?,
                    delta,
                })
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Node, KbError> {
        let token = self.advance();
        match token.kind {
            TokenKind::Integer(v) => Ok(Node::Literal(Record::integer(v))),
            TokenKind::Double(v) => Ok(Node::Literal(Record::double(v))),
            TokenKind::Str(s) => Ok(Node::Literal(Record::string(s))),
            TokenKind::LParen => {
                let inner = self.nested(Self::sequence)?;
                self.expect(&TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::System(name) => {
                let Some(call) = SystemCall::from_name(&name) else {
                    return Err(KbError::syntax(
                        token.position,
                        format!("unknown system call '#{name}'"),
                    ));
                };
                let args = if self.peek().kind == TokenKind::LParen {
                    self.advance();
                    self.arguments()?
                } else {
                    Vec::new()
                };
                let (min, max) = call.arity();
                if args.len() < min || args.len() > max {
                    return Err(KbError::syntax(
                        token.position,
                        format!("#{name} does not take {} arguments", args.len()),
                    ));
                }
                Ok(Node::System { call, args })
            }
            TokenKind::Ident(name) => {
                if self.peek().kind == TokenKind::LParen {
                    self.advance();
                    let args = self.arguments()?;
                    return Ok(Node::Call { name, args });
                }
                let name = NameRef::parse(&name);
                if self.eat(&TokenKind::LBracket) {
                    let index = self.nested(Self::sequence)?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    return Ok(Node::Index {
                        name,
                        index: Box::new(index),
                    });
                }
                Ok(Node::Variable(name))
            }
            TokenKind::MinIntegerMagnitude => Err(KbError::syntax(
                token.position,
                format!("integer '{}' out of range", i64::MIN.unsigned_abs()),
            )),
            other => Err(KbError::syntax(
                token.position,
                format!("unexpected {}", describe(&other)),
            )),
        }
    }

    /// Arguments after an opening parenthesis. Commas separate arguments
    /// here rather than acting as the `,` operator.
    fn arguments(&mut self) -> Result<Vec<Node>, KbError> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.nested(Self::implies)?);
            if self.eat(&TokenKind::Comma) {
                continue;
            }
            self.expect(&TokenKind::RParen, "',' or ')'")?;
            return Ok(args);
        }
    }
}

fn into_target(node: Node, position: usize) -> Result<Target, KbError> {
    match node {
        Node::Variable(name) => Ok(Target::Variable(name)),
        Node::Index { name, index } => Ok(Target::Index { name, index }),
        _ => Err(KbError::syntax(
            position,
            "assignment target must be a variable",
        )),
    }
}
