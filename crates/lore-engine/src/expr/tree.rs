use std::fmt;
use std::sync::Arc;

use lore_core::{ops, Record, RecordError};

/// One piece of a variable name.
#[derive(Debug, Clone, PartialEq)]
pub enum NameSegment {
    Text(String),
    /// `{name}` replaced by the named variable's string value.
    Expand(String),
}

/// A variable name, possibly assembled from other variables at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct NameRef {
    segments: Vec<NameSegment>,
}

impl NameRef {
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = raw;
        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            if open > 0 {
                segments.push(NameSegment::Text(rest[..open].to_string()));
            }
            segments.push(NameSegment::Expand(
                rest[open + 1..open + close].trim().to_string(),
            ));
            rest = &rest[open + close + 1..];
        }
        if !rest.is_empty() {
            segments.push(NameSegment::Text(rest.to_string()));
        }
        Self { segments }
    }

    pub fn segments(&self) -> &[NameSegment] {
        &self.segments
    }

    /// The name when it has no expansion segments.
    pub fn as_static(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [NameSegment::Text(text)] => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for NameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                NameSegment::Text(text) => f.write_str(text)?,
                NameSegment::Expand(name) => write!(f, "{{{name}}}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinaryOp {
    pub fn apply(self, lhs: &Record, rhs: &Record) -> Result<Record, RecordError> {
        match self {
            BinaryOp::Add => ops::add(lhs, rhs),
            BinaryOp::Sub => ops::sub(lhs, rhs),
            BinaryOp::Mul => ops::mul(lhs, rhs),
            BinaryOp::Div => ops::div(lhs, rhs),
            BinaryOp::Rem => ops::rem(lhs, rhs),
            BinaryOp::Eq => Ok(ops::eq(lhs, rhs)),
            BinaryOp::Ne => Ok(ops::ne(lhs, rhs)),
            BinaryOp::Lt => Ok(ops::lt(lhs, rhs)),
            BinaryOp::Le => Ok(ops::le(lhs, rhs)),
            BinaryOp::Gt => Ok(ops::gt(lhs, rhs)),
            BinaryOp::Ge => Ok(ops::ge(lhs, rhs)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

impl UnaryOp {
    pub fn apply(self, operand: &Record) -> Result<Record, RecordError> {
        match self {
            UnaryOp::Negate => ops::negate(operand),
            UnaryOp::Not => Ok(ops::not(operand)),
        }
    }
}

/// Compound assignment operator; `None` is plain `=`.
pub type AssignOp = Option<BinaryOp>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemCall {
    Print,
    ToInteger,
    ToDouble,
    ToString,
    Size,
    Type,
    GetTime,
    Sleep,
    RandInt,
    RandDouble,
    ClearVariable,
}

impl SystemCall {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "print" => SystemCall::Print,
            "to_integer" => SystemCall::ToInteger,
            "to_double" => SystemCall::ToDouble,
            "to_string" => SystemCall::ToString,
            "size" => SystemCall::Size,
            "type" => SystemCall::Type,
            "get_time" => SystemCall::GetTime,
            "sleep" => SystemCall::Sleep,
            "rand_int" => SystemCall::RandInt,
            "rand_double" => SystemCall::RandDouble,
            "clear_variable" => SystemCall::ClearVariable,
            _ => return None,
        })
    }

    /// Inclusive bounds on argument count.
    pub fn arity(self) -> (usize, usize) {
        match self {
            SystemCall::Print => (1, usize::MAX),
            SystemCall::ToInteger
            | SystemCall::ToDouble
            | SystemCall::Size
            | SystemCall::Type
            | SystemCall::Sleep
            | SystemCall::ClearVariable => (1, 1),
            SystemCall::ToString => (1, 2),
            SystemCall::GetTime => (0, 0),
            SystemCall::RandInt | SystemCall::RandDouble => (0, 2),
        }
    }
}

/// Assignment destination.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Variable(NameRef),
    Index { name: NameRef, index: Box<Node> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Record),
    Variable(NameRef),
    Index {
        name: NameRef,
        index: Box<Node>,
    },
    Assign {
        target: Target,
        op: AssignOp,
        value: Box<Node>,
    },
    /// Prefix `++` / `--`.
    Step {
        target: Target,
        delta: i64,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    /// `lhs => rhs`: rhs when lhs is true, otherwise 0.
    Implies(Box<Node>, Box<Node>),
    /// `lhs , rhs`: evaluates both, yields the greater.
    Both(Box<Node>, Box<Node>),
    /// `a ; b ; c`: yields the last.
    Sequence(Vec<Node>),
    Call {
        name: String,
        args: Vec<Node>,
    },
    System {
        call: SystemCall,
        args: Vec<Node>,
    },
}

impl Node {
    /// Longest root-to-leaf path, counted in nodes. Walks with an explicit
    /// stack so arbitrarily deep trees can be measured.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut pending = vec![(self, 1)];
        while let Some((node, depth)) = pending.pop() {
            deepest = deepest.max(depth);
            node.for_each_child(|child| pending.push((child, depth + 1)));
        }
        deepest
    }

    fn for_each_child<'a>(&'a self, mut visit: impl FnMut(&'a Node)) {
        match self {
            Node::Literal(_) | Node::Variable(_) => {}
            Node::Index { index, .. } => visit(index.as_ref()),
            Node::Assign { target, value, .. } => {
                if let Target::Index { index, .. } = target {
                    visit(index.as_ref());
                }
                visit(value.as_ref());
            }
            Node::Step { target, .. } => {
                if let Target::Index { index, .. } = target {
                    visit(index.as_ref());
                }
            }
            Node::Unary { operand, .. } => visit(operand.as_ref()),
            Node::Binary { lhs, rhs, .. }
            | Node::And(lhs, rhs)
            | Node::Or(lhs, rhs)
            | Node::Implies(lhs, rhs)
            | Node::Both(lhs, rhs) => {
                visit(lhs.as_ref());
                visit(rhs.as_ref());
            }
            Node::Sequence(items) | Node::Call { args: items, .. } | Node::System { args: items, .. } => {
                for item in items {
                    visit(item);
                }
            }
        }
    }

    fn literal(&self) -> Option<&Record> {
        match self {
            Node::Literal(record) => Some(record),
            _ => None,
        }
    }

    /// Folds side-effect-free subtrees of literals into literals. Folding
    /// that would fail (division by zero, type mismatch) is left for
    /// evaluation so the error surfaces at the same point either way.
    pub fn fold(self) -> Node {
        match self {
            Node::Unary { op, operand } => {
                let operand = operand.fold();
                if let Some(Ok(value)) = operand.literal().map(|r| op.apply(r)) {
                    return Node::Literal(value);
                }
                Node::Unary {
                    op,
                    operand: Box::new(operand),
                }
            }
            Node::Binary { op, lhs, rhs } => {
                let lhs = lhs.fold();
                let rhs = rhs.fold();
                if let (Some(a), Some(b)) = (lhs.literal(), rhs.literal()) {
                    if let Ok(value) = op.apply(a, b) {
                        return Node::Literal(value);
                    }
                }
                Node::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            }
            Node::And(lhs, rhs) => {
                let lhs = lhs.fold();
                let rhs = rhs.fold();
                match (lhs.literal(), rhs.literal()) {
                    (Some(a), _) if a.is_false() => Node::Literal(Record::integer(0)),
                    (Some(_), Some(b)) => Node::Literal(Record::integer(i64::from(b.is_true()))),
                    _ => Node::And(Box::new(lhs), Box::new(rhs)),
                }
            }
            Node::Or(lhs, rhs) => {
                let lhs = lhs.fold();
                let rhs = rhs.fold();
                match (lhs.literal(), rhs.literal()) {
                    (Some(a), _) if a.is_true() => Node::Literal(Record::integer(1)),
                    (Some(_), Some(b)) => Node::Literal(Record::integer(i64::from(b.is_true()))),
                    _ => Node::Or(Box::new(lhs), Box::new(rhs)),
                }
            }
            Node::Implies(lhs, rhs) => {
                let lhs = lhs.fold();
                let rhs = rhs.fold();
                match lhs.literal() {
                    Some(a) if a.is_false() => Node::Literal(Record::integer(0)),
                    Some(_) if rhs.literal().is_some() => rhs,
                    _ => Node::Implies(Box::new(lhs), Box::new(rhs)),
                }
            }
            Node::Both(lhs, rhs) => {
                let lhs = lhs.fold();
                let rhs = rhs.fold();
                match (lhs.literal(), rhs.literal()) {
                    (Some(a), Some(b)) => Node::Literal(ops::max(a.clone(), b.clone())),
                    _ => Node::Both(Box::new(lhs), Box::new(rhs)),
                }
            }
            Node::Sequence(items) => {
                let items: Vec<Node> = items.into_iter().map(Node::fold).collect();
                if items.iter().all(|item| item.literal().is_some()) {
                    return items
                        .into_iter()
                        .last()
                        .unwrap_or(Node::Literal(Record::empty()));
                }
                Node::Sequence(items)
            }
            Node::Index { name, index } => Node::Index {
                name,
                index: Box::new(index.fold()),
            },
            Node::Assign { target, op, value } => Node::Assign {
                target: target.fold(),
                op,
                value: Box::new(value.fold()),
            },
            Node::Step { target, delta } => Node::Step {
                target: target.fold(),
                delta,
            },
            Node::Call { name, args } => Node::Call {
                name,
                args: args.into_iter().map(Node::fold).collect(),
            },
            Node::System { call, args } => Node::System {
                call,
                args: args.into_iter().map(Node::fold).collect(),
            },
            leaf @ (Node::Literal(_) | Node::Variable(_)) => leaf,
        }
    }
}

impl Target {
    fn fold(self) -> Target {
        match self {
            Target::Index { name, index } => Target::Index {
                name,
                index: Box::new(index.fold()),
            },
            variable => variable,
        }
    }
}

/// Immutable, shareable expression tree.
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    source: Arc<str>,
    root: Arc<Node>,
}

impl CompiledExpression {
    pub(crate) fn new(source: &str, root: Node) -> Self {
        Self {
            source: Arc::from(source),
            root: Arc::new(root),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Node {
        &self.root
    }
}

impl PartialEq for CompiledExpression {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root
    }
}
