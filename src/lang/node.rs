use num_bigint::BigInt;

use super::position::SourcePosition;
use super::scope::StaticScope;

/// Syntax tree node for a Kiln program.
///
/// Scope resolution has already happened: locals are addressed by slot index
/// and closure depth, and every block carries its [`StaticScope`]. Every node
/// evaluates to exactly one value.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    // ───────────────────────────── Literals ─────────────────────────────
    Nil,
    True,
    False,
    SelfRef,
    Fixnum(i64),
    Bignum(BigInt),
    /// A fresh mutable string on every evaluation.
    Str(String),
    Symbol(String),
    Array(Vec<Node>),
    /// `[*x]`: copy an array, wrap anything else.
    ToArray(Box<Node>),

    // ───────────────────────────── Variables ────────────────────────────
    Local {
        index: usize,
        depth: usize,
    },
    /// Evaluates to the assigned value.
    LocalAsgn {
        index: usize,
        depth: usize,
        value: Box<Node>,
    },
    Ivar(String),
    IvarAsgn(String, Box<Node>),
    Global(String),
    GlobalAsgn(String, Box<Node>),
    Const(String),
    ConstAsgn(String, Box<Node>),

    // ─────────────────────────────── Calls ──────────────────────────────
    Call {
        receiver: Option<Box<Node>>,
        name: String,
        args: Vec<Node>,
        block: Option<Closure>,
    },
    Yield(Option<Box<Node>>),

    // ──────────────────────────── Control flow ──────────────────────────
    If {
        cond: Box<Node>,
        then: Box<Node>,
        otherwise: Option<Box<Node>>,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
    /// Evaluates to nil.
    While {
        cond: Box<Node>,
        body: Box<Node>,
        check_first: bool,
    },
    /// Value of the last statement; nil when empty.
    Seq(Vec<Node>),

    // ──────────────────────────── Definitions ───────────────────────────
    Def {
        name: String,
        arity: usize,
        locals: usize,
        body: Box<Node>,
    },
    Alias {
        new_name: String,
        old_name: String,
    },
    Lambda(Closure),

    /// Source position marker for the wrapped node.
    Newline(SourcePosition, Box<Node>),
}

/// A block literal: scope, arity and body.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub scope: StaticScope,
    pub arity: usize,
    pub body: Box<Node>,
}

impl Closure {
    pub fn new<S: Into<String>>(params: impl IntoIterator<Item = S>, body: Node) -> Self {
        let scope = StaticScope::block(params);
        Self {
            arity: scope.len(),
            scope,
            body: Box::new(body),
        }
    }

    /// Block with `arity` parameters and extra block-local variables.
    pub fn with_scope(scope: StaticScope, arity: usize, body: Node) -> Self {
        Self {
            scope,
            arity,
            body: Box::new(body),
        }
    }
}

// Builders used by the demos and tests.
impl Node {
    pub fn int(value: i64) -> Node {
        Node::Fixnum(value)
    }

    pub fn str(value: &str) -> Node {
        Node::Str(value.to_string())
    }

    pub fn sym(name: &str) -> Node {
        Node::Symbol(name.to_string())
    }

    pub fn local(index: usize) -> Node {
        Node::Local { index, depth: 0 }
    }

    pub fn outer(index: usize, depth: usize) -> Node {
        Node::Local { index, depth }
    }

    pub fn assign(index: usize, value: Node) -> Node {
        Node::LocalAsgn {
            index,
            depth: 0,
            value: Box::new(value),
        }
    }

    pub fn assign_outer(index: usize, depth: usize, value: Node) -> Node {
        Node::LocalAsgn {
            index,
            depth,
            value: Box::new(value),
        }
    }

    /// `recv.name(args)`
    pub fn call(receiver: Node, name: &str, args: Vec<Node>) -> Node {
        Node::Call {
            receiver: Some(Box::new(receiver)),
            name: name.to_string(),
            args,
            block: None,
        }
    }

    /// `name(args)` on the implicit self.
    pub fn fcall(name: &str, args: Vec<Node>) -> Node {
        Node::Call {
            receiver: None,
            name: name.to_string(),
            args,
            block: None,
        }
    }

    pub fn binop(left: Node, op: &str, right: Node) -> Node {
        Node::call(left, op, vec![right])
    }

    /// Attach a block to a call node. Other nodes are returned unchanged.
    pub fn with_block(self, closure: Closure) -> Node {
        match self {
            Node::Call {
                receiver,
                name,
                args,
                ..
            } => Node::Call {
                receiver,
                name,
                args,
                block: Some(closure),
            },
            other => other,
        }
    }

    pub fn if_else(cond: Node, then: Node, otherwise: Node) -> Node {
        Node::If {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Some(Box::new(otherwise)),
        }
    }

    pub fn while_loop(cond: Node, body: Node) -> Node {
        Node::While {
            cond: Box::new(cond),
            body: Box::new(body),
            check_first: true,
        }
    }

    pub fn do_while(body: Node, cond: Node) -> Node {
        Node::While {
            cond: Box::new(cond),
            body: Box::new(body),
            check_first: false,
        }
    }

    pub fn def(name: &str, arity: usize, locals: usize, body: Node) -> Node {
        Node::Def {
            name: name.to_string(),
            arity,
            locals,
            body: Box::new(body),
        }
    }

    pub fn line(file: &str, line: u32, body: Node) -> Node {
        Node::Newline(SourcePosition::new(file, line), Box::new(body))
    }
}
