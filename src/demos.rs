//! Built-in sample programs, already scope-resolved.

use num_bigint::BigInt;

use crate::lang::node::{Closure, Node};

pub struct Demo {
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> Node,
}

impl Demo {
    pub fn program(&self) -> Node {
        (self.build)()
    }
}

const DEMOS: &[Demo] = &[
    Demo {
        name: "fib",
        description: "recursive method definition and dispatch",
        build: fib,
    },
    Demo {
        name: "closures",
        description: "blocks, yield and lambdas sharing an outer local",
        build: closures,
    },
    Demo {
        name: "loops",
        description: "pre-test and post-test loops, Integer#times",
        build: loops,
    },
    Demo {
        name: "strings",
        description: "mutable strings, symbols, globals, constants, aliases, bignums",
        build: strings,
    },
];

pub fn all() -> &'static [Demo] {
    DEMOS
}

pub fn find(name: &str) -> Option<&'static Demo> {
    DEMOS.iter().find(|demo| demo.name == name)
}

/// Wrap each statement in a line marker, numbering from 1.
fn script(file: &str, statements: Vec<Node>) -> Node {
    Node::Seq(
        statements
            .into_iter()
            .enumerate()
            .map(|(i, statement)| Node::line(file, i as u32 + 1, statement))
            .collect(),
    )
}

fn puts(value: Node) -> Node {
    Node::fcall("puts", vec![value])
}

// def fib(n)
//   if n < 2 then n else fib(n - 1) + fib(n - 2) end
// end
// puts fib(20)
fn fib() -> Node {
    let n = || Node::local(0);
    let recurse = |k| Node::fcall("fib", vec![Node::binop(n(), "-", Node::int(k))]);

    script(
        "fib.kn",
        vec![
            Node::def(
                "fib",
                1,
                1,
                Node::if_else(
                    Node::binop(n(), "<", Node::int(2)),
                    n(),
                    Node::binop(recurse(1), "+", recurse(2)),
                ),
            ),
            puts(Node::fcall("fib", vec![Node::int(20)])),
        ],
    )
}

// def each_twice(x); yield x; yield x; end
// total = 0
// [1, 2, 3].each { |n| total = total + n }
// each_twice(10) { |n| total = total + n }
// puts total
// counter = lambda { |step| total = total + step }
// counter.call(4)
// puts total
// squares = [1, 2, 3].map { |x| x * x }
// puts squares.join(", ")
fn closures() -> Node {
    let add_to_total = || {
        Closure::new(
            ["n"],
            Node::assign_outer(
                0,
                1,
                Node::binop(Node::outer(0, 1), "+", Node::local(0)),
            ),
        )
    };
    let one_two_three = || Node::Array(vec![Node::int(1), Node::int(2), Node::int(3)]);

    script(
        "closures.kn",
        vec![
            Node::def(
                "each_twice",
                1,
                1,
                Node::Seq(vec![
                    Node::Yield(Some(Box::new(Node::local(0)))),
                    Node::Yield(Some(Box::new(Node::local(0)))),
                ]),
            ),
            Node::assign(0, Node::int(0)),
            Node::call(one_two_three(), "each", vec![]).with_block(add_to_total()),
            Node::fcall("each_twice", vec![Node::int(10)]).with_block(add_to_total()),
            puts(Node::local(0)),
            Node::assign(1, Node::Lambda(add_to_total())),
            Node::call(Node::local(1), "call", vec![Node::int(4)]),
            puts(Node::local(0)),
            Node::assign(
                2,
                Node::call(one_two_three(), "map", vec![]).with_block(Closure::new(
                    ["x"],
                    Node::binop(Node::local(0), "*", Node::local(0)),
                )),
            ),
            puts(Node::call(Node::local(2), "join", vec![Node::str(", ")])),
        ],
    )
}

// i = 0
// while i < 5; print i; i = i + 1; end
// puts ""
// j = 10
// begin; puts j; j = j + 1; end while j < 3
// 3.times { |k| puts k * k }
fn loops() -> Node {
    let i = || Node::local(0);
    let j = || Node::local(1);

    script(
        "loops.kn",
        vec![
            Node::assign(0, Node::int(0)),
            Node::while_loop(
                Node::binop(i(), "<", Node::int(5)),
                Node::Seq(vec![
                    Node::fcall("print", vec![i()]),
                    Node::assign(0, Node::binop(i(), "+", Node::int(1))),
                ]),
            ),
            puts(Node::str("")),
            Node::assign(1, Node::int(10)),
            Node::do_while(
                Node::Seq(vec![
                    puts(j()),
                    Node::assign(1, Node::binop(j(), "+", Node::int(1))),
                ]),
                Node::binop(j(), "<", Node::int(3)),
            ),
            Node::call(Node::int(3), "times", vec![]).with_block(Closure::new(
                ["k"],
                puts(Node::binop(Node::local(0), "*", Node::local(0))),
            )),
        ],
    )
}

// a = "kiln"; b = "kiln"; a << "!"
// puts a; puts b
// puts :sym.equal?(:sym)
// alias say puts
// say "aliased"
// $greeting = "hi"; puts $greeting
// Answer = 42; puts Answer
// @name = "main"; puts @name
// f = 1; n = 1; while n <= 25; f = f * n; n = n + 1; end; puts f
// puts 123456789012345678901234567890 + 1
fn strings() -> Node {
    let big: BigInt = "123456789012345678901234567890"
        .parse()
        .unwrap_or_default();

    script(
        "strings.kn",
        vec![
            Node::assign(0, Node::str("kiln")),
            Node::assign(1, Node::str("kiln")),
            Node::binop(Node::local(0), "<<", Node::str("!")),
            puts(Node::local(0)),
            puts(Node::local(1)),
            puts(Node::call(Node::sym("sym"), "equal?", vec![Node::sym("sym")])),
            Node::Alias {
                new_name: "say".to_string(),
                old_name: "puts".to_string(),
            },
            Node::fcall("say", vec![Node::str("aliased")]),
            Node::GlobalAsgn("$greeting".to_string(), Box::new(Node::str("hi"))),
            puts(Node::Global("$greeting".to_string())),
            Node::ConstAsgn("Answer".to_string(), Box::new(Node::int(42))),
            puts(Node::Const("Answer".to_string())),
            Node::IvarAsgn("@name".to_string(), Box::new(Node::str("main"))),
            puts(Node::Ivar("@name".to_string())),
            Node::assign(2, Node::int(1)),
            Node::assign(3, Node::int(1)),
            Node::while_loop(
                Node::binop(Node::local(3), "<=", Node::int(25)),
                Node::Seq(vec![
                    Node::assign(2, Node::binop(Node::local(2), "*", Node::local(3))),
                    Node::assign(3, Node::binop(Node::local(3), "+", Node::int(1))),
                ]),
            ),
            puts(Node::local(2)),
            puts(Node::binop(Node::Bignum(big), "+", Node::int(1))),
        ],
    )
}
