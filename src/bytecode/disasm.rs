use std::collections::HashMap;
use std::fmt::Write;

use crate::bytecode::ir::{Constant, ConstantPool};
use crate::bytecode::{CodeObject, Op, ProgramBc};

/// Print disassembly of a bytecode program
pub fn print_bc(bc: &ProgramBc) {
    print!("{}", disassemble_program(bc));
}

/// Whole program, every code object in table order.
pub fn disassemble_program(bc: &ProgramBc) -> String {
    let mut out = String::from("=== BYTECODE PROGRAM ===\n\n");
    for (ci, code) in bc.code.iter().enumerate() {
        out.push_str(&disassemble_code(ci, code, &bc.constants));
        out.push('\n');
    }
    out
}

fn disassemble_code(ci: usize, code: &CodeObject, pool: &ConstantPool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " code[{}] {} `{}`", ci, code.kind, code.name);
    let _ = writeln!(
        out,
        " arity {}, {} locals, max stack {}, {} instructions",
        code.arity,
        code.local_count,
        code.max_stack,
        code.ops.len()
    );
    if !code.locals.is_empty() {
        let _ = writeln!(out, " locals: {}", code.locals.join(", "));
    }
    let _ = writeln!(out, "════════════════════════════════════════");
    out.push_str(&disassemble_to_string(code, pool));
    out
}

/// Return disassembly of one code object as a String
pub fn disassemble_to_string(code: &CodeObject, pool: &ConstantPool) -> String {
    let mut output = String::new();
    let jump_targets = collect_jump_targets(&code.ops);
    let mut lines = code.lines.iter().peekable();

    for (ip, op) in code.ops.iter().enumerate() {
        while let Some(entry) = lines.next_if(|entry| entry.ip as usize <= ip) {
            let _ = writeln!(output, "      ; line {}", entry.line);
        }

        if jump_targets.contains(&ip) {
            output.push_str("      ┌──────────────────────────────────\n");
        }

        let _ = write!(output, "{:04} ", ip);
        output.push_str(if jump_targets.contains(&ip) { "► " } else { "  " });
        output.push_str(&format_op(op, ip, pool));
        output.push('\n');
    }

    output
}

fn collect_jump_targets(ops: &[Op]) -> Vec<usize> {
    let mut targets = Vec::new();

    for (ip, op) in ops.iter().enumerate() {
        if let Some(offset) = op.jump_offset() {
            let target = (ip as i64 + offset as i64) as usize;
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }

    targets
}

fn name(pool: &ConstantPool, idx: u32) -> String {
    match pool.get(idx) {
        Some(Constant::Name(s)) => s.clone(),
        Some(Constant::String(s)) => format!("{:?}", s),
        Some(Constant::Symbol(s)) => format!(":{}", s),
        Some(Constant::Bignum(n)) => n.to_string(),
        None => format!("<bad constant {}>", idx),
    }
}

fn jump(mnemonic: &str, offset: i32, ip: usize) -> String {
    let target = ip as i64 + offset as i64;
    let direction = if offset < 0 { "↑" } else { "↓" };
    format!("{:<11} {:+} {} (→ {:04})", mnemonic, offset, direction, target)
}

fn format_op(op: &Op, ip: usize, pool: &ConstantPool) -> String {
    match op {
        Op::PushNil => "PUSH_NIL".to_string(),
        Op::PushTrue => "PUSH_TRUE".to_string(),
        Op::PushFalse => "PUSH_FALSE".to_string(),
        Op::PushSelf => "PUSH_SELF".to_string(),
        Op::PushFixnum(n) => format!("PUSH_FIXNUM {}", n),
        Op::PushBignum(i) => format!("PUSH_BIGNUM {}", name(pool, *i)),
        Op::PushString(i) => format!("PUSH_STRING {}", name(pool, *i)),
        Op::PushSymbol(i) => format!("PUSH_SYMBOL {}", name(pool, *i)),

        Op::Pop => "POP".to_string(),
        Op::Dup => "DUP".to_string(),

        Op::GetLocal(i) => format!("GET_LOCAL   {}", i),
        Op::SetLocal(i) => format!("SET_LOCAL   {}", i),
        Op::GetOuter { index, depth } => format!("GET_OUTER   {} ^{}", index, depth),
        Op::SetOuter { index, depth } => format!("SET_OUTER   {} ^{}", index, depth),
        Op::GetIvar(i) => format!("GET_IVAR    {}", name(pool, *i)),
        Op::SetIvar(i) => format!("SET_IVAR    {}", name(pool, *i)),
        Op::GetGlobal(i) => format!("GET_GLOBAL  {}", name(pool, *i)),
        Op::SetGlobal(i) => format!("SET_GLOBAL  {}", name(pool, *i)),
        Op::GetConst(i) => format!("GET_CONST   {}", name(pool, *i)),
        Op::SetConst(i) => format!("SET_CONST   {}", name(pool, *i)),

        Op::MakeArray(n) => format!("MAKE_ARRAY  {}          ; ( x1..x{} -- aggregate )", n, n),
        Op::ToArray => "TO_ARRAY".to_string(),

        Op::Send {
            name: n,
            argc,
            receiver,
            block,
        } => {
            let mut s = format!(
                "SEND        {} argc={}{}",
                name(pool, *n),
                argc,
                if *receiver { "" } else { " (self)" }
            );
            if let Some(block) = block {
                let _ = write!(s, " &code[{}]", block);
            }
            s
        }
        Op::Yield { argc } => format!("YIELD       argc={}", argc),
        Op::MakeClosure(code) => format!("MAKE_CLOSURE code[{}]", code),
        Op::DefineMethod { name: n, code } => {
            format!("DEFINE      {} = code[{}]", name(pool, *n), code)
        }
        Op::Alias { new_name, old_name } => format!(
            "ALIAS       {} {}",
            name(pool, *new_name),
            name(pool, *old_name)
        ),

        Op::Not => "NOT".to_string(),

        Op::Jump(offset) => jump("JUMP", *offset, ip),
        Op::JumpIfFalse(offset) => jump("JUMP_FALSE", *offset, ip),
        Op::JumpIfTrue(offset) => jump("JUMP_TRUE", *offset, ip),

        Op::Return => "RETURN".to_string(),
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Print bytecode statistics
pub fn print_bc_stats(bc: &ProgramBc) {
    println!("=== BYTECODE STATISTICS ===\n");

    let total_ops: usize = bc.code.iter().map(|c| c.ops.len()).sum();

    println!("Code objects:     {}", bc.code.len());
    println!("Constants:        {}", bc.constants.len());
    println!("Instructions:     {}", total_ops);
    println!();

    let mut op_counts: HashMap<&str, usize> = HashMap::new();
    for code in &bc.code {
        count_ops(&code.ops, &mut op_counts);
    }

    println!("Op frequency:");
    let mut counts: Vec<_> = op_counts.iter().collect();
    counts.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));

    for (op, count) in counts.iter().take(10) {
        let pct = (**count as f64 / total_ops.max(1) as f64) * 100.0;
        println!("  {:<14} {:>4} ({:>5.1}%)", op, count, pct);
    }
}

fn count_ops(ops: &[Op], counts: &mut HashMap<&'static str, usize>) {
    for op in ops {
        *counts.entry(op_name(op)).or_insert(0) += 1;
    }
}

fn op_name(op: &Op) -> &'static str {
    match op {
        Op::PushNil => "PUSH_NIL",
        Op::PushTrue => "PUSH_TRUE",
        Op::PushFalse => "PUSH_FALSE",
        Op::PushSelf => "PUSH_SELF",
        Op::PushFixnum(_) => "PUSH_FIXNUM",
        Op::PushBignum(_) => "PUSH_BIGNUM",
        Op::PushString(_) => "PUSH_STRING",
        Op::PushSymbol(_) => "PUSH_SYMBOL",
        Op::Pop => "POP",
        Op::Dup => "DUP",
        Op::GetLocal(_) => "GET_LOCAL",
        Op::SetLocal(_) => "SET_LOCAL",
        Op::GetOuter { .. } => "GET_OUTER",
        Op::SetOuter { .. } => "SET_OUTER",
        Op::GetIvar(_) => "GET_IVAR",
        Op::SetIvar(_) => "SET_IVAR",
        Op::GetGlobal(_) => "GET_GLOBAL",
        Op::SetGlobal(_) => "SET_GLOBAL",
        Op::GetConst(_) => "GET_CONST",
        Op::SetConst(_) => "SET_CONST",
        Op::MakeArray(_) => "MAKE_ARRAY",
        Op::ToArray => "TO_ARRAY",
        Op::Send { .. } => "SEND",
        Op::Yield { .. } => "YIELD",
        Op::MakeClosure(_) => "MAKE_CLOSURE",
        Op::DefineMethod { .. } => "DEFINE",
        Op::Alias { .. } => "ALIAS",
        Op::Not => "NOT",
        Op::Jump(_) => "JUMP",
        Op::JumpIfFalse(_) => "JUMP_FALSE",
        Op::JumpIfTrue(_) => "JUMP_TRUE",
        Op::Return => "RETURN",
    }
}
