//! Call-site inlining used by the `inline` call policy.
//!
//! Each round splits the caller at every call to a defined function and
//! splices in a renamed copy of the callee. Calls introduced by a round are
//! only expanded by the next one, so `depth` bounds recursive inlining.

use crate::ir::*;
use log::{debug, trace};
use std::collections::HashMap;

//
// Public Interface
//

/// Returns a copy of `function` with calls to defined functions inlined
/// up to `depth` levels. Callees for which `keep` returns true stay calls.
pub fn inline_calls<F>(module: &Module, function: &Function, depth: u32, keep: F) -> Function
where
    F: Fn(&str) -> bool,
{
    let mut result = function.clone();
    let mut site = 0;

    for round in 0..depth {
        let mut blocks = Vec::with_capacity(result.blocks.len());
        let mut renames: Vec<(String, String, String)> = Vec::new();
        let mut changed = false;

        for block in result.blocks.drain(..) {
            let mut current = block;
            loop {
                let index = current
                    .instructions
                    .iter()
                    .position(|i| inlinable(module, i, &keep).is_some());
                let (index, callee) = match index {
                    Some(index) => match inlinable(module, &current.instructions[index], &keep) {
                        Some(callee) => (index, callee),
                        None => break,
                    },
                    None => break,
                };
                site += 1;
                changed = true;
                let (pre, body, cont) = split_at_call(current, index, callee, site, &mut renames);
                blocks.push(pre);
                blocks.extend(body);
                current = cont;
            }
            blocks.push(current);
        }

        for (successor, old, new) in &renames {
            if let Some(block) = blocks.iter_mut().find(|b| &b.label == successor) {
                rename_phi_predecessor(block, old, new);
            }
        }
        result.blocks = blocks;

        if !changed {
            break;
        }
        debug!("@{}: inlining round {} expanded calls", function.name, round + 1);
    }

    result
}

//
// Private Implementation
//

fn inlinable<'a, F>(module: &'a Module, instruction: &Instruction, keep: &F) -> Option<&'a Function>
where
    F: Fn(&str) -> bool,
{
    match &instruction.kind {
        InstructionKind::Call { callee, args, .. } => {
            let target = module.function(callee)?;
            let eligible = !target.is_declaration()
                && !target.variadic
                && target.unsupported.is_none()
                && target.params.len() == args.len()
                && !keep(callee);
            if eligible {
                Some(target)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn split_at_call(
    mut current: Block,
    index: usize,
    callee: &Function,
    site: usize,
    renames: &mut Vec<(String, String, String)>,
) -> (Block, Vec<Block>, Block) {
    let prefix = format!("{}.i{}.", callee.name, site);
    let cont_label = format!("{}.split{}", current.label, site);

    let tail = current.instructions.split_off(index + 1);
    let call = current.instructions.pop();
    let entry = callee
        .entry()
        .map(|b| format!("{}{}", prefix, b.label))
        .unwrap_or_else(|| cont_label.clone());
    let terminator = std::mem::replace(&mut current.terminator, Terminator::Br(entry));
    for successor in terminator.successors() {
        renames.push((
            successor.to_string(),
            current.label.clone(),
            cont_label.clone(),
        ));
    }

    let (result, args, line) = match call {
        Some(Instruction {
            result,
            kind: InstructionKind::Call { args, .. },
            line,
        }) => (result, args, line),
        _ => (None, Vec::new(), current.terminator_line),
    };
    trace!("inlining @{} at line {} as {}*", callee.name, line, prefix);

    let renamer = Renamer {
        prefix: &prefix,
        arguments: callee
            .params
            .iter()
            .map(|p| p.name.clone())
            .zip(args.into_iter().map(|a| a.operand))
            .collect(),
    };

    let mut returns = Vec::new();
    let body = callee
        .blocks
        .iter()
        .map(|block| {
            let label = renamer.label(&block.label);
            let terminator = match &block.terminator {
                Terminator::Ret(value) => {
                    if let Some(value) = value {
                        returns.push((renamer.operand(&value.operand), label.clone()));
                    }
                    Terminator::Br(cont_label.clone())
                }
                other => renamer.terminator(other),
            };
            Block {
                label,
                instructions: block
                    .instructions
                    .iter()
                    .map(|i| Instruction {
                        result: i.result.as_ref().map(|r| renamer.local(r)),
                        kind: renamer.kind(&i.kind),
                        line: i.line,
                    })
                    .collect(),
                terminator,
                terminator_line: block.terminator_line,
            }
        })
        .collect();

    let mut instructions = Vec::with_capacity(tail.len() + 1);
    if let Some(result) = result {
        let kind = if returns.is_empty() {
            // callee never returns, the continuation is dead
            InstructionKind::Freeze {
                value: TypedOperand {
                    ty: callee.ret.clone(),
                    operand: Operand::Undef,
                },
            }
        } else {
            InstructionKind::Phi {
                ty: callee.ret.clone(),
                incoming: returns,
            }
        };
        instructions.push(Instruction {
            result: Some(result),
            kind,
            line,
        });
    }
    instructions.extend(tail);

    let cont = Block {
        label: cont_label,
        instructions,
        terminator,
        terminator_line: current.terminator_line,
    };
    (current, body, cont)
}

fn rename_phi_predecessor(block: &mut Block, old: &str, new: &str) {
    for instruction in &mut block.instructions {
        if let InstructionKind::Phi { incoming, .. } = &mut instruction.kind {
            for (_, label) in incoming.iter_mut() {
                if label == old {
                    *label = new.to_string();
                }
            }
        }
    }
}

struct Renamer<'a> {
    prefix: &'a str,
    arguments: HashMap<String, Operand>,
}

impl Renamer<'_> {
    fn local(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn label(&self, label: &str) -> String {
        format!("{}{}", self.prefix, label)
    }

    fn operand(&self, operand: &Operand) -> Operand {
        match operand {
            Operand::Local(name) => match self.arguments.get(name) {
                Some(argument) => argument.clone(),
                None => Operand::Local(self.local(name)),
            },
            Operand::ConstExpr(expr) => Operand::ConstExpr(Box::new(match expr.as_ref() {
                ConstExpr::Gep {
                    source,
                    base,
                    indices,
                } => ConstExpr::Gep {
                    source: source.clone(),
                    base: self.typed(base),
                    indices: indices.iter().map(|i| self.typed(i)).collect(),
                },
                ConstExpr::Cast { op, value, to } => ConstExpr::Cast {
                    op: *op,
                    value: self.typed(value),
                    to: to.clone(),
                },
            })),
            other => other.clone(),
        }
    }

    fn typed(&self, value: &TypedOperand) -> TypedOperand {
        TypedOperand {
            ty: value.ty.clone(),
            operand: self.operand(&value.operand),
        }
    }

    #[rustfmt::skip]
    fn kind(&self, kind: &InstructionKind) -> InstructionKind {
        use InstructionKind::*;
        match kind {
            Binary { op, ty, left, right } => Binary { op: *op, ty: ty.clone(), left: self.operand(left), right: self.operand(right) },
            ICmp { predicate, ty, left, right } => ICmp { predicate: *predicate, ty: ty.clone(), left: self.operand(left), right: self.operand(right) },
            Select { cond, ty, then, otherwise } => Select { cond: self.operand(cond), ty: ty.clone(), then: self.operand(then), otherwise: self.operand(otherwise) },
            Cast { op, value, to } => Cast { op: *op, value: self.typed(value), to: to.clone() },
            Freeze { value } => Freeze { value: self.typed(value) },
            Alloca { ty, count } => Alloca { ty: ty.clone(), count: count.as_ref().map(|c| self.typed(c)) },
            Load { ty, address } => Load { ty: ty.clone(), address: self.operand(address) },
            Store { value, address } => Store { value: self.typed(value), address: self.operand(address) },
            Gep { source, base, indices } => Gep { source: source.clone(), base: self.operand(base), indices: indices.iter().map(|i| self.typed(i)).collect() },
            Phi { ty, incoming } => Phi { ty: ty.clone(), incoming: incoming.iter().map(|(v, l)| (self.operand(v), self.label(l))).collect() },
            Call { callee, ret, args } => Call { callee: callee.clone(), ret: ret.clone(), args: args.iter().map(|a| self.typed(a)).collect() },
            Unsupported { construct } => Unsupported { construct: construct.clone() },
        }
    }

    fn terminator(&self, terminator: &Terminator) -> Terminator {
        match terminator {
            Terminator::Br(target) => Terminator::Br(self.label(target)),
            Terminator::CondBr {
                cond,
                then,
                otherwise,
            } => Terminator::CondBr {
                cond: self.operand(cond),
                then: self.label(then),
                otherwise: self.label(otherwise),
            },
            Terminator::Switch {
                ty,
                value,
                default,
                cases,
            } => Terminator::Switch {
                ty: ty.clone(),
                value: self.operand(value),
                default: self.label(default),
                cases: cases.iter().map(|(v, l)| (*v, self.label(l))).collect(),
            },
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;

    const CALLER: &str = r#"
define i32 @twice(i32 %v) {
entry:
  %d = add i32 %v, %v
  ret i32 %d
}

define i32 @f(i32 %x) {
entry:
  %a = call i32 @twice(i32 %x)
  %b = call i32 @twice(i32 %a)
  br label %exit
exit:
  %r = phi i32 [ %b, %entry ]
  ret i32 %r
}
"#;

    #[test]
    fn splices_callee_and_fixes_successor_phis() {
        let module = parse_module(CALLER).expect("parses");
        let f = module.function("f").unwrap();
        let inlined = inline_calls(&module, f, 1, |_| false);

        let calls = inlined
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| matches!(i.kind, InstructionKind::Call { .. }))
            .count();
        assert_eq!(calls, 0);

        let exit = inlined.block("exit").unwrap();
        match &exit.instructions[0].kind {
            InstructionKind::Phi { incoming, .. } => assert_eq!(incoming[0].1, "entry.split1.split2"),
            other => panic!("expected phi, got {:?}", other),
        }

        let body = inlined.block("twice.i1.entry").unwrap();
        assert_eq!(
            body.instructions[0].kind,
            InstructionKind::Binary {
                op: BinaryOp::Add,
                ty: Type::Int(32),
                left: Operand::Local("x".to_string()),
                right: Operand::Local("x".to_string()),
            }
        );
    }

    #[test]
    fn kept_callees_and_zero_depth_are_untouched() {
        let module = parse_module(CALLER).expect("parses");
        let f = module.function("f").unwrap();
        assert_eq!(&inline_calls(&module, f, 0, |_| false), f);
        assert_eq!(&inline_calls(&module, f, 4, |name| name == "twice"), f);
    }
}
