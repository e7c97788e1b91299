//! SMT-LIB2 rendering of sorts and terms.

use super::{Expr, ExprRef, Sort, ADDRESS_BITS};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;

//
// Public Interface
//

/// Shorthand names for shared subterms, keyed by term identity.
pub type Names = HashMap<ExprRef, String>;

pub fn sort_to_string(sort: Sort) -> String {
    match sort {
        Sort::Bool => "Bool".to_string(),
        Sort::BitVec(width) => format!("(_ BitVec {})", width),
        Sort::Memory => format!("(Array (_ BitVec {}) (_ BitVec 8))", ADDRESS_BITS),
    }
}

/// Quotes a symbol with `|` unless it is a legal simple symbol.
pub fn symbol(name: &str) -> String {
    const EXTRA: &str = "~!@$%^&*_-+=<>.?/";
    let simple = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || EXTRA.contains(c));
    if simple {
        name.to_string()
    } else {
        format!("|{}|", name.replace(|c| c == '|' || c == '\\', "_"))
    }
}

pub fn constant(value: u128, width: u32) -> String {
    if width % 4 == 0 {
        format!("#x{:0w$x}", value, w = (width / 4) as usize)
    } else {
        format!("#b{:0w$b}", value, w = width as usize)
    }
}

/// Renders a term with every subterm expanded.
pub fn term_to_string(term: &ExprRef) -> String {
    let mut out = String::new();
    write_term(&mut out, term, &Names::new());
    out
}

/// Renders a term, printing registered subterms by name. The root is
/// always expanded so a definition can be printed with its own name
/// registered.
pub fn write_term(out: &mut String, term: &ExprRef, names: &Names) {
    enum Item {
        Term(ExprRef, bool),
        Text(&'static str),
    }

    let mut stack = vec![Item::Term(term.clone(), true)];
    while let Some(item) = stack.pop() {
        let (term, root) = match item {
            Item::Text(text) => {
                out.push_str(text);
                continue;
            }
            Item::Term(term, root) => (term, root),
        };
        if !root {
            if let Some(name) = names.get(&term) {
                out.push_str(&symbol(name));
                continue;
            }
        }

        let children: Vec<ExprRef> = term.children().into_iter().cloned().collect();
        match term.expr() {
            Expr::Bool(b) => {
                let _ = write!(out, "{}", b);
                continue;
            }
            Expr::Const { value, width } => {
                out.push_str(&constant(*value, *width));
                continue;
            }
            Expr::Var { name, .. } => {
                out.push_str(&symbol(name));
                continue;
            }
            Expr::Apply { function, args, .. } if args.is_empty() => {
                out.push_str(&symbol(function));
                continue;
            }
            Expr::Not(_) => out.push_str("(not"),
            Expr::And(_) => out.push_str("(and"),
            Expr::Or(_) => out.push_str("(or"),
            Expr::Ite { .. } => out.push_str("(ite"),
            Expr::Eq(..) => out.push_str("(="),
            Expr::Binary { op, .. } => {
                let _ = write!(out, "({}", op);
            }
            Expr::Compare { op, .. } => {
                let _ = write!(out, "({}", op);
            }
            Expr::Extract { high, low, .. } => {
                let _ = write!(out, "((_ extract {} {})", high, low);
            }
            Expr::Concat(..) => out.push_str("(concat"),
            Expr::ZeroExt { by, .. } => {
                let _ = write!(out, "((_ zero_extend {})", by);
            }
            Expr::SignExt { by, .. } => {
                let _ = write!(out, "((_ sign_extend {})", by);
            }
            Expr::Select { .. } => out.push_str("(select"),
            Expr::Store { .. } => out.push_str("(store"),
            Expr::Apply { function, .. } => {
                let _ = write!(out, "({}", symbol(function));
            }
        }
        stack.push(Item::Text(")"));
        for child in children.into_iter().rev() {
            stack.push(Item::Term(child, false));
            stack.push(Item::Text(" "));
        }
    }
}

/// Smallest standard logic covering the given terms.
pub fn logic<'a, I>(terms: I) -> &'static str
where
    I: IntoIterator<Item = &'a ExprRef>,
{
    let mut arrays = false;
    let mut functions = false;
    let mut seen: HashSet<ExprRef> = HashSet::new();
    let mut stack: Vec<ExprRef> = terms.into_iter().cloned().collect();
    while let Some(term) = stack.pop() {
        if !seen.insert(term.clone()) {
            continue;
        }
        arrays |= term.sort() == Sort::Memory;
        functions |= matches!(term.expr(), Expr::Apply { .. });
        stack.extend(term.children().into_iter().cloned());
    }
    match (arrays, functions) {
        (false, false) => "QF_BV",
        (true, false) => "QF_ABV",
        (false, true) => "QF_UFBV",
        (true, true) => "QF_AUFBV",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::{BvCmp, ExprPool};

    #[test]
    fn prints_constants_in_hex_or_binary() {
        assert_eq!(constant(44, 8), "#x2c");
        assert_eq!(constant(1, 1), "#b1");
        assert_eq!(constant(5, 3), "#b101");
        assert_eq!(constant(0, 32), "#x00000000");
    }

    #[test]
    fn quotes_symbols_only_when_needed() {
        assert_eq!(symbol("f.%x!1"), "f.%x!1");
        assert_eq!(symbol("0bad"), "|0bad|");
        assert_eq!(symbol("with space"), "|with space|");
    }

    #[test]
    fn named_subterms_print_by_name_except_at_the_root() {
        let pool = ExprPool::new();
        let x = pool.var("x", Sort::BitVec(32));
        let positive = pool.compare(BvCmp::Sgt, &x, &pool.bv(0, 32));
        let guarded = pool.and2(&positive, &pool.var("c", Sort::Bool));

        let mut names = Names::new();
        names.insert(positive.clone(), "p".to_string());

        let mut out = String::new();
        write_term(&mut out, &guarded, &names);
        assert_eq!(out, "(and p c)");

        let mut out = String::new();
        write_term(&mut out, &positive, &names);
        assert_eq!(out, "(bvsgt x #x00000000)");
    }

    #[test]
    fn logic_reflects_arrays_and_functions() {
        let pool = ExprPool::new();
        let x = pool.var("x", Sort::BitVec(8));
        assert_eq!(logic([&x]), "QF_BV");
        let m = pool.var("m", Sort::Memory);
        let read = pool.select(&m, &pool.bv(0, 64));
        assert_eq!(logic([&read]), "QF_ABV");
        let call = pool.apply("g", &[x], Sort::BitVec(8));
        assert_eq!(logic([&read, &call]), "QF_AUFBV");
    }
}
