//! Lower the rule AST into flat rule tables the matcher walks.
//!
//! Each rule is a list of alternatives, each alternative a sequence of
//! [`Sym`]s. Groups and repetitions become synthesized rules, so the matcher
//! only ever sees character sets and rule references.

use std::collections::HashMap;

use super::parser::{Alternative, Repeat, RuleDef, Term};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sym {
    /// One code point in (or, when negated, outside) the inclusive ranges.
    Chars { negated: bool, ranges: Vec<(u32, u32)> },
    Rule(usize),
}

impl Sym {
    pub fn matches(&self, cp: u32) -> bool {
        match self {
            Sym::Chars { negated, ranges } => {
                ranges.iter().any(|&(lo, hi)| lo <= cp && cp <= hi) != *negated
            }
            Sym::Rule(_) => false,
        }
    }

    /// Could some code point in `[lo, hi]` match? Used for partial UTF-8.
    pub fn matches_any_in(&self, lo: u32, hi: u32) -> bool {
        match self {
            Sym::Chars { negated: false, ranges } => {
                ranges.iter().any(|&(a, b)| a <= hi && lo <= b)
            }
            Sym::Chars { negated: true, ranges } => {
                !ranges.iter().any(|&(a, b)| a <= lo && hi <= b)
            }
            Sym::Rule(_) => false,
        }
    }
}

/// Compiled rule tables, shared between grammar instances.
#[derive(Debug, Clone)]
pub struct CompiledGrammar {
    pub(crate) rules: Vec<Vec<Vec<Sym>>>,
    names: Vec<String>,
    pub(crate) root: usize,
}

impl CompiledGrammar {
    pub fn n_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn rule_name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn root(&self) -> usize {
        self.root
    }
}

struct Builder {
    ids: HashMap<String, usize>,
    names: Vec<String>,
    rules: Vec<Vec<Vec<Sym>>>,
}

impl Builder {
    fn fresh(&mut self, base: &str) -> usize {
        let id = self.rules.len();
        self.names.push(format!("{base}_{id}"));
        self.rules.push(Vec::new());
        id
    }

    fn lower_alternatives(&mut self, owner: &str, alts: &[Alternative]) -> Result<Vec<Vec<Sym>>> {
        alts.iter()
            .map(|Alternative(terms)| {
                let mut seq = Vec::new();
                for t in terms {
                    self.lower_term(owner, t, &mut seq)?;
                }
                Ok(seq)
            })
            .collect()
    }

    fn lower_term(&mut self, owner: &str, term: &Term, out: &mut Vec<Sym>) -> Result<()> {
        match term {
            Term::Literal(s) => out.extend(s.chars().map(|c| Sym::Chars {
                negated: false,
                ranges: vec![(c as u32, c as u32)],
            })),
            Term::Class { negated, ranges } => out.push(Sym::Chars {
                negated: *negated,
                ranges: ranges.iter().map(|&(a, b)| (a as u32, b as u32)).collect(),
            }),
            Term::Any => out.push(Sym::Chars {
                negated: true,
                ranges: Vec::new(),
            }),
            Term::Ref(name) => {
                let id = self.ids.get(name).copied().ok_or_else(|| {
                    Error::GrammarParse(format!("rule '{owner}' references undefined rule '{name}'"))
                })?;
                out.push(Sym::Rule(id));
            }
            Term::Group(alts) => {
                let id = self.fresh(owner);
                let lowered = self.lower_alternatives(owner, alts)?;
                self.rules[id] = lowered;
                out.push(Sym::Rule(id));
            }
            Term::Repeat(inner, kind) => {
                let mut body = Vec::new();
                self.lower_term(owner, inner, &mut body)?;
                let id = self.fresh(owner);
                let mut recur = body.clone();
                recur.push(Sym::Rule(id));
                self.rules[id] = match kind {
                    Repeat::ZeroOrMore => vec![recur, Vec::new()],
                    Repeat::OneOrMore => vec![recur, body],
                    Repeat::Optional => vec![body, Vec::new()],
                };
                out.push(Sym::Rule(id));
            }
        }
        Ok(())
    }
}

/// Compile parsed rules with `root` as the start symbol.
pub fn compile(defs: &[RuleDef], root: &str) -> Result<CompiledGrammar> {
    let mut b = Builder {
        ids: HashMap::new(),
        names: Vec::new(),
        rules: Vec::new(),
    };
    for def in defs {
        if b.ids.contains_key(&def.name) {
            return Err(Error::GrammarParse(format!("rule '{}' defined twice", def.name)));
        }
        b.ids.insert(def.name.clone(), b.names.len());
        b.names.push(def.name.clone());
        b.rules.push(Vec::new());
    }
    let root_id = *b
        .ids
        .get(root)
        .ok_or_else(|| Error::GrammarParse(format!("grammar has no rule named '{root}'")))?;

    for (id, def) in defs.iter().enumerate() {
        let lowered = b.lower_alternatives(&def.name, &def.alternatives)?;
        b.rules[id] = lowered;
    }

    let grammar = CompiledGrammar {
        rules: b.rules,
        names: b.names,
        root: root_id,
    };
    check_left_recursion(&grammar)?;
    Ok(grammar)
}

fn nullable_rules(g: &CompiledGrammar) -> Vec<bool> {
    let mut nullable = vec![false; g.rules.len()];
    loop {
        let mut changed = false;
        for (id, alts) in g.rules.iter().enumerate() {
            if nullable[id] {
                continue;
            }
            let eps = alts.iter().any(|seq| {
                seq.iter().all(|s| matches!(s, Sym::Rule(r) if nullable[*r]))
            });
            if eps {
                nullable[id] = true;
                changed = true;
            }
        }
        if !changed {
            return nullable;
        }
    }
}

/// A rule that can reach itself without consuming input would make the
/// matcher's stack expansion loop forever.
fn check_left_recursion(g: &CompiledGrammar) -> Result<()> {
    let nullable = nullable_rules(g);
    // rules reachable at the left edge of each rule
    let edges: Vec<Vec<usize>> = g
        .rules
        .iter()
        .map(|alts| {
            let mut out = Vec::new();
            for seq in alts {
                for sym in seq {
                    match sym {
                        Sym::Rule(r) => {
                            out.push(*r);
                            if !nullable[*r] {
                                break;
                            }
                        }
                        Sym::Chars { .. } => break,
                    }
                }
            }
            out
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }
    fn visit(id: usize, edges: &[Vec<usize>], marks: &mut [Mark]) -> Option<usize> {
        marks[id] = Mark::Active;
        for &next in &edges[id] {
            match marks[next] {
                Mark::Active => return Some(next),
                Mark::New => {
                    if let Some(hit) = visit(next, edges, marks) {
                        return Some(hit);
                    }
                }
                Mark::Done => {}
            }
        }
        marks[id] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; g.rules.len()];
    for id in 0..g.rules.len() {
        if marks[id] == Mark::New {
            if let Some(hit) = visit(id, &edges, &mut marks) {
                return Err(Error::GrammarParse(format!(
                    "rule '{}' is left-recursive",
                    g.rule_name(hit).unwrap_or("?")
                )));
            }
        }
    }
    Ok(())
}
