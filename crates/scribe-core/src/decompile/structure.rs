//! Structural recovery over instruction-index space.
//!
//! Classifies the raw branches left by stack simulation into the
//! conservative shape set: `if`, `if/else`, `while`, `do/while`, and table
//! `switch`. A shape only matches when no branch from outside the construct
//! lands inside it and nothing jumps onto the jumps the shape absorbs;
//! everything else is preserved as goto/label pairs.
//!
//! Runs in two passes over the same items: the first discovers which pcs
//! end up as goto targets, the second emits labels at those pcs. The
//! classification itself is deterministic, so both passes agree.

use std::collections::{BTreeSet, HashMap};

use crate::ast::{Expr, Stmt, SwitchArm};
use crate::error::Diagnostic;

use super::{Item, ItemKind};

/// Invert a condition: flip comparisons, strip double negation.
pub(crate) fn invert(cond: Expr) -> Expr {
    match cond {
        Expr::Binary { op, lhs, rhs } => match op.inverse() {
            Some(inv) => Expr::Binary { op: inv, lhs, rhs },
            None => Expr::Not(Box::new(Expr::Binary { op, lhs, rhs })),
        },
        Expr::Not(inner) => *inner,
        Expr::BoolLit(b) => Expr::BoolLit(!b),
        other => Expr::Not(Box::new(other)),
    }
}

struct Builder<'a> {
    items: &'a [Item],
    /// All control transfers: (source pc, target pc).
    edges: Vec<(usize, usize)>,
    /// Label pcs attached to each item index (fixed after pass one).
    label_points: HashMap<usize, Vec<usize>>,
    /// Labels requested by fallbacks during the current pass.
    requested: BTreeSet<usize>,
    fallbacks: Vec<(usize, usize)>,
}

impl<'a> Builder<'a> {
    fn new(items: &'a [Item]) -> Self {
        let mut edges = Vec::new();
        for item in items {
            match &item.kind {
                ItemKind::Branch { target, .. } => edges.push((item.pc, *target)),
                ItemKind::Dispatch { cases, .. } => {
                    for &(_, target) in cases {
                        edges.push((item.pc, target));
                    }
                }
                ItemKind::Stmt(_) => {}
            }
        }
        Builder {
            items,
            edges,
            label_points: HashMap::new(),
            requested: BTreeSet::new(),
            fallbacks: Vec::new(),
        }
    }

    /// Index of the first item at or after `pc`.
    fn idx_at(&self, pc: usize) -> usize {
        self.items.partition_point(|it| it.pc < pc)
    }

    /// Whether a branch target is a usable region end within `[_, hi]`:
    /// in range and on an item boundary.
    fn region_end_ok(&self, j: usize, hi: usize, target: usize) -> bool {
        j <= hi && (j == self.items.len() || self.items[j].start_pc == target)
    }

    /// Any branch from outside `[region_lo, region_hi)` into the open
    /// interior `(interior_lo, interior_hi)`?
    fn has_external_entry(
        &self,
        interior_lo: usize,
        interior_hi: usize,
        region_lo: usize,
        region_hi: usize,
    ) -> bool {
        self.edges.iter().any(|&(s, t)| {
            t > interior_lo && t < interior_hi && (s < region_lo || s >= region_hi)
        })
    }

    /// Whether any jump lands on the pc span of the given item. A shape
    /// that would absorb such an item must not match, or the target label
    /// would never be emitted.
    fn targets_item(&self, idx: usize) -> bool {
        let lo = self.items[idx].start_pc;
        let hi = self.items[idx].pc;
        self.edges.iter().any(|&(_, t)| t >= lo && t <= hi)
    }

    fn goto(&mut self, out: &mut Vec<Stmt>, target: usize) {
        self.requested.insert(target);
        out.push(Stmt::Goto(target));
    }

    /// Find the backward conditional branch closing a do-while whose body
    /// starts at item `i`, if the shape holds.
    fn find_do_while(&self, i: usize, hi: usize) -> Option<usize> {
        let start = self.items[i].start_pc;
        for k in i..hi {
            let item = &self.items[k];
            if let ItemKind::Branch {
                cond: Some(_),
                target,
            } = &item.kind
            {
                if *target == start && *target <= item.pc {
                    if self.has_external_entry(start, item.pc, start, item.pc + 1) {
                        return None;
                    }
                    // Nothing but the loop's own back edge may land on the
                    // condition evaluation this shape absorbs.
                    let (span_lo, span_hi, back_pc) = (item.start_pc, item.pc, item.pc);
                    if self.edges.iter().any(|&(s, t)| {
                        t >= span_lo && t <= span_hi && !(s == back_pc && t == start)
                    }) {
                        return None;
                    }
                    return Some(k);
                }
            }
        }
        None
    }

    fn build_range(&mut self, lo: usize, hi: usize) -> Vec<Stmt> {
        let mut out = Vec::new();
        let mut i = lo;
        while i < hi {
            if let Some(labels) = self.label_points.get(&i).cloned() {
                for pc in labels {
                    out.push(Stmt::Label(pc));
                }
            }

            // A do-while body can start at any statement; check before
            // interpreting the item itself.
            if let Some(k) = self.find_do_while(i, hi) {
                let body = self.build_range(i, k);
                let cond = match &self.items[k].kind {
                    ItemKind::Branch { cond: Some(c), .. } => c.clone(),
                    _ => unreachable!("find_do_while only returns conditional branches"),
                };
                out.push(Stmt::DoWhile { body, cond });
                i = k + 1;
                continue;
            }

            let item = &self.items[i];
            match &item.kind {
                ItemKind::Stmt(s) => {
                    out.push(s.clone());
                    i += 1;
                }

                ItemKind::Dispatch { value, cases } => {
                    let (value, cases) = (value.clone(), cases.clone());
                    let (start_pc, pc) = (item.start_pc, item.pc);
                    match self.try_switch(i, hi, value.clone(), &cases) {
                        Some((stmt, next)) => {
                            out.push(stmt);
                            i = next;
                        }
                        None => {
                            // Semantic-preserving fallback: keep the
                            // dispatch, route every case through a goto.
                            self.fallbacks.push((start_pc, pc));
                            let mut arms: Vec<SwitchArm> = Vec::new();
                            for (case_value, target) in cases {
                                self.requested.insert(target);
                                match arms.iter_mut().find(|arm| {
                                    matches!(arm.body[..], [Stmt::Goto(t)] if t == target)
                                }) {
                                    Some(arm) => arm.values.push(case_value),
                                    None => arms.push(SwitchArm {
                                        values: vec![case_value],
                                        body: vec![Stmt::Goto(target)],
                                    }),
                                }
                            }
                            out.push(Stmt::Switch {
                                value,
                                arms,
                                default: None,
                            });
                            i += 1;
                        }
                    }
                }

                ItemKind::Branch { cond: None, target } => {
                    // Any unconsumed unconditional jump is a fallback.
                    self.fallbacks.push((item.start_pc, item.pc));
                    let target = *target;
                    self.goto(&mut out, target);
                    i += 1;
                }

                ItemKind::Branch {
                    cond: Some(c),
                    target,
                } => {
                    let (c, target) = (c.clone(), *target);
                    match self.try_conditional(i, hi, &c, target) {
                        Some((stmt, next)) => {
                            out.push(stmt);
                            i = next;
                        }
                        None => {
                            // `if (raw) goto target;` keeps the taken-path
                            // semantics of the raw branch.
                            self.fallbacks.push((self.items[i].start_pc, self.items[i].pc));
                            let mut then_body = Vec::new();
                            self.goto(&mut then_body, target);
                            out.push(Stmt::If {
                                cond: c,
                                then_body,
                                else_body: Vec::new(),
                            });
                            i += 1;
                        }
                    }
                }
            }
        }
        out
    }

    /// Classify a forward conditional branch at item `i` as while, if/else,
    /// or if. The raw condition jumps to `target` when true, so the source
    /// condition is its inverse.
    fn try_conditional(
        &mut self,
        i: usize,
        hi: usize,
        raw_cond: &Expr,
        target: usize,
    ) -> Option<(Stmt, usize)> {
        let b_pc = self.items[i].pc;
        let sb = self.items[i].start_pc;
        if target <= b_pc {
            return None;
        }
        let j = self.idx_at(target);
        if !self.region_end_ok(j, hi, target) {
            return None;
        }

        if j >= 1 && j - 1 > i {
            if let ItemKind::Branch {
                cond: None,
                target: last_target,
            } = self.items[j - 1].kind
            {
                // while: the protected region ends with a backward jump to
                // the condition start.
                if last_target == sb {
                    if self.has_external_entry(sb, target, sb, target)
                        || self.targets_item(j - 1)
                    {
                        return None;
                    }
                    let body = self.build_range(i + 1, j - 1);
                    return Some((
                        Stmt::While {
                            cond: invert(raw_cond.clone()),
                            body,
                        },
                        j,
                    ));
                }

                // if/else: the then region ends with a forward jump over
                // the else region to the join.
                if last_target >= target {
                    let join = last_target;
                    let k = self.idx_at(join);
                    if self.region_end_ok(k, hi, join)
                        && !self.has_external_entry(sb, join, sb, join)
                        && !self.targets_item(j - 1)
                    {
                        let then_body = self.build_range(i + 1, j - 1);
                        let else_body = self.build_range(j, k);
                        return Some((
                            Stmt::If {
                                cond: invert(raw_cond.clone()),
                                then_body,
                                else_body,
                            },
                            k,
                        ));
                    }
                }
            }
        }

        // plain if
        if self.has_external_entry(sb, target, sb, target) {
            return None;
        }
        let then_body = self.build_range(i + 1, j);
        Some((
            Stmt::If {
                cond: invert(raw_cond.clone()),
                then_body,
                else_body: Vec::new(),
            },
            j,
        ))
    }

    /// Classify a switch dispatch: case regions between the sorted case
    /// targets, each converging on one join with an unconditional jump; the
    /// fall-through region before the first case is the default.
    fn try_switch(
        &mut self,
        i: usize,
        hi: usize,
        value: Expr,
        cases: &[(i32, usize)],
    ) -> Option<(Stmt, usize)> {
        if cases.is_empty() {
            return None;
        }
        let b_pc = self.items[i].pc;
        let sb = self.items[i].start_pc;

        let mut targets: Vec<usize> = cases.iter().map(|&(_, t)| t).collect();
        targets.sort_unstable();
        targets.dedup();
        if targets[0] <= b_pc {
            return None;
        }

        // The default region runs from the dispatch to the first case and
        // must end with the jump to the join.
        let d_end = self.idx_at(targets[0]);
        if d_end <= i || !self.region_end_ok(d_end, hi, targets[0]) {
            return None;
        }
        let join = match self.items[d_end - 1].kind {
            ItemKind::Branch {
                cond: None,
                target,
            } if target > *targets.last().unwrap() => target,
            _ => return None,
        };
        let j_end = self.idx_at(join);
        if !self.region_end_ok(j_end, hi, join) {
            return None;
        }
        if self.has_external_entry(b_pc, join, sb, join) {
            return None;
        }

        // Each case region must also converge on the join; the converging
        // jumps themselves must not be jump targets.
        let mut regions = Vec::with_capacity(targets.len());
        let mut consumed_jumps = vec![d_end - 1];
        for (n, &t) in targets.iter().enumerate() {
            let rs = self.idx_at(t);
            let re = match targets.get(n + 1) {
                Some(&next) => self.idx_at(next),
                None => j_end,
            };
            if re <= rs {
                return None;
            }
            match self.items[re - 1].kind {
                ItemKind::Branch {
                    cond: None,
                    target,
                } if target == join => {}
                _ => return None,
            }
            consumed_jumps.push(re - 1);
            let values: Vec<i32> = cases
                .iter()
                .filter(|&&(_, ct)| ct == t)
                .map(|&(v, _)| v)
                .collect();
            regions.push((values, rs, re - 1));
        }
        if consumed_jumps.iter().any(|&g| self.targets_item(g)) {
            return None;
        }

        let default = {
            let body = self.build_range(i + 1, d_end - 1);
            if body.is_empty() {
                None
            } else {
                Some(body)
            }
        };
        let arms = regions
            .into_iter()
            .map(|(values, rs, re)| SwitchArm {
                values,
                body: self.build_range(rs, re),
            })
            .collect();

        Some((
            Stmt::Switch {
                value,
                arms,
                default,
            },
            j_end,
        ))
    }
}

/// Recover structured statements from the linearized items.
pub(crate) fn structure(items: &[Item], diags: &mut Vec<Diagnostic>) -> Vec<Stmt> {
    let mut b = Builder::new(items);

    // Pass one: discover fallback goto targets.
    b.build_range(0, items.len());

    // Pass two: emit, with labels placed at the discovered targets.
    let labels = std::mem::take(&mut b.requested);
    b.fallbacks.clear();
    let mut label_points: HashMap<usize, Vec<usize>> = HashMap::new();
    for &pc in &labels {
        let idx = b.idx_at(pc);
        label_points.entry(idx).or_default().push(pc);
    }
    for points in label_points.values_mut() {
        points.sort_unstable();
    }
    b.label_points = label_points;

    let body = b.build_range(0, items.len());
    for (start, end) in std::mem::take(&mut b.fallbacks) {
        diags.push(Diagnostic::GotoFallback { start, end });
    }
    body
}
