//! The build-graph arena shared by `amake`'s evaluator and executor: rules,
//! targets, and the blocker/blocked dependency edges between them.
//!
//! Rules live in a flat arena (`Vec<Rule>`) and reference each other purely
//! by index (`RuleId`), which keeps the graph free of ownership cycles and
//! makes it trivial to walk and serialize for tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    /// Stale: needs to (re)run, or hasn't been looked at yet.
    Dirty,
    /// A child process (or in-process builtin) for this rule is running.
    Building,
    /// Finished successfully.
    Done,
    /// A command exited nonzero, or the rule could not be launched.
    Failed,
    /// Never launched because a (transitive) blocker failed.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub outputs: Vec<PathBuf>,
    pub commands: Vec<String>,
    pub depends: Vec<PathBuf>,
    pub comment: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub state: RuleState,
    pub blockers: Vec<RuleId>,
    pub blocked: Vec<RuleId>,
    /// Index of the next command in `commands` still to run.
    pub next_command: usize,
}

impl Rule {
    fn new(
        outputs: Vec<PathBuf>,
        commands: Vec<String>,
        depends: Vec<PathBuf>,
        comment: Option<String>,
        working_dir: Option<PathBuf>,
    ) -> Self {
        Rule {
            outputs,
            commands,
            depends,
            comment,
            working_dir,
            state: RuleState::Dirty,
            blockers: Vec::new(),
            blocked: Vec::new(),
            next_command: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            RuleState::Done | RuleState::Failed | RuleState::Skipped
        )
    }
}

#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub depends: Vec<String>,
    pub commands: Vec<String>,
    pub default: bool,
    pub uses_terminal: bool,
}

#[derive(Debug, Default)]
pub struct Graph {
    pub rules: Vec<Rule>,
    pub targets: Vec<Target>,
    output_index: HashMap<PathBuf, RuleId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(
        &mut self,
        outputs: Vec<PathBuf>,
        commands: Vec<String>,
        depends: Vec<PathBuf>,
        comment: Option<String>,
        working_dir: Option<PathBuf>,
    ) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        for out in &outputs {
            self.output_index.insert(out.clone(), id);
        }
        self.rules
            .push(Rule::new(outputs, commands, depends, comment, working_dir));
        id
    }

    pub fn add_target(
        &mut self,
        name: String,
        depends: Vec<String>,
        commands: Vec<String>,
        default: bool,
        uses_terminal: bool,
    ) {
        self.targets.push(Target {
            name,
            depends,
            commands,
            default,
            uses_terminal,
        });
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    pub fn rule_mut(&mut self, id: RuleId) -> &mut Rule {
        &mut self.rules[id.0 as usize]
    }

    pub fn producer_of(&self, path: &Path) -> Option<RuleId> {
        self.output_index.get(path).copied()
    }

    /// A rule is ready to launch once it's still `Dirty` and every blocker
    /// has reached a terminal state. Computed on demand from `blockers`
    /// rather than cached, so it's always correct as the executor loop
    /// advances rules to `Done`/`Failed`/`Skipped` (spec §3).
    pub fn is_ready(&self, id: RuleId) -> bool {
        let rule = self.rule(id);
        rule.state == RuleState::Dirty
            && rule.blockers.iter().all(|b| self.rule(*b).is_terminal())
    }

    /// Resolves every rule's `depends` against the set of known rule
    /// outputs and builds deduplicated blocker/blocked edges. Safe to call
    /// more than once (e.g. after adding more rules); existing edges are
    /// recomputed from scratch.
    pub fn link(&mut self) {
        let n = self.rules.len();
        let mut blockers: Vec<HashSet<RuleId>> = vec![HashSet::new(); n];
        for i in 0..n {
            let id = RuleId(i as u32);
            for dep in self.rules[i].depends.clone() {
                if let Some(producer) = self.producer_of(&dep) {
                    if producer != id {
                        blockers[i].insert(producer);
                    }
                }
            }
        }
        let mut blocked: Vec<HashSet<RuleId>> = vec![HashSet::new(); n];
        for i in 0..n {
            for &b in &blockers[i] {
                blocked[b.0 as usize].insert(RuleId(i as u32));
            }
        }
        for i in 0..n {
            let mut bl: Vec<RuleId> = blockers[i].iter().copied().collect();
            bl.sort();
            let mut bd: Vec<RuleId> = blocked[i].iter().copied().collect();
            bd.sort();
            self.rules[i].blockers = bl;
            self.rules[i].blocked = bd;
        }
    }

    /// Determines which rules are stale from filesystem mtimes (any output
    /// missing, or any dependency newer than the oldest output), then
    /// propagates dirtiness through blocker edges to a fixpoint. Must be
    /// called after [`Graph::link`]. Non-dirty rules are marked `Done`
    /// immediately (nothing to build); dirty rules stay `Dirty` until the
    /// executor runs them.
    pub fn compute_staleness(&mut self, mtime: impl Fn(&Path) -> Option<SystemTime>) {
        let n = self.rules.len();
        let mut dirty = vec![false; n];
        for i in 0..n {
            dirty[i] = is_stale(&self.rules[i], &mtime);
        }
        // Fixpoint: a rule with any dirty blocker becomes dirty too.
        loop {
            let mut changed = false;
            for i in 0..n {
                if dirty[i] {
                    continue;
                }
                if self.rules[i].blockers.iter().any(|b| dirty[b.0 as usize]) {
                    dirty[i] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for i in 0..n {
            self.rules[i].state = if dirty[i] {
                RuleState::Dirty
            } else {
                RuleState::Done
            };
        }
    }
}

fn is_stale(rule: &Rule, mtime: &impl Fn(&Path) -> Option<SystemTime>) -> bool {
    let mut oldest_output: Option<SystemTime> = None;
    for out in &rule.outputs {
        match mtime(out) {
            None => return true,
            Some(t) => {
                oldest_output = Some(match oldest_output {
                    Some(cur) if cur <= t => cur,
                    _ => t,
                });
            }
        }
    }
    let Some(oldest_output) = oldest_output else {
        // No outputs at all (phony-ish rule): always considered stale so it
        // always runs, matching `add_custom_command` with no OUTPUT being
        // unusual but not forbidden.
        return true;
    };
    rule.depends.iter().any(|d| match mtime(d) {
        Some(t) => t > oldest_output,
        None => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn blocker_blocked_edges_are_symmetric_and_deduped() {
        let mut g = Graph::new();
        let a = g.add_rule(
            vec![PathBuf::from("a.o")],
            vec![],
            vec![],
            None,
            None,
        );
        let _b = g.add_rule(
            vec![PathBuf::from("b.o")],
            vec![],
            vec![PathBuf::from("a.o"), PathBuf::from("a.o")],
            None,
            None,
        );
        g.link();
        assert_eq!(g.rule(RuleId(1)).blockers, vec![a]);
        assert_eq!(g.rule(a).blocked, vec![RuleId(1)]);
    }

    #[test]
    fn dirty_propagates_through_blockers_to_fixpoint() {
        let mut g = Graph::new();
        let a = g.add_rule(vec![PathBuf::from("a.o")], vec![], vec![], None, None);
        let b = g.add_rule(
            vec![PathBuf::from("b.o")],
            vec![],
            vec![PathBuf::from("a.o")],
            None,
            None,
        );
        let _c = g.add_rule(
            vec![PathBuf::from("c.o")],
            vec![],
            vec![PathBuf::from("b.o")],
            None,
            None,
        );
        g.link();
        // a.o missing on disk -> a dirty -> b dirty (depends on a.o) -> c dirty.
        let times: HashMap<PathBuf, SystemTime> = [
            (PathBuf::from("b.o"), t(10)),
            (PathBuf::from("c.o"), t(10)),
        ]
        .into_iter()
        .collect();
        g.compute_staleness(|p| times.get(p).copied());
        assert_eq!(g.rule(a).state, RuleState::Dirty);
        assert_eq!(g.rule(b).state, RuleState::Dirty);
        assert_eq!(g.rule(RuleId(2)).state, RuleState::Dirty);
    }

    #[test]
    fn unchanged_dependency_leaves_rule_clean() {
        let mut g = Graph::new();
        let _a = g.add_rule(
            vec![PathBuf::from("o")],
            vec![],
            vec![PathBuf::from("src")],
            None,
            None,
        );
        g.link();
        let times: HashMap<PathBuf, SystemTime> = [
            (PathBuf::from("o"), t(10)),
            (PathBuf::from("src"), t(5)),
        ]
        .into_iter()
        .collect();
        g.compute_staleness(|p| times.get(p).copied());
        assert_eq!(g.rule(RuleId(0)).state, RuleState::Done);
    }
}
