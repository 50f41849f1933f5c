//! Parallel executor (spec §4.1.6): a single controller thread plus up to
//! `max_jobs` concurrent child processes. Only the wait-for-child call
//! suspends the controller; rule commands run strictly in sequence, and
//! failure of one rule never stops already-running siblings.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::Result;
use colored::Colorize;
use graph::{Graph, RuleId, RuleState};

use crate::builtins;

pub struct ExecSummary {
    pub failed: Vec<PathBuf>,
}

struct Job {
    rule: RuleId,
    child: Child,
}

pub fn run(
    graph: &mut Graph,
    needed: &HashSet<RuleId>,
    max_jobs: usize,
    self_exe: &Path,
    verbose: bool,
) -> Result<ExecSummary> {
    // LIFO ready "queue" (spec §5: incidental implementation choice, no
    // cross-run ordering guarantee).
    let mut ready: Vec<RuleId> = Vec::new();
    for &id in needed {
        if graph.is_ready(id) {
            ready.push(id);
        }
    }
    let mut active: Vec<Job> = Vec::new();
    let mut failed = Vec::new();

    while !ready.is_empty() || !active.is_empty() {
        while let Some(id) = ready.pop() {
            if active.len() >= max_jobs {
                ready.push(id);
                break;
            }
            start_rule(graph, id, self_exe, verbose, &mut active, &mut ready, needed, &mut failed)?;
        }
        if active.is_empty() {
            continue;
        }
        // Wait for *any* child (spec's only suspension point): poll with a
        // short sleep since std offers no "waitpid -1" portable primitive.
        let finished_idx = loop {
            if let Some(idx) = active.iter_mut().position(|j| {
                matches!(j.child.try_wait(), Ok(Some(_)))
            }) {
                break idx;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        };
        let mut job = active.remove(finished_idx);
        let status = job.child.wait()?;
        if status.success() {
            advance_or_finish(graph, job.rule, self_exe, verbose, &mut active, &mut ready, needed, &mut failed)?;
        } else {
            fail_rule(graph, job.rule, &mut failed);
        }
    }

    Ok(ExecSummary { failed })
}

#[allow(clippy::too_many_arguments)]
fn start_rule(
    graph: &mut Graph,
    id: RuleId,
    self_exe: &Path,
    verbose: bool,
    active: &mut Vec<Job>,
    ready: &mut Vec<RuleId>,
    needed: &HashSet<RuleId>,
    failed: &mut Vec<PathBuf>,
) -> Result<()> {
    graph.rule_mut(id).state = RuleState::Building;
    run_from_current_command(graph, id, self_exe, verbose, active, ready, needed, failed)
}

/// Runs in-process builtins inline, starting from `rule.next_command`, until
/// either the rule runs out of commands (-> done) or hits a command that
/// needs a real child process (spawned, recorded in `active`).
#[allow(clippy::too_many_arguments)]
fn run_from_current_command(
    graph: &mut Graph,
    id: RuleId,
    self_exe: &Path,
    verbose: bool,
    active: &mut Vec<Job>,
    ready: &mut Vec<RuleId>,
    needed: &HashSet<RuleId>,
    failed: &mut Vec<PathBuf>,
) -> Result<()> {
    loop {
        let rule = graph.rule(id);
        if rule.next_command >= rule.commands.len() {
            finish_rule(graph, id, active, ready, needed, failed);
            return Ok(());
        }
        let cmd = rule.commands[rule.next_command].clone();
        let cwd = rule.working_dir.clone();
        let argv = crate::shell::split_words(&cmd);
        if let Some(result) = builtins::try_run(self_exe, &argv) {
            if verbose {
                println!("{}", cmd.dimmed());
            }
            match result {
                Ok(()) => {
                    graph.rule_mut(id).next_command += 1;
                    continue;
                }
                Err(e) => {
                    eprintln!("{} {cmd}: {e}", "amake:".red());
                    fail_rule(graph, id, failed);
                    return Ok(());
                }
            }
        }
        if verbose {
            println!("{cmd}");
        }
        let mut sh = Command::new("/bin/sh");
        sh.arg("-c").arg(&cmd);
        if let Some(dir) = &cwd {
            sh.current_dir(dir);
        }
        match sh.spawn() {
            Ok(child) => {
                active.push(Job { rule: id, child });
                return Ok(());
            }
            Err(e) => {
                eprintln!("{} fork failed for {cmd}: {e}", "amake:".red());
                fail_rule(graph, id, failed);
                return Ok(());
            }
        }
    }
}

fn advance_or_finish(
    graph: &mut Graph,
    id: RuleId,
    self_exe: &Path,
    verbose: bool,
    active: &mut Vec<Job>,
    ready: &mut Vec<RuleId>,
    needed: &HashSet<RuleId>,
    failed: &mut Vec<PathBuf>,
) -> Result<()> {
    graph.rule_mut(id).next_command += 1;
    run_from_current_command(graph, id, self_exe, verbose, active, ready, needed, failed)
}

fn finish_rule(
    graph: &mut Graph,
    id: RuleId,
    _active: &mut [Job],
    ready: &mut Vec<RuleId>,
    needed: &HashSet<RuleId>,
    _failed: &mut [PathBuf],
) {
    graph.rule_mut(id).state = RuleState::Done;
    newly_ready(graph, id, ready, needed);
}

fn fail_rule(graph: &mut Graph, id: RuleId, failed: &mut Vec<PathBuf>) {
    graph.rule_mut(id).state = RuleState::Failed;
    if let Some(out) = graph.rule(id).outputs.first() {
        failed.push(out.clone());
    }
    // Transitively skip everything downstream so it is never launched
    // (testable property 3).
    let mut queue: VecDeque<RuleId> = graph.rule(id).blocked.clone().into();
    let mut seen: HashSet<RuleId> = HashSet::new();
    while let Some(b) = queue.pop_front() {
        if !seen.insert(b) {
            continue;
        }
        let r = graph.rule_mut(b);
        if r.state == RuleState::Dirty || r.state == RuleState::Building {
            r.state = RuleState::Skipped;
            for next in graph.rule(b).blocked.clone() {
                queue.push_back(next);
            }
        }
    }
}

fn newly_ready(graph: &Graph, finished: RuleId, ready: &mut Vec<RuleId>, needed: &HashSet<RuleId>) {
    for &b in &graph.rule(finished).blocked {
        if needed.contains(&b) && graph.is_ready(b) {
            ready.push(b);
        }
    }
}

/// Transitive closure of `blockers` starting from `roots`, i.e. every rule
/// that must complete before the requested targets can.
pub fn needed_closure(graph: &Graph, roots: &[RuleId]) -> HashSet<RuleId> {
    let mut seen: HashSet<RuleId> = HashSet::new();
    let mut queue: VecDeque<RuleId> = roots.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        for &b in &graph.rule(id).blockers {
            queue.push_back(b);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn single_rule_runs_and_produces_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o1");
        let mut g = Graph::new();
        let id = g.add_rule(
            vec![out.clone()],
            vec![format!("touch {}", out.display())],
            vec![],
            None,
            None,
        );
        g.link();
        g.compute_staleness(|p| std::fs::metadata(p).ok().and_then(|m| m.modified().ok()));
        assert_eq!(g.rule(id).state, RuleState::Dirty);
        let needed = needed_closure(&g, &[id]);
        let summary = run(&mut g, &needed, 4, Path::new("amake"), false).unwrap();
        assert!(summary.failed.is_empty());
        assert_eq!(g.rule(id).state, RuleState::Done);
        assert!(out.exists());
    }

    #[test]
    fn failure_skips_downstream_but_not_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let sib_out = dir.path().join("sib");
        let mut g = Graph::new();
        let bad = g.add_rule(
            vec![PathBuf::from(dir.path().join("bad"))],
            vec!["false".to_string()],
            vec![],
            None,
            None,
        );
        let downstream = g.add_rule(
            vec![dir.path().join("down")],
            vec!["true".to_string()],
            vec![dir.path().join("bad")],
            None,
            None,
        );
        let sibling = g.add_rule(
            vec![sib_out.clone()],
            vec![format!("touch {}", sib_out.display())],
            vec![],
            None,
            None,
        );
        g.link();
        g.compute_staleness(|_| None);
        let needed = needed_closure(&g, &[bad, downstream, sibling]);
        let summary = run(&mut g, &needed, 4, Path::new("amake"), false).unwrap();
        assert_eq!(summary.failed, vec![dir.path().join("bad")]);
        assert_eq!(g.rule(bad).state, RuleState::Failed);
        assert_eq!(g.rule(downstream).state, RuleState::Skipped);
        assert_eq!(g.rule(sibling).state, RuleState::Done);
        assert!(sib_out.exists());
    }

    #[test]
    fn readiness_propagates_through_a_chain_of_blockers() {
        // a <- b <- c: with max_jobs 1, each rule only becomes ready once
        // its blocker has actually finished, one command at a time through
        // the executor loop — not just from the initial readiness scan.
        let dir = tempfile::tempdir().unwrap();
        let a_out = dir.path().join("a");
        let b_out = dir.path().join("b");
        let c_out = dir.path().join("c");
        let mut g = Graph::new();
        let a = g.add_rule(vec![a_out.clone()], vec![format!("touch {}", a_out.display())], vec![], None, None);
        let b = g.add_rule(vec![b_out.clone()], vec![format!("touch {}", b_out.display())], vec![a_out.clone()], None, None);
        let c = g.add_rule(vec![c_out.clone()], vec![format!("touch {}", c_out.display())], vec![b_out.clone()], None, None);
        g.link();
        g.compute_staleness(|_| None);
        let needed = needed_closure(&g, &[c]);
        let summary = run(&mut g, &needed, 1, Path::new("amake"), false).unwrap();
        assert!(summary.failed.is_empty());
        assert_eq!(g.rule(a).state, RuleState::Done);
        assert_eq!(g.rule(b).state, RuleState::Done);
        assert_eq!(g.rule(c).state, RuleState::Done);
        assert!(c_out.exists());
    }
}
