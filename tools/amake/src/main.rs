//! `amake`: a CMake-subset interpreter that turns a build script into a
//! parallel build-graph execution (spec §4.1, §6).

mod ast;
mod builtins;
mod condition;
mod eval;
mod exec;
mod expand;
mod lex;
mod parse;
mod scope;
mod shell;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;

use eval::Evaluator;

#[derive(Parser)]
#[clap(name = "amake", version, about = "A CMake-subset build interpreter")]
struct Cli {
    /// Build directory (defaults to the current directory).
    #[clap(short = 'B', value_name = "DIR")]
    build_dir: Option<PathBuf>,

    /// Path to the build script to read (default: CMakeLists.txt in the
    /// current directory).
    #[clap(short = 'f', value_name = "FILE")]
    file: Option<PathBuf>,

    /// Define a cache variable, VAR=VALUE.
    #[clap(short = 'D', value_name = "VAR=VALUE")]
    defines: Vec<String>,

    /// Maximum number of parallel jobs.
    #[clap(short = 'j', value_name = "N")]
    jobs: Option<usize>,

    /// Remove the build directory's generated outputs instead of building.
    #[clap(long)]
    clean: bool,

    /// Print every command before running it.
    #[clap(long)]
    verbose: bool,

    /// Direct tool-mode invocation (`-E <subcommand> args...`), bypassing
    /// script evaluation entirely.
    #[clap(short = 'E', value_name = "SUBCOMMAND", allow_hyphen_values = true, min_values = 1)]
    direct: Option<Vec<String>>,

    /// Targets to build (default: every target marked ALL).
    targets: Vec<String>,
}

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {e:#}", "amake:".red());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let self_exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("amake"));

    if let Some(direct) = cli.direct {
        return run_direct(&self_exe, &direct);
    }

    let script_path = cli
        .file
        .unwrap_or_else(|| PathBuf::from("CMakeLists.txt"));
    let source = std::fs::read_to_string(&script_path)
        .with_context(|| format!("reading {}", script_path.display()))?;
    let tokens = lex::tokenize(source.as_bytes());
    let nodes = parse::parse(&tokens)
        .with_context(|| format!("parsing {}", script_path.display()))?;

    let mut ev = Evaluator::new(self_exe.clone());
    ev.verbose = cli.verbose;
    ev.set_var("CMAKE_COMMAND", self_exe.to_string_lossy().into_owned());
    for d in &cli.defines {
        let Some((var, val)) = d.split_once('=') else {
            bail!("-D{d}: expected VAR=VALUE");
        };
        ev.set_var(var, val.to_string());
    }
    if let Some(build_dir) = &cli.build_dir {
        std::fs::create_dir_all(build_dir)?;
        ev.set_var("CMAKE_BINARY_DIR", build_dir.to_string_lossy().into_owned());
    }
    ev.run_program(&nodes)?;

    if cli.clean {
        for rule in &ev.graph.rules {
            for out in &rule.outputs {
                let _ = std::fs::remove_file(out);
            }
        }
        return Ok(());
    }

    ev.graph.link();
    ev.graph
        .compute_staleness(|p| std::fs::metadata(p).ok().and_then(|m| m.modified().ok()));

    let roots = resolve_targets(&ev, &cli.targets)?;
    let needed = exec::needed_closure(&ev.graph, &roots);
    let jobs = cli.jobs.unwrap_or_else(default_jobs).max(1);
    let self_exe = ev.self_exe.clone();
    let summary = exec::run(&mut ev.graph, &needed, jobs, &self_exe, cli.verbose)?;

    run_target_commands(&ev, &cli.targets, &self_exe, cli.verbose)?;

    if !summary.failed.is_empty() {
        for f in &summary.failed {
            eprintln!("{} build of {} failed", "amake:".red(), f.display());
        }
        bail!("build failed");
    }
    Ok(())
}

fn run_direct(self_exe: &std::path::Path, direct: &[String]) -> Result<()> {
    let mut argv = vec![self_exe.to_string_lossy().into_owned(), "-E".to_string()];
    argv.extend(direct.iter().cloned());
    match builtins::try_run(self_exe, &argv) {
        Some(result) => result,
        None => bail!("-E {}: unknown subcommand", direct.join(" ")),
    }
}

/// Resolves the rules that back the requested targets (or every `ALL`
/// target when none are named) into the set of producing `RuleId`s.
fn resolve_targets(ev: &Evaluator, requested: &[String]) -> Result<Vec<graph::RuleId>> {
    let names: Vec<&graph::Target> = if requested.is_empty() {
        ev.graph.targets.iter().filter(|t| t.default).collect()
    } else {
        let mut found = Vec::new();
        for name in requested {
            let t = ev
                .graph
                .targets
                .iter()
                .find(|t| &t.name == name)
                .with_context(|| format!("unknown target {name}"))?;
            found.push(t);
        }
        found
    };
    let mut roots = Vec::new();
    for t in names {
        for dep in &t.depends {
            if let Some(id) = ev.graph.producer_of(std::path::Path::new(dep)) {
                roots.push(id);
            }
        }
    }
    Ok(roots)
}

/// Runs each requested (or default) target's own post-dependency commands,
/// in declaration order, after the dependency closure has already built.
fn run_target_commands(
    ev: &Evaluator,
    requested: &[String],
    self_exe: &std::path::Path,
    verbose: bool,
) -> Result<()> {
    let targets: Vec<&graph::Target> = if requested.is_empty() {
        ev.graph.targets.iter().filter(|t| t.default).collect()
    } else {
        requested
            .iter()
            .filter_map(|name| ev.graph.targets.iter().find(|t| &t.name == name))
            .collect()
    };
    for t in targets {
        for cmd in &t.commands {
            let argv = shell::split_words(cmd);
            if let Some(result) = builtins::try_run(self_exe, &argv) {
                result?;
                continue;
            }
            if verbose {
                println!("{cmd}");
            }
            let status = std::process::Command::new("/bin/sh").arg("-c").arg(cmd).status()?;
            if !status.success() {
                bail!("target {}: command failed: {cmd}", t.name);
            }
        }
    }
    Ok(())
}
