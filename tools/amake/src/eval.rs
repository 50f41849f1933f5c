//! The command evaluator (spec §4.1.4–§4.1.5): walks the AST, expanding
//! arguments and dispatching the recognized command set, and assembles the
//! [`graph::Graph`] from `add_custom_command`/`add_custom_target`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use colored::Colorize;
use graph::Graph;

use crate::ast::{Node, RawArg};
use crate::condition::{eval_condition, CondCtx};
use crate::expand::expand_args;
use crate::scope::{ScopeId, Scopes};

#[derive(Clone)]
struct FuncDef {
    params: Vec<String>,
    body: Vec<Node>,
    is_macro: bool,
}

pub struct Evaluator {
    pub scopes: Scopes,
    pub graph: Graph,
    functions: HashMap<String, FuncDef>,
    pub verbose: bool,
    /// Path to this binary, so `COMMAND <self> -E ...` can be recognized by
    /// the executor without forking (spec §4.1.7).
    pub self_exe: PathBuf,
    /// Text of every `message()` call, in call order, for `--verbose`-free
    /// inspection (tests check the literal printed text here).
    pub messages: Vec<String>,
}

impl Evaluator {
    pub fn new(self_exe: PathBuf) -> Self {
        Evaluator {
            scopes: Scopes::new(),
            graph: Graph::new(),
            functions: HashMap::new(),
            verbose: false,
            self_exe,
            messages: Vec::new(),
        }
    }

    pub fn set_var(&mut self, name: &str, value: String) {
        let root = self.scopes.root();
        self.scopes.set(root, name, value);
    }

    pub fn run_program(&mut self, body: &[Node]) -> Result<()> {
        let root = self.scopes.root();
        self.eval_block(root, body)
    }

    fn eval_block(&mut self, scope: ScopeId, body: &[Node]) -> Result<()> {
        for node in body {
            self.eval_node(scope, node)?;
        }
        Ok(())
    }

    fn eval_node(&mut self, scope: ScopeId, node: &Node) -> Result<()> {
        match node {
            Node::Command { name, args } => self.eval_command(scope, name, args),
            Node::If { branches, else_body } => {
                for (cond_raw, body) in branches {
                    let cond = expand_args(&self.scopes, scope, cond_raw);
                    let ctx = CondCtx {
                        scopes: &self.scopes,
                        scope,
                    };
                    if eval_condition(&ctx, &cond) {
                        return self.eval_block(scope, body);
                    }
                }
                if let Some(body) = else_body {
                    self.eval_block(scope, body)?;
                }
                Ok(())
            }
            Node::Foreach { var, values, body } => {
                let values = expand_args(&self.scopes, scope, values);
                for v in values {
                    self.scopes.set(scope, var, v);
                    self.eval_block(scope, body)?;
                }
                Ok(())
            }
            Node::FunctionDef {
                name,
                is_macro,
                params,
                body,
            } => {
                self.functions.insert(
                    name.to_ascii_lowercase(),
                    FuncDef {
                        params: params.clone(),
                        body: body.clone(),
                        is_macro: *is_macro,
                    },
                );
                Ok(())
            }
        }
    }

    fn eval_command(&mut self, scope: ScopeId, name: &str, raw_args: &[RawArg]) -> Result<()> {
        let args = expand_args(&self.scopes, scope, raw_args);
        match name.to_ascii_lowercase().as_str() {
            "set" => self.cmd_set(scope, &args),
            "option" => self.cmd_option(scope, &args),
            "message" => self.cmd_message(&args)?,
            "find_program" => self.cmd_find_program(scope, &args),
            "file" => self.cmd_file(scope, &args),
            "add_custom_command" => self.cmd_add_custom_command(&args),
            "add_custom_target" => self.cmd_add_custom_target(&args),
            "get_filename_component" => self.cmd_get_filename_component(scope, &args),
            "list" => self.cmd_list(scope, &args),
            "string" => self.cmd_string(scope, &args),
            "project" => {
                if let Some(n) = args.first() {
                    self.set_var("PROJECT_NAME", n.clone());
                }
            }
            "cmake_minimum_required" | "set_property" => {}
            other => {
                if let Some(func) = self.functions.get(other).cloned() {
                    self.call_function(scope, &func, &args)?;
                }
                // else: unknown top-level command, silently ignored (spec §7).
            }
        }
        Ok(())
    }

    fn call_function(&mut self, caller: ScopeId, func: &FuncDef, args: &[String]) -> Result<()> {
        let call_scope = if func.is_macro {
            caller
        } else {
            self.scopes.child_of(caller)
        };
        for (i, p) in func.params.iter().enumerate() {
            self.scopes
                .set(call_scope, p, args.get(i).cloned().unwrap_or_default());
        }
        self.scopes.set(call_scope, "ARGC", args.len().to_string());
        self.scopes.set(call_scope, "ARGV", args.join(";"));
        for (i, a) in args.iter().enumerate() {
            self.scopes.set(call_scope, &format!("ARGV{i}"), a.clone());
        }
        let extras: Vec<String> = args.iter().skip(func.params.len()).cloned().collect();
        self.scopes.set(call_scope, "ARGN", extras.join(";"));
        self.eval_block(call_scope, &func.body)
    }

    fn cmd_set(&mut self, scope: ScopeId, args: &[String]) {
        let Some(var) = args.first() else { return };
        let parent_scope = args.last().map(|s| s == "PARENT_SCOPE").unwrap_or(false);
        let value_end = if parent_scope { args.len() - 1 } else { args.len() };
        let value = args[1..value_end].join(";");
        if parent_scope {
            self.scopes.set_parent_scope(scope, var, value);
        } else {
            self.scopes.set(scope, var, value);
        }
    }

    fn cmd_option(&mut self, scope: ScopeId, args: &[String]) {
        let Some(name) = args.first() else { return };
        if self.scopes.is_defined(scope, name) {
            return;
        }
        let default = args.get(2).cloned().unwrap_or_else(|| "OFF".to_string());
        self.scopes.set(scope, name, default);
    }

    fn cmd_message(&mut self, args: &[String]) -> Result<()> {
        let (mode, rest) = match args.first().map(String::as_str) {
            Some("FATAL_ERROR") => ("FATAL_ERROR", &args[1..]),
            Some("WARNING") => ("WARNING", &args[1..]),
            Some("STATUS") => ("STATUS", &args[1..]),
            _ => ("", &args[..]),
        };
        let text = rest.join(";");
        self.messages.push(text.clone());
        match mode {
            "FATAL_ERROR" => {
                eprintln!("{}", text.red());
                bail!("{text}");
            }
            "WARNING" => eprintln!("{}", text.yellow()),
            _ => println!("{text}"),
        }
        Ok(())
    }

    fn cmd_find_program(&mut self, scope: ScopeId, args: &[String]) {
        let Some(var) = args.first() else { return };
        let mut names = Vec::new();
        let mut hints = Vec::new();
        let mut mode = "";
        for a in &args[1..] {
            match a.as_str() {
                "NAMES" => mode = "NAMES",
                "HINTS" => mode = "HINTS",
                _ => match mode {
                    "HINTS" => hints.push(a.clone()),
                    _ => names.push(a.clone()),
                },
            }
        }
        for dir in &hints {
            for name in &names {
                let candidate = Path::new(dir).join(name);
                if is_executable(&candidate) {
                    self.scopes
                        .set(scope, var, candidate.to_string_lossy().into_owned());
                    return;
                }
            }
        }
        if let Ok(path_var) = std::env::var("PATH") {
            for dir in std::env::split_paths(&path_var) {
                for name in &names {
                    let candidate = dir.join(name);
                    if is_executable(&candidate) {
                        self.scopes
                            .set(scope, var, candidate.to_string_lossy().into_owned());
                        return;
                    }
                }
            }
        }
        self.scopes.set(scope, var, format!("{var}-NOTFOUND"));
    }

    fn cmd_file(&mut self, scope: ScopeId, args: &[String]) {
        let Some(sub) = args.first() else { return };
        match sub.as_str() {
            "GLOB" | "GLOB_RECURSE" => {
                let Some(var) = args.get(1) else { return };
                let patterns: Vec<&String> = args[2..]
                    .iter()
                    .filter(|a| a.as_str() != "CONFIGURE_DEPENDS")
                    .collect();
                let mut found = Vec::new();
                for pat in patterns {
                    if let Ok(paths) = glob::glob(pat) {
                        for p in paths.flatten() {
                            found.push(p.to_string_lossy().into_owned());
                        }
                    }
                }
                self.scopes.set(scope, var, found.join(";"));
            }
            "MAKE_DIRECTORY" => {
                for dir in &args[1..] {
                    let _ = std::fs::create_dir_all(dir);
                }
            }
            _ => {}
        }
    }

    fn cmd_add_custom_command(&mut self, args: &[String]) {
        let groups = split_keyword_groups(args, &["OUTPUT", "COMMAND", "DEPENDS", "COMMENT", "WORKING_DIRECTORY"]);
        let mut outputs = Vec::new();
        let mut commands = Vec::new();
        let mut depends = Vec::new();
        let mut comment = None;
        let mut working_dir = None;
        for (kw, vals) in &groups {
            match kw.as_str() {
                "OUTPUT" => outputs.extend(vals.iter().map(PathBuf::from)),
                "COMMAND" => commands.push(shell_quote_argv(vals)),
                "DEPENDS" => depends.extend(vals.iter().map(PathBuf::from)),
                "COMMENT" => comment = Some(vals.join(" ")),
                "WORKING_DIRECTORY" => working_dir = vals.first().map(PathBuf::from),
                _ => {}
            }
        }
        if outputs.is_empty() {
            return;
        }
        self.graph
            .add_rule(outputs, commands, depends, comment, working_dir);
    }

    fn cmd_add_custom_target(&mut self, args: &[String]) {
        let Some(name) = args.first() else { return };
        let rest = &args[1..];
        let groups = split_keyword_groups(rest, &["DEPENDS", "COMMAND", "COMMENT", "USES_TERMINAL", "ALL"]);
        let mut default = false;
        let mut uses_terminal = false;
        let mut depends = Vec::new();
        let mut commands = Vec::new();
        // Positional flags (ALL / USES_TERMINAL) show up as values in the
        // leading "" group before any recognized keyword, or standalone.
        for (kw, vals) in &groups {
            match kw.as_str() {
                "" => {
                    for v in vals {
                        if v == "ALL" {
                            default = true;
                        } else if v == "USES_TERMINAL" {
                            uses_terminal = true;
                        }
                    }
                }
                "DEPENDS" => depends.extend(vals.iter().cloned()),
                "COMMAND" => commands.push(shell_quote_argv(vals)),
                "COMMENT" => {}
                "USES_TERMINAL" => uses_terminal = true,
                "ALL" => default = true,
                _ => {}
            }
        }
        self.graph
            .add_target(name.clone(), depends, commands, default, uses_terminal);
    }

    fn cmd_get_filename_component(&mut self, scope: ScopeId, args: &[String]) {
        let (Some(var), Some(path), Some(mode)) = (args.first(), args.get(1), args.get(2)) else {
            return;
        };
        let p = Path::new(path);
        let value = match mode.as_str() {
            "NAME" => p
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            "NAME_WE" | "NAME_WLE" => p
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            "DIRECTORY" | "PATH" => p
                .parent()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            "EXT" | "LAST_EXT" => p
                .extension()
                .map(|s| format!(".{}", s.to_string_lossy()))
                .unwrap_or_default(),
            _ => String::new(),
        };
        self.scopes.set(scope, var, value);
    }

    fn cmd_list(&mut self, scope: ScopeId, args: &[String]) {
        let Some(sub) = args.first() else { return };
        match sub.as_str() {
            "APPEND" => {
                let Some(var) = args.get(1) else { return };
                let mut items: Vec<String> = self
                    .scopes
                    .get(scope, var)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.split(';').map(str::to_string).collect())
                    .unwrap_or_default();
                items.extend(args[2..].iter().cloned());
                self.scopes.set(scope, var, items.join(";"));
            }
            "LENGTH" => {
                let (Some(var), Some(out)) = (args.get(1), args.get(2)) else {
                    return;
                };
                let len = self
                    .scopes
                    .get(scope, var)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.split(';').count())
                    .unwrap_or(0);
                self.scopes.set(scope, out, len.to_string());
            }
            _ => {}
        }
    }

    fn cmd_string(&mut self, scope: ScopeId, args: &[String]) {
        let Some(sub) = args.first() else { return };
        if sub == "REPLACE" {
            let (Some(old), Some(new), Some(out)) = (args.get(1), args.get(2), args.get(3)) else {
                return;
            };
            let input = args[4..].join("");
            let replaced = input.replace(old.as_str(), new);
            self.scopes.set(scope, out, replaced);
        }
    }
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Groups a flat argument list by recognized keywords, preserving the order
/// and repetition of keywords (so multiple `COMMAND` clauses stay separate).
/// Values before the first recognized keyword are grouped under key `""`.
fn split_keyword_groups(args: &[String], keywords: &[&str]) -> Vec<(String, Vec<String>)> {
    let mut groups: Vec<(String, Vec<String>)> = vec![(String::new(), Vec::new())];
    for a in args {
        if keywords.iter().any(|k| k.eq_ignore_ascii_case(a)) {
            groups.push((a.to_ascii_uppercase(), Vec::new()));
        } else {
            groups.last_mut().unwrap().1.push(a.clone());
        }
    }
    groups
}

/// Re-quotes an argv list into a single shell command string (spec §4.1.4):
/// arguments containing whitespace are quoted, empty arguments are kept as
/// `''` (callers already drop empty *unquoted* CMake arguments upstream via
/// [`crate::expand::expand_arg`]).
fn shell_quote_argv(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.is_empty() {
                "''".to_string()
            } else if a.chars().any(|c| c.is_whitespace()) {
                format!("'{}'", a.replace('\'', "'\\''"))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex, parse};

    fn run(src: &str) -> Evaluator {
        let nodes = parse::parse(&lex::tokenize(src.as_bytes())).unwrap();
        let mut ev = Evaluator::new(PathBuf::from("amake"));
        ev.run_program(&nodes).unwrap();
        ev
    }

    #[test]
    fn set_and_message_join_list_with_semicolons() {
        let ev = run("set(A x y)\n");
        let root = ev.scopes.root();
        assert_eq!(ev.scopes.get(root, "A"), Some("x;y"));
    }

    #[test]
    fn message_of_unquoted_list_reprints_semicolons_s1() {
        // spec.md §8 S1: set(A "x;y") ; message(${A}) must print "x;y",
        // not "xy" — expand_arg splits the unquoted ${A} into ["x", "y"]
        // before cmd_message ever sees it, so cmd_message has to rejoin
        // with ';' to reconstruct the original list syntax.
        let ev = run("set(A \"x;y\")\nmessage(${A})\n");
        assert_eq!(ev.messages, vec!["x;y".to_string()]);

        let ev = run("set(A \"x;y\")\nmessage(\"${A}\")\n");
        assert_eq!(ev.messages, vec!["x;y".to_string()]);
    }

    #[test]
    fn add_custom_command_creates_a_rule() {
        let ev = run(
            "add_custom_command(OUTPUT o1 COMMAND /bin/true DEPENDS s)\n\
             add_custom_target(all ALL DEPENDS o1)\n",
        );
        assert_eq!(ev.graph.rules.len(), 1);
        assert_eq!(ev.graph.rules[0].outputs, vec![PathBuf::from("o1")]);
        assert_eq!(ev.graph.rules[0].commands, vec!["/bin/true".to_string()]);
        assert_eq!(ev.graph.targets.len(), 1);
        assert!(ev.graph.targets[0].default);
    }

    #[test]
    fn function_call_binds_params_and_argn() {
        let ev = run(
            "function(f a)\n\
               set(OUT ${a};${ARGC};${ARGN} PARENT_SCOPE)\n\
             endfunction()\n\
             f(1 2 3)\n",
        );
        let root = ev.scopes.root();
        assert_eq!(ev.scopes.get(root, "OUT"), Some("1;3;2;3"));
    }

    #[test]
    fn option_does_not_override_existing_value() {
        let ev = run("set(X ON)\noption(X \"desc\" OFF)\n");
        let root = ev.scopes.root();
        assert_eq!(ev.scopes.get(root, "X"), Some("ON"));
    }
}
