//! Parser (spec §4.1.2): token stream -> AST. Plain commands, `if`/`elseif`/
//! `else`/`endif`, `foreach`/`endforeach`, and `function`/`macro` blocks.
//! Parenthesis nesting inside argument lists is tolerated (counted so the
//! matching `)` is found) but carries no semantic meaning.

use anyhow::{bail, Result};

use crate::ast::{Node, RawArg};
use crate::lex::{Token, TokenKind};

pub fn parse(tokens: &[Token]) -> Result<Vec<Node>> {
    let mut p = Parser { toks: tokens, pos: 0 };
    let body = p.parse_block(&[])?;
    p.skip_newlines();
    if !p.at_eof() {
        bail!("line {}: trailing tokens after top-level body", p.line());
    }
    Ok(body)
}

struct Parser<'a> {
    toks: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn line(&self) -> usize {
        self.toks.get(self.pos).map(|t| t.line).unwrap_or(0)
    }

    fn at_eof(&self) -> bool {
        matches!(self.toks.get(self.pos).map(|t| &t.kind), Some(TokenKind::Eof) | None)
    }

    fn skip_newlines(&mut self) {
        while matches!(self.toks.get(self.pos).map(|t| &t.kind), Some(TokenKind::Newline)) {
            self.pos += 1;
        }
    }

    fn peek_word(&self) -> Option<&str> {
        match self.toks.get(self.pos).map(|t| &t.kind) {
            Some(TokenKind::Word { text, .. }) => Some(text.as_str()),
            _ => None,
        }
    }

    /// Parses statements until EOF or until the next command name (at
    /// statement position) case-insensitively matches one of `stop_at`.
    fn parse_block(&mut self, stop_at: &[&str]) -> Result<Vec<Node>> {
        let mut out = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_eof() {
                break;
            }
            if let Some(w) = self.peek_word() {
                if stop_at.iter().any(|s| w.eq_ignore_ascii_case(s)) {
                    break;
                }
            }
            out.push(self.parse_statement()?);
        }
        Ok(out)
    }

    fn parse_statement(&mut self) -> Result<Node> {
        let line = self.line();
        let name = match self.peek_word() {
            Some(w) => w.to_string(),
            None => bail!("line {line}: expected command name"),
        };
        match name.to_ascii_lowercase().as_str() {
            "if" => self.parse_if(),
            "foreach" => self.parse_foreach(),
            "function" => self.parse_function_def(false),
            "macro" => self.parse_function_def(true),
            _ => {
                let (_, args) = self.parse_call()?;
                Ok(Node::Command { name, args })
            }
        }
    }

    /// Parses `NAME ( args... )`, returning the name and raw argument list.
    /// `self.pos` must currently point at the NAME token.
    fn parse_call(&mut self) -> Result<(String, Vec<RawArg>)> {
        let line = self.line();
        let name = match self.peek_word() {
            Some(w) => w.to_string(),
            None => bail!("line {line}: expected command name"),
        };
        self.pos += 1;
        self.skip_newlines();
        match self.toks.get(self.pos).map(|t| &t.kind) {
            Some(TokenKind::LParen) => self.pos += 1,
            _ => bail!("line {line}: expected '(' after '{name}'"),
        }
        let mut args = Vec::new();
        let mut depth = 0usize;
        loop {
            match self.toks.get(self.pos).map(|t| &t.kind) {
                None | Some(TokenKind::Eof) => {
                    bail!("line {line}: unterminated argument list for '{name}'")
                }
                Some(TokenKind::Newline) => self.pos += 1,
                Some(TokenKind::LParen) => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(TokenKind::RParen) => {
                    if depth == 0 {
                        self.pos += 1;
                        break;
                    }
                    depth -= 1;
                    self.pos += 1;
                }
                Some(TokenKind::Word { text, was_quoted }) => {
                    args.push(RawArg {
                        text: text.clone(),
                        was_quoted: *was_quoted,
                    });
                    self.pos += 1;
                }
            }
        }
        Ok((name, args))
    }

    fn parse_if(&mut self) -> Result<Node> {
        let mut branches = Vec::new();
        let (_, cond) = self.parse_call()?; // consumes `if ( ... )`
        let body = self.parse_block(&["elseif", "else", "endif"])?;
        branches.push((cond, body));
        let mut else_body = None;
        loop {
            match self.peek_word().map(|s| s.to_ascii_lowercase()) {
                Some(ref w) if w == "elseif" => {
                    let (_, cond) = self.parse_call()?;
                    let body = self.parse_block(&["elseif", "else", "endif"])?;
                    branches.push((cond, body));
                }
                Some(ref w) if w == "else" => {
                    let (_, _) = self.parse_call()?;
                    else_body = Some(self.parse_block(&["endif"])?);
                }
                Some(ref w) if w == "endif" => {
                    let (_, _) = self.parse_call()?;
                    break;
                }
                _ => bail!("line {}: expected elseif/else/endif", self.line()),
            }
        }
        Ok(Node::If { branches, else_body })
    }

    fn parse_foreach(&mut self) -> Result<Node> {
        let (_, args) = self.parse_call()?;
        let mut it = args.into_iter();
        let var = it.next().map(|a| a.text).unwrap_or_default();
        let values: Vec<RawArg> = it.collect();
        let body = self.parse_block(&["endforeach"])?;
        let (_, _) = self.parse_call()?; // endforeach(...)
        Ok(Node::Foreach { var, values, body })
    }

    fn parse_function_def(&mut self, is_macro: bool) -> Result<Node> {
        let (_, args) = self.parse_call()?;
        let mut it = args.into_iter();
        let name = it.next().map(|a| a.text).unwrap_or_default();
        let params: Vec<String> = it.map(|a| a.text).collect();
        let end = if is_macro { "endmacro" } else { "endfunction" };
        let body = self.parse_block(&[end])?;
        let (_, _) = self.parse_call()?;
        Ok(Node::FunctionDef {
            name,
            is_macro,
            params,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::tokenize;

    fn parse_src(src: &str) -> Vec<Node> {
        parse(&tokenize(src.as_bytes())).unwrap()
    }

    #[test]
    fn plain_command_parses_args() {
        let nodes = parse_src("set(A B C)\n");
        match &nodes[0] {
            Node::Command { name, args } => {
                assert_eq!(name, "set");
                assert_eq!(args.iter().map(|a| a.text.as_str()).collect::<Vec<_>>(), vec!["A", "B", "C"]);
            }
            _ => panic!("expected command"),
        }
    }

    #[test]
    fn if_else_chain_parses() {
        let nodes = parse_src("if(A)\nmessage(yes)\nelseif(B)\nmessage(maybe)\nelse()\nmessage(no)\nendif()\n");
        match &nodes[0] {
            Node::If { branches, else_body } => {
                assert_eq!(branches.len(), 2);
                assert!(else_body.is_some());
            }
            _ => panic!("expected if"),
        }
    }

    #[test]
    fn foreach_and_function_parse() {
        let nodes = parse_src(
            "foreach(v a b)\nmessage(${v})\nendforeach()\nfunction(f x)\nmessage(${x})\nendfunction()\n",
        );
        assert!(matches!(nodes[0], Node::Foreach { .. }));
        assert!(matches!(nodes[1], Node::FunctionDef { .. }));
    }

    #[test]
    fn nested_parens_in_args_are_tolerated() {
        let nodes = parse_src("message(a(b)c)\n");
        match &nodes[0] {
            Node::Command { args, .. } => {
                assert_eq!(args.iter().map(|a| a.text.as_str()).collect::<Vec<_>>(), vec!["a", "b", "c"]);
            }
            _ => panic!(),
        }
    }
}
