//! AST (spec §4.1.2): a tagged variant with one shape per node kind. Each
//! argument keeps its pre-expansion text and whether it was quoted, so
//! expansion (spec §4.1.3) can happen lazily at evaluation time.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawArg {
    pub text: String,
    pub was_quoted: bool,
}

#[derive(Debug, Clone)]
pub enum Node {
    Command {
        name: String,
        args: Vec<RawArg>,
    },
    If {
        /// `(condition args, body)` pairs for `if` then each `elseif`.
        branches: Vec<(Vec<RawArg>, Vec<Node>)>,
        else_body: Option<Vec<Node>>,
    },
    Foreach {
        var: String,
        values: Vec<RawArg>,
        body: Vec<Node>,
    },
    FunctionDef {
        name: String,
        is_macro: bool,
        params: Vec<String>,
        body: Vec<Node>,
    },
}
