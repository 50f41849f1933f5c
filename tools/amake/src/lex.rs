//! Tokenizer (spec §4.1.1): turns a build-script byte buffer into a flat
//! token stream of words, parens and newlines. Quoted words are tagged
//! `was_quoted: true` instead of carrying an in-band sentinel byte, per the
//! reimplementation note in spec.md §9.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Word { text: String, was_quoted: bool },
    LParen,
    RParen,
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

pub fn tokenize(input: &[u8]) -> Vec<Token> {
    Lexer::new(input).run()
}

struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    out: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Lexer {
            bytes,
            pos: 0,
            line: 1,
            out: Vec::new(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, off: usize) -> Option<u8> {
        self.bytes.get(self.pos + off).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn emit(&mut self, kind: TokenKind, line: usize) {
        self.out.push(Token { kind, line });
    }

    fn run(mut self) -> Vec<Token> {
        loop {
            match self.peek() {
                None => break,
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.bump();
                }
                Some(b'\n') => {
                    let line = self.line;
                    self.bump();
                    self.emit(TokenKind::Newline, line);
                }
                Some(b'\\') if self.peek_at(1) == Some(b'\n') => {
                    // Line continuation: swallow both bytes, no token.
                    self.bump();
                    self.bump();
                }
                Some(b'#') => self.skip_comment(),
                Some(b'(') => {
                    let line = self.line;
                    self.bump();
                    self.emit(TokenKind::LParen, line);
                }
                Some(b')') => {
                    let line = self.line;
                    self.bump();
                    self.emit(TokenKind::RParen, line);
                }
                Some(b'"') => self.quoted_word(),
                Some(b'[') if self.bracket_len_at(self.pos).is_some() => self.bracket_word(),
                Some(_) => self.unquoted_word(),
            }
        }
        self.emit(TokenKind::Eof, self.line);
        self.out
    }

    /// If `bytes[pos]` starts a `[=*[` opener, returns the equals-count.
    fn bracket_len_at(&self, pos: usize) -> Option<usize> {
        if self.bytes.get(pos) != Some(&b'[') {
            return None;
        }
        let mut i = pos + 1;
        let mut eq = 0usize;
        while self.bytes.get(i) == Some(&b'=') {
            eq += 1;
            i += 1;
        }
        if self.bytes.get(i) == Some(&b'[') {
            Some(eq)
        } else {
            None
        }
    }

    fn skip_comment(&mut self) {
        if let Some(eq) = self.bracket_len_at(self.pos + 1).filter(|_| {
            self.bytes.get(self.pos + 1) == Some(&b'[')
        }) {
            // `#[==[ ... ]==]` nested bracket comment.
            self.skip_bracket(eq);
        } else {
            while let Some(b) = self.peek() {
                if b == b'\n' {
                    break;
                }
                self.bump();
            }
        }
    }

    /// Consumes a `[=*[ ... ]=*]` region (opener already detected at
    /// `self.pos`), matching on equals-count.
    fn skip_bracket(&mut self, eq: usize) {
        self.pos += 2 + eq; // skip "[" + "="*eq + "["
        loop {
            match self.peek() {
                None => break,
                Some(b']') if self.closer_matches(eq) => {
                    self.pos += 2 + eq;
                    break;
                }
                Some(b'\n') => {
                    self.pos += 1;
                    self.line += 1;
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn closer_matches(&self, eq: usize) -> bool {
        if self.bytes.get(self.pos) != Some(&b']') {
            return false;
        }
        for i in 0..eq {
            if self.bytes.get(self.pos + 1 + i) != Some(&b'=') {
                return false;
            }
        }
        self.bytes.get(self.pos + 1 + eq) == Some(&b']')
    }

    fn bracket_word(&mut self) {
        let line = self.line;
        let eq = self.bracket_len_at(self.pos).unwrap();
        self.pos += 2 + eq;
        let start = self.pos;
        loop {
            match self.peek() {
                None => break,
                Some(b']') if self.closer_matches(eq) => break,
                Some(b'\n') => {
                    self.pos += 1;
                    self.line += 1;
                }
                Some(_) => self.pos += 1,
            }
        }
        let text = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        if self.peek() == Some(b']') {
            self.pos += 2 + eq;
        }
        self.emit(
            TokenKind::Word {
                text,
                was_quoted: true,
            },
            line,
        );
    }

    fn quoted_word(&mut self) {
        let line = self.line;
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.peek() {
                None | Some(b'"') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    match self.bump() {
                        Some(b'"') => text.push('"'),
                        Some(b'\\') => text.push('\\'),
                        Some(b'$') => text.push('$'),
                        Some(b'n') => text.push('\n'),
                        Some(b't') => text.push('\t'),
                        Some(other) => {
                            text.push('\\');
                            text.push(other as char);
                        }
                        None => text.push('\\'),
                    }
                }
                Some(b) => {
                    self.bump();
                    text.push(b as char);
                }
            }
        }
        self.emit(
            TokenKind::Word {
                text,
                was_quoted: true,
            },
            line,
        );
    }

    fn unquoted_word(&mut self) {
        let line = self.line;
        let mut raw = Vec::new();
        loop {
            match self.peek() {
                None => break,
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') | Some(b'(') | Some(b')')
                | Some(b'"') | Some(b'#') => break,
                Some(b'\\') if self.peek_at(1) == Some(b'\n') => break,
                Some(b) => {
                    self.bump();
                    raw.push(b);
                }
            }
        }
        let text = String::from_utf8_lossy(&raw).into_owned();
        self.emit(
            TokenKind::Word {
                text,
                was_quoted: false,
            },
            line,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(src: &str) -> Vec<(String, bool)> {
        tokenize(src.as_bytes())
            .into_iter()
            .filter_map(|t| match t.kind {
                TokenKind::Word { text, was_quoted } => Some((text, was_quoted)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn quoted_string_decodes_escapes() {
        let w = words(r#"set(A "x\ty\n\"z\"")"#);
        assert_eq!(w[1], ("A".into(), false));
        assert_eq!(w[2], ("x\ty\n\"z\"".into(), true));
    }

    #[test]
    fn bracket_comment_nests_by_equals_count() {
        let toks = tokenize(b"a()\n#[==[ comment ]] not end ]==]\nb()");
        let names: Vec<_> = toks
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Word { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn line_continuation_is_consumed() {
        let w = words("set(A \\\nB)");
        assert_eq!(
            w,
            vec![
                ("set".into(), false),
                ("A".into(), false),
                ("B".into(), false)
            ]
        );
    }

    #[test]
    fn bracket_string_is_verbatim() {
        let w = words("set(A [=[ no \\n escape here ]=])");
        assert_eq!(w[2].0, " no \\n escape here ");
        assert!(w[2].1);
    }
}
