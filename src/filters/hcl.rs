//! Minimal HCL block scanner.
//!
//! This is not a full HCL parser. It tokenizes just enough of the native
//! syntax (comments, quoted templates with nested interpolations, heredocs,
//! brackets) to prove a file is well formed and to recover its top-level
//! declaration blocks: `resource "aws_s3_bucket" "logs" { ... }`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HclError {
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },

    #[error("line {line}: unterminated block comment")]
    UnterminatedComment { line: usize },

    #[error("line {line}: heredoc '{marker}' is never closed")]
    UnterminatedHeredoc { line: usize, marker: String },

    #[error("line {line}: unexpected '{found}'")]
    UnexpectedClose { line: usize, found: char },

    #[error("line {line}: expected '{expected}' but found '{found}'")]
    Mismatched {
        line: usize,
        expected: char,
        found: char,
    },

    #[error("line {line}: '{open}' is never closed")]
    Unclosed { line: usize, open: char },
}

/// A top-level declaration such as `resource "type" "name" { ... }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: String,
    pub labels: Vec<String>,
    pub line: usize,
    /// Deepest `{` nesting reached inside this block, counting the block itself as 1.
    pub max_depth: usize,
}

impl Block {
    pub fn label(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HclDocument {
    pub blocks: Vec<Block>,
    /// `name = value` statements outside any block.
    pub top_level_attributes: usize,
    pub max_depth: usize,
}

impl HclDocument {
    pub fn blocks_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks.iter().filter(move |b| b.kind == kind)
    }
}

#[derive(Debug)]
enum HeaderToken {
    Ident(String),
    Str(String),
    Assign,
    Other,
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Scanner {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) -> Result<(), HclError> {
        let line = self.line;
        self.pos += 2;
        loop {
            match self.bump() {
                None => return Err(HclError::UnterminatedComment { line }),
                Some('*') if self.peek() == Some('/') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(_) => {}
            }
        }
    }

    fn scan_ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.chars[start..self.pos].iter().collect()
    }

    /// Consume a quoted template starting at `"`, returning its raw text.
    fn scan_string(&mut self) -> Result<String, HclError> {
        let line = self.line;
        self.pos += 1;
        let mut text = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(HclError::UnterminatedString { line });
            };
            match c {
                '\n' => return Err(HclError::UnterminatedString { line }),
                '"' => {
                    self.pos += 1;
                    return Ok(text);
                }
                '\\' => {
                    self.pos += 1;
                    match self.bump() {
                        Some('\n') | None => return Err(HclError::UnterminatedString { line }),
                        Some(escaped) => {
                            text.push('\\');
                            text.push(escaped);
                        }
                    }
                }
                '$' | '%' if self.peek_at(1) == Some(c) && self.peek_at(2) == Some('{') => {
                    // `$${` and `%%{` are literal escapes.
                    self.pos += 3;
                    text.push(c);
                    text.push('{');
                }
                '$' | '%' if self.peek_at(1) == Some('{') => {
                    let start = self.pos;
                    self.scan_template_expr()?;
                    text.extend(&self.chars[start..self.pos]);
                }
                _ => {
                    self.pos += 1;
                    text.push(c);
                }
            }
        }
    }

    /// Consume `${ ... }` / `%{ ... }`, including nested strings and braces.
    fn scan_template_expr(&mut self) -> Result<(), HclError> {
        let line = self.line;
        self.pos += 2;
        let mut depth = 1usize;
        while depth > 0 {
            match self.peek() {
                None => return Err(HclError::UnterminatedString { line }),
                Some('"') => {
                    self.scan_string()?;
                }
                Some('{') => {
                    depth += 1;
                    self.bump();
                }
                Some('}') => {
                    depth -= 1;
                    self.bump();
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
        Ok(())
    }

    fn at_heredoc(&self) -> bool {
        if self.peek() != Some('<') || self.peek_at(1) != Some('<') {
            return false;
        }
        let marker_start = if self.peek_at(2) == Some('-') { 3 } else { 2 };
        self.peek_at(marker_start)
            .map(|c| c.is_alphabetic() || c == '_')
            .unwrap_or(false)
    }

    fn scan_heredoc(&mut self) -> Result<(), HclError> {
        let line = self.line;
        self.pos += 2;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        let marker = self.scan_ident();
        self.skip_line();
        loop {
            if self.bump().is_none() {
                return Err(HclError::UnterminatedHeredoc { line, marker });
            }
            let start = self.pos;
            self.skip_line();
            let text: String = self.chars[start..self.pos].iter().collect();
            if text.trim() == marker {
                return Ok(());
            }
            if self.peek().is_none() {
                return Err(HclError::UnterminatedHeredoc { line, marker });
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn closer_for(open: char) -> char {
    match open {
        '{' => '}',
        '[' => ']',
        _ => ')',
    }
}

fn block_from_header(header: &[HeaderToken], line: usize) -> Option<Block> {
    let (first, rest) = header.split_first()?;
    let HeaderToken::Ident(kind) = first else {
        return None;
    };
    let labels = rest
        .iter()
        .map(|token| match token {
            HeaderToken::Ident(s) | HeaderToken::Str(s) => Some(s.clone()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(Block {
        kind: kind.clone(),
        labels,
        line,
        max_depth: 1,
    })
}

/// Scan `src` into its top-level blocks.
pub fn parse(src: &str) -> Result<HclDocument, HclError> {
    let mut s = Scanner::new(src);
    let mut doc = HclDocument::default();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut header: Vec<HeaderToken> = Vec::new();
    let mut header_line = 1usize;
    let mut current_block: Option<usize> = None;

    while let Some(c) = s.peek() {
        match c {
            '\n' => {
                s.bump();
                if stack.is_empty() {
                    if header.iter().any(|t| matches!(t, HeaderToken::Assign)) {
                        doc.top_level_attributes += 1;
                    }
                    header.clear();
                }
            }
            c if c.is_whitespace() => {
                s.bump();
            }
            '#' => s.skip_line(),
            '/' if s.peek_at(1) == Some('/') => s.skip_line(),
            '/' if s.peek_at(1) == Some('*') => s.skip_block_comment()?,
            '"' => {
                let text = s.scan_string()?;
                if stack.is_empty() {
                    header.push(HeaderToken::Str(text));
                }
            }
            '<' if s.at_heredoc() => s.scan_heredoc()?,
            '{' | '[' | '(' => {
                let line = s.line;
                s.bump();
                if c == '{' && stack.is_empty() {
                    match block_from_header(&header, header_line) {
                        Some(block) => {
                            doc.blocks.push(block);
                            current_block = Some(doc.blocks.len() - 1);
                        }
                        None => {
                            if header.iter().any(|t| matches!(t, HeaderToken::Assign)) {
                                doc.top_level_attributes += 1;
                            }
                        }
                    }
                    header.clear();
                }
                stack.push((c, line));
                let depth = stack.iter().filter(|(open, _)| *open == '{').count();
                doc.max_depth = doc.max_depth.max(depth);
                if let Some(idx) = current_block {
                    let block = &mut doc.blocks[idx];
                    block.max_depth = block.max_depth.max(depth);
                }
            }
            '}' | ']' | ')' => {
                let line = s.line;
                s.bump();
                match stack.pop() {
                    Some((open, _)) if closer_for(open) == c => {}
                    Some((open, _)) => {
                        return Err(HclError::Mismatched {
                            line,
                            expected: closer_for(open),
                            found: c,
                        })
                    }
                    None => return Err(HclError::UnexpectedClose { line, found: c }),
                }
                if stack.is_empty() {
                    current_block = None;
                    header.clear();
                }
            }
            c if is_ident_start(c) => {
                let line = s.line;
                let ident = s.scan_ident();
                if stack.is_empty() {
                    if header.is_empty() {
                        header_line = line;
                    }
                    header.push(HeaderToken::Ident(ident));
                }
            }
            '=' => {
                s.bump();
                if stack.is_empty() {
                    header.push(HeaderToken::Assign);
                }
            }
            _ => {
                s.bump();
                if stack.is_empty() {
                    header.push(HeaderToken::Other);
                }
            }
        }
    }

    if let Some(&(open, line)) = stack.last() {
        return Err(HclError::Unclosed { line, open });
    }
    if header.iter().any(|t| matches!(t, HeaderToken::Assign)) {
        doc.top_level_attributes += 1;
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_top_level_blocks_with_labels() {
        let src = r#"
terraform {
  required_version = ">= 1.5"
}

provider "aws" {
  region = "eu-west-1"
}

resource "aws_s3_bucket" "logs" {
  bucket = "logs-${var.env}"
  tags = {
    Name = "logs"
  }
}
"#;
        let doc = parse(src).unwrap();
        let kinds: Vec<_> = doc.blocks.iter().map(|b| b.kind.as_str()).collect();
        assert_eq!(kinds, vec!["terraform", "provider", "resource"]);
        let resource = &doc.blocks[2];
        assert_eq!(resource.labels, vec!["aws_s3_bucket", "logs"]);
        assert_eq!(resource.line, 10);
        assert_eq!(resource.max_depth, 2);
        assert_eq!(doc.max_depth, 2);
    }

    #[test]
    fn braces_inside_strings_comments_and_heredocs_are_ignored() {
        let src = r#"
# resource "fake" "one" {
/* resource "fake" "two" {
   } */
resource "aws_iam_policy" "p" {
  name   = "p-${lookup(var.names, "x", "{")}"
  policy = <<-EOT
    { "Version": "2012-10-17" {
  EOT
  // trailing { comment
}
"#;
        let doc = parse(src).unwrap();
        assert_eq!(doc.blocks.len(), 1);
        assert_eq!(doc.blocks[0].label(0), Some("aws_iam_policy"));
        assert_eq!(doc.max_depth, 1);
    }

    #[test]
    fn one_line_and_unlabeled_blocks() {
        let doc = parse("variable \"cidr\" {}\nlocals { a = 1 }\n").unwrap();
        assert_eq!(doc.blocks.len(), 2);
        assert_eq!(doc.blocks[0].labels, vec!["cidr"]);
        assert!(doc.blocks[1].labels.is_empty());
    }

    #[test]
    fn top_level_attributes_are_counted_not_blocks() {
        let doc = parse("region = \"us-east-1\"\ntags = {\n a = 1\n}\n").unwrap();
        assert!(doc.blocks.is_empty());
        assert_eq!(doc.top_level_attributes, 2);
    }

    #[test]
    fn unclosed_block_is_an_error() {
        let src = "resource \"aws_vpc\" \"main\" {\n  cidr_block = \"10.0.0.0/16\"\n";
        let err = parse(src).unwrap_err();
        assert_eq!(err, HclError::Unclosed { line: 1, open: '{' });
    }

    #[test]
    fn stray_closer_is_an_error() {
        assert!(matches!(
            parse("}\n").unwrap_err(),
            HclError::UnexpectedClose { found: '}', .. }
        ));
    }

    #[test]
    fn mismatched_brackets_are_an_error() {
        assert!(matches!(
            parse("locals {\n  a = [1, 2}\n}\n").unwrap_err(),
            HclError::Mismatched { expected: ']', found: '}', .. }
        ));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(matches!(
            parse("variable \"x {\n}\n").unwrap_err(),
            HclError::UnterminatedString { line: 1 }
        ));
    }

    #[test]
    fn unterminated_heredoc_is_an_error() {
        assert!(matches!(
            parse("locals {\n  a = <<EOF\nnever closed\n}\n").unwrap_err(),
            HclError::UnterminatedHeredoc { .. }
        ));
    }

    #[test]
    fn escaped_interpolation_is_literal() {
        let doc = parse("locals {\n  a = \"$${not_interp\"\n}\n").unwrap();
        assert_eq!(doc.blocks.len(), 1);
    }

    #[test]
    fn empty_source_has_no_blocks() {
        let doc = parse("").unwrap();
        assert!(doc.blocks.is_empty());
    }
}
