//! Loader for the textual LLVM IR emitted by `clang -emit-llvm -S`.
//!
//! Malformed text is a fatal [`Error::Parse`]. Constructs that are valid
//! LLVM but outside the translated subset are kept as
//! [`InstructionKind::Unsupported`] so that only the enclosing function
//! fails later on.

use crate::error::{Error, Location, Result};
use crate::ir::*;
use log::{debug, trace, warn};
use std::collections::{HashMap, HashSet};

//
// Public Interface
//

pub fn parse_module(text: &str) -> Result<Module> {
    let tokens = tokenize(text)?;
    trace!("IR text split into {} tokens", tokens.len());
    let mut parser = Parser::new(tokens);
    parser.parse_module()?;
    let module = parser.finalize();
    debug!(
        "Loaded module with {} functions, {} globals, {} named types",
        module.functions.len(),
        module.globals.len(),
        module.types.len()
    );
    Ok(module)
}

//
// Private Implementation
//

const UNSUPPORTED_OPCODES: [&str; 23] = [
    "fneg",
    "fadd",
    "fsub",
    "fmul",
    "fdiv",
    "frem",
    "fcmp",
    "fptrunc",
    "fpext",
    "fptoui",
    "fptosi",
    "uitofp",
    "sitofp",
    "addrspacecast",
    "extractelement",
    "insertelement",
    "shufflevector",
    "extractvalue",
    "insertvalue",
    "va_arg",
    "atomicrmw",
    "cmpxchg",
    "fence",
];

const UNSUPPORTED_TERMINATORS: [&str; 7] = [
    "invoke",
    "resume",
    "indirectbr",
    "callbr",
    "catchswitch",
    "catchret",
    "cleanupret",
];

const EXCEPTION_PADS: [&str; 3] = ["landingpad", "catchpad", "cleanuppad"];

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Local(String),
    Global(String),
    AttrGroup(u32),
    Metadata(String),
    Label(String),
    Word(String),
    Int(i128),
    Str { bytes: Vec<u8>, c_string: bool },
    Punct(char),
    Ellipsis,
}

#[derive(Clone, Debug)]
struct Lexeme {
    token: Token,
    line: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '$' | '.' | '_')
}

fn unescape(raw: &str, line: usize) -> Result<Vec<u8>> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if bytes.get(i + 1) == Some(&b'\\') {
                out.push(b'\\');
                i += 2;
                continue;
            }
            let hex = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::parse(line, "truncated escape in string"))?;
            let value = u8::from_str_radix(hex, 16)
                .map_err(|_| Error::parse(line, format!("invalid escape '\\{}'", hex)))?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn tokenize(text: &str) -> Result<Vec<Lexeme>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    let read_while = |start: usize, f: &dyn Fn(char) -> bool| -> usize {
        let mut end = start;
        while end < chars.len() && f(chars[end]) {
            end += 1;
        }
        end
    };

    let read_string = |start: usize, line: usize| -> Result<(String, usize)> {
        // `start` points at the opening quote
        let mut end = start + 1;
        while end < chars.len() && chars[end] != '"' {
            if chars[end] == '\n' {
                return Err(Error::parse(line, "unterminated string"));
            }
            end += 1;
        }
        if end >= chars.len() {
            return Err(Error::parse(line, "unterminated string"));
        }
        Ok((chars[start + 1..end].iter().collect(), end + 1))
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            ';' => i = read_while(i, &|c: char| c != '\n'),
            '%' | '@' | '!' => {
                let (name, end) = if chars.get(i + 1) == Some(&'"') {
                    let (raw, end) = read_string(i + 1, line)?;
                    let bytes = unescape(&raw, line)?;
                    (String::from_utf8_lossy(&bytes).into_owned(), end)
                } else {
                    let end = read_while(i + 1, &is_ident_char);
                    (chars[i + 1..end].iter().collect(), end)
                };
                let token = match c {
                    '%' => Token::Local(name),
                    '@' => Token::Global(name),
                    _ => Token::Metadata(name),
                };
                tokens.push(Lexeme { token, line });
                i = end;
            }
            '#' => {
                let end = read_while(i + 1, &|c: char| c.is_ascii_digit());
                let digits: String = chars[i + 1..end].iter().collect();
                let id = digits
                    .parse()
                    .map_err(|_| Error::parse(line, "expected attribute group number"))?;
                tokens.push(Lexeme {
                    token: Token::AttrGroup(id),
                    line,
                });
                i = end;
            }
            '"' => {
                let (raw, end) = read_string(i, line)?;
                if chars.get(end) == Some(&':') {
                    tokens.push(Lexeme {
                        token: Token::Label(raw),
                        line,
                    });
                    i = end + 1;
                } else {
                    let bytes = unescape(&raw, line)?;
                    tokens.push(Lexeme {
                        token: Token::Str {
                            bytes,
                            c_string: false,
                        },
                        line,
                    });
                    i = end;
                }
            }
            'c' if chars.get(i + 1) == Some(&'"') => {
                let (raw, end) = read_string(i + 1, line)?;
                let bytes = unescape(&raw, line)?;
                tokens.push(Lexeme {
                    token: Token::Str {
                        bytes,
                        c_string: true,
                    },
                    line,
                });
                i = end;
            }
            '.' if chars.get(i + 1) == Some(&'.') && chars.get(i + 2) == Some(&'.') => {
                tokens.push(Lexeme {
                    token: Token::Ellipsis,
                    line,
                });
                i += 3;
            }
            '-' | '0'..='9' => {
                let end = read_while(i + 1, &is_ident_char);
                let word: String = chars[i..end].iter().collect();
                if chars.get(end) == Some(&':') && !word.starts_with('-') {
                    tokens.push(Lexeme {
                        token: Token::Label(word),
                        line,
                    });
                    i = end + 1;
                    continue;
                }
                let token = match word.parse::<i128>() {
                    Ok(value) => Token::Int(value),
                    // floating point and hexadecimal literals
                    Err(_) => Token::Word(word),
                };
                tokens.push(Lexeme { token, line });
                i = end;
            }
            c if is_ident_char(c) => {
                let end = read_while(i, &is_ident_char);
                let word: String = chars[i..end].iter().collect();
                if chars.get(end) == Some(&':') {
                    tokens.push(Lexeme {
                        token: Token::Label(word),
                        line,
                    });
                    i = end + 1;
                } else {
                    tokens.push(Lexeme {
                        token: Token::Word(word),
                        line,
                    });
                    i = end;
                }
            }
            '(' | ')' | '[' | ']' | '{' | '}' | '<' | '>' | ',' | '=' | '*' | ':' | '|' => {
                tokens.push(Lexeme {
                    token: Token::Punct(c),
                    line,
                });
                i += 1;
            }
            other => {
                return Err(Error::parse(
                    line,
                    format!("unexpected character '{}'", other),
                ))
            }
        }
    }

    Ok(tokens)
}

struct PendingFunction {
    function: Function,
    groups: Vec<u32>,
}

struct Parser {
    tokens: Vec<Lexeme>,
    pos: usize,
    module: Module,
    pending: Vec<PendingFunction>,
    attribute_groups: HashMap<u32, Vec<String>>,
    function: String,
    block: String,
}

fn open_of(close: char) -> char {
    match close {
        ')' => '(',
        ']' => '[',
        '}' => '{',
        _ => '<',
    }
}

impl Parser {
    fn new(tokens: Vec<Lexeme>) -> Self {
        Self {
            tokens,
            pos: 0,
            module: Module::default(),
            pending: Vec::new(),
            attribute_groups: HashMap::new(),
            function: String::new(),
            block: String::new(),
        }
    }

    fn finalize(mut self) -> Module {
        for pending in self.pending.drain(..) {
            let mut function = pending.function;
            for group in pending.groups {
                match self.attribute_groups.get(&group) {
                    Some(attributes) => function.attributes.extend(attributes.iter().cloned()),
                    None => warn!("@{} refers to unknown attribute group #{}", function.name, group),
                }
            }
            self.module.functions.push(function);
        }
        self.module
    }

    //
    // Token helpers
    //

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|l| &l.token)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|l| &l.token)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(0, |l| l.line)
    }

    fn previous_line(&self) -> usize {
        if self.pos == 0 {
            return self.line();
        }
        self.tokens[self.pos - 1].line
    }

    fn next(&mut self) -> Result<Token> {
        let line = self.line();
        let token = self
            .tokens
            .get(self.pos)
            .map(|l| l.token.clone())
            .ok_or_else(|| Error::parse(line, "unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn error<T, S: Into<String>>(&self, message: S) -> Result<T> {
        Err(Error::parse(self.line(), message))
    }

    fn unsupported<T, S: Into<String>>(&self, construct: S) -> Result<T> {
        let location = Location {
            function: if self.function.is_empty() {
                None
            } else {
                Some(self.function.clone())
            },
            block: if self.block.is_empty() {
                None
            } else {
                Some(self.block.clone())
            },
            index: None,
            line: Some(self.line()),
        };
        Err(Error::unsupported(construct, location))
    }

    fn is_punct(&self, c: char) -> bool {
        self.peek() == Some(&Token::Punct(c))
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.is_punct(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.is_word(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            self.error(format!("expected '{}', found {:?}", c, self.peek()))
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            self.error(format!("expected '{}', found {:?}", word, self.peek()))
        }
    }

    fn expect_int(&mut self) -> Result<i128> {
        match self.next()? {
            Token::Int(value) => Ok(value),
            other => self.error(format!("expected integer, found {:?}", other)),
        }
    }

    fn expect_local(&mut self) -> Result<String> {
        match self.next()? {
            Token::Local(name) => Ok(name),
            other => self.error(format!("expected local identifier, found {:?}", other)),
        }
    }

    fn expect_label_ref(&mut self) -> Result<String> {
        self.expect_word("label")?;
        self.expect_local()
    }

    /// Skips one token, or a whole bracketed group when it opens one.
    fn skip_balanced(&mut self) -> Result<()> {
        let mut stack = Vec::new();
        loop {
            match self.next()? {
                Token::Punct(c @ ('(' | '[' | '{' | '<')) => stack.push(c),
                Token::Punct(c @ (')' | ']' | '}' | '>')) => {
                    if stack.pop() != Some(open_of(c)) {
                        return self.error(format!("unbalanced '{}'", c));
                    }
                }
                _ => {}
            }
            if stack.is_empty() {
                return Ok(());
            }
        }
    }

    fn skip_line(&mut self, line: usize) {
        while self.pos < self.tokens.len() && self.tokens[self.pos].line == line {
            self.pos += 1;
        }
    }

    /// Skips the remainder of a statement that started on `line`, keeping
    /// bracket balance across line breaks.
    fn skip_statement(&mut self, line: usize) -> Result<()> {
        while self.pos < self.tokens.len() {
            if self.tokens[self.pos].line != line {
                break;
            }
            if matches!(self.peek(), Some(Token::Punct('}'))) {
                break;
            }
            self.skip_balanced()?;
        }
        Ok(())
    }

    //
    // Module level
    //

    fn parse_module(&mut self) -> Result<()> {
        while let Some(token) = self.peek().cloned() {
            let line = self.line();
            match token {
                Token::Word(w) if w == "source_filename" => {
                    self.pos += 1;
                    self.expect_punct('=')?;
                    if let Token::Str { bytes, .. } = self.next()? {
                        self.module.source_filename =
                            Some(String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                Token::Word(w) if w == "target" || w == "module" || w.starts_with('$') => {
                    self.skip_line(line)
                }
                Token::Word(w) if w == "define" => self.parse_function(true)?,
                Token::Word(w) if w == "declare" => self.parse_function(false)?,
                Token::Word(w) if w == "attributes" => self.parse_attribute_group()?,
                Token::Metadata(_) => self.skip_line(line),
                Token::Local(name) => self.parse_type_definition(name)?,
                Token::Global(name) => self.parse_global(name)?,
                other => return self.error(format!("unexpected top-level token {:?}", other)),
            }
        }
        Ok(())
    }

    fn parse_type_definition(&mut self, name: String) -> Result<()> {
        self.pos += 1;
        self.expect_punct('=')?;
        self.expect_word("type")?;
        if self.eat_word("opaque") {
            self.module.types.insert(name, Type::Struct(vec![]));
            return Ok(());
        }
        let ty = self.parse_type()?;
        trace!("type %{} = {}", name, ty);
        self.module.types.insert(name, ty);
        Ok(())
    }

    fn parse_attribute_group(&mut self) -> Result<()> {
        self.expect_word("attributes")?;
        let id = match self.next()? {
            Token::AttrGroup(id) => id,
            other => return self.error(format!("expected attribute group, found {:?}", other)),
        };
        self.expect_punct('=')?;
        self.expect_punct('{')?;
        let mut attributes = Vec::new();
        while !self.eat_punct('}') {
            if let Some(attribute) = self.parse_attribute()? {
                attributes.push(attribute);
            }
        }
        self.attribute_groups.insert(id, attributes);
        Ok(())
    }

    /// Reads one function attribute, string attributes are dropped.
    fn parse_attribute(&mut self) -> Result<Option<String>> {
        match self.next()? {
            Token::Word(word) => {
                if self.is_punct('(') {
                    // memory(argmem: read) and friends keep their arguments
                    let mut text = format!("{}(", word);
                    self.pos += 1;
                    while !self.eat_punct(')') {
                        match self.next()? {
                            Token::Label(l) => text.push_str(&format!("{}: ", l)),
                            Token::Word(w) => text.push_str(&w),
                            Token::Int(i) => text.push_str(&i.to_string()),
                            Token::Punct(',') => text.push_str(", "),
                            _ => {}
                        }
                    }
                    text.push(')');
                    Ok(Some(text))
                } else {
                    if self.eat_punct('=') {
                        self.next()?;
                    }
                    Ok(Some(word))
                }
            }
            Token::Str { .. } => {
                if self.eat_punct('=') {
                    self.next()?;
                }
                Ok(None)
            }
            Token::Int(_) => Ok(None),
            other => self.error(format!("unexpected attribute {:?}", other)),
        }
    }

    fn parse_global(&mut self, name: String) -> Result<()> {
        let line = self.line();
        self.pos += 1;
        self.expect_punct('=')?;
        let mut external = false;
        let constant = loop {
            match self.next()? {
                Token::Word(w) if w == "global" => break false,
                Token::Word(w) if w == "constant" => break true,
                Token::Word(w) if w == "alias" || w == "ifunc" => {
                    warn!("ignoring {} @{}", w, name);
                    self.skip_line(line);
                    return Ok(());
                }
                Token::Word(w) if w == "external" || w == "extern_weak" => external = true,
                Token::Word(w) if w == "addrspace" => self.skip_balanced()?,
                Token::Word(_) => {}
                other => return self.error(format!("unexpected {:?} in global @{}", other, name)),
            }
        };
        self.function.clear();
        self.block.clear();
        let ty = self.parse_type()?;
        let init = if external || self.is_punct(',') || self.line() != line || self.peek().is_none()
        {
            None
        } else {
            Some(self.parse_initializer(&ty)?)
        };
        self.skip_line(self.previous_line());
        trace!("global @{} : {} = {:?}", name, ty, init);
        self.module.globals.push(Global {
            name,
            ty,
            init,
            constant,
        });
        Ok(())
    }

    fn parse_initializer(&mut self, ty: &Type) -> Result<Initializer> {
        let init = match self.peek().cloned() {
            Some(Token::Word(w)) if w == "zeroinitializer" => {
                self.pos += 1;
                Initializer::Zero
            }
            Some(Token::Word(w)) if w == "true" || w == "false" => {
                self.pos += 1;
                Initializer::Int((w == "true") as i128)
            }
            Some(Token::Word(w)) if w == "null" => {
                self.pos += 1;
                Initializer::Null
            }
            Some(Token::Word(w)) if w == "undef" || w == "poison" => {
                self.pos += 1;
                Initializer::Opaque
            }
            Some(Token::Int(value)) => {
                self.pos += 1;
                Initializer::Int(value)
            }
            Some(Token::Str {
                bytes,
                c_string: true,
            }) => {
                self.pos += 1;
                Initializer::Bytes(bytes)
            }
            Some(Token::Global(symbol)) => {
                self.pos += 1;
                Initializer::Symbol(symbol)
            }
            Some(Token::Punct(open @ ('[' | '{' | '<'))) => {
                self.pos += 1;
                let packed = open == '<' && self.eat_punct('{');
                let close = match open {
                    '[' => ']',
                    '{' => '}',
                    _ => '>',
                };
                let mut elements = Vec::new();
                while !self.is_punct(if packed { '}' } else { close }) {
                    let element_ty = self.parse_type()?;
                    let element = self.parse_initializer(&element_ty)?;
                    elements.push((element_ty, element));
                    if !self.eat_punct(',') {
                        break;
                    }
                }
                if packed {
                    self.expect_punct('}')?;
                }
                self.expect_punct(close)?;
                Initializer::Aggregate(elements)
            }
            Some(Token::Word(_)) => {
                // constant expressions and floating point literals
                debug!("initializer of type {} left unconstrained", ty);
                let line = self.line();
                self.pos += 1;
                while self.line() == line && matches!(self.peek(), Some(Token::Word(_))) {
                    self.pos += 1;
                }
                if self.is_punct('(') {
                    self.skip_balanced()?;
                }
                Initializer::Opaque
            }
            other => return self.error(format!("unexpected initializer {:?}", other)),
        };
        Ok(init)
    }

    //
    // Types
    //

    fn is_type_start(&self) -> bool {
        match self.peek() {
            Some(Token::Word(w)) => {
                matches!(
                    w.as_str(),
                    "void"
                        | "ptr"
                        | "label"
                        | "metadata"
                        | "half"
                        | "bfloat"
                        | "float"
                        | "double"
                        | "fp128"
                        | "x86_fp80"
                        | "ppc_fp128"
                        | "token"
                        | "x86_mmx"
                ) || (w.starts_with('i') && w.len() > 1 && w[1..].chars().all(|c| c.is_ascii_digit()))
            }
            Some(Token::Punct('[')) | Some(Token::Punct('{')) | Some(Token::Punct('<')) => true,
            Some(Token::Local(_)) => true,
            _ => false,
        }
    }

    fn parse_type(&mut self) -> Result<Type> {
        let mut ty = match self.next()? {
            Token::Word(w) => match w.as_str() {
                "void" => Type::Void,
                "ptr" => {
                    if self.is_word("addrspace") {
                        self.pos += 1;
                        self.skip_balanced()?;
                    }
                    Type::Ptr
                }
                "label" => Type::Label,
                "metadata" => Type::Metadata,
                "half" | "bfloat" | "float" | "double" | "fp128" | "x86_fp80" | "ppc_fp128" => {
                    Type::Float(w)
                }
                "token" | "x86_mmx" | "x86_amx" => return self.unsupported(format!("{} type", w)),
                w if w.starts_with('i') => match w[1..].parse::<u32>() {
                    Ok(bits) if bits > 0 => Type::Int(bits),
                    _ => return self.error(format!("invalid integer type '{}'", w)),
                },
                other => return self.error(format!("unknown type '{}'", other)),
            },
            Token::Punct('[') => {
                let n = self.expect_int()?;
                self.expect_word("x")?;
                let element = self.parse_type()?;
                self.expect_punct(']')?;
                Type::Array(n as u64, Box::new(element))
            }
            Token::Punct('{') => {
                let fields = self.parse_type_list('}')?;
                Type::Struct(fields)
            }
            Token::Punct('<') => {
                if self.is_punct('{') {
                    return self.unsupported("packed struct type");
                }
                if self.is_word("vscale") {
                    return self.unsupported("scalable vector type");
                }
                let n = self.expect_int()?;
                self.expect_word("x")?;
                let element = self.parse_type()?;
                self.expect_punct('>')?;
                if let Type::Vector(..) = element {
                    return self.unsupported("vector of vectors");
                }
                Type::Vector(n as u32, Box::new(element))
            }
            Token::Local(name) => Type::Named(name),
            other => return self.error(format!("expected type, found {:?}", other)),
        };
        loop {
            if self.eat_punct('*') {
                ty = Type::Ptr;
            } else if self.is_punct('(') && self.is_function_pointer_type() {
                self.skip_balanced()?;
                self.expect_punct('*')?;
                ty = Type::Ptr;
            } else {
                return Ok(ty);
            }
        }
    }

    /// Typed-pointer syntax for function pointers, `i32 (i32)*`.
    fn is_function_pointer_type(&self) -> bool {
        let mut depth = 0;
        let mut offset = 0;
        while let Some(token) = self.peek_at(offset) {
            match token {
                Token::Punct('(') => depth += 1,
                Token::Punct(')') => {
                    depth -= 1;
                    if depth == 0 {
                        return self.peek_at(offset + 1) == Some(&Token::Punct('*'));
                    }
                }
                _ => {}
            }
            offset += 1;
        }
        false
    }

    fn parse_type_list(&mut self, close: char) -> Result<Vec<Type>> {
        let mut types = Vec::new();
        while !self.eat_punct(close) {
            types.push(self.parse_type()?);
            if !self.eat_punct(',') {
                self.expect_punct(close)?;
                break;
            }
        }
        Ok(types)
    }

    //
    // Functions
    //

    fn parse_function(&mut self, is_definition: bool) -> Result<()> {
        let line = self.line();
        self.pos += 1;

        let mut unsupported = None;
        let ret = loop {
            if self.is_type_start() {
                match self.parse_type() {
                    Ok(ty) => break ty,
                    Err(Error::UnsupportedConstruct { construct, .. }) => {
                        unsupported = Some(construct);
                        while !matches!(self.peek(), Some(Token::Global(_))) {
                            self.skip_balanced()?;
                        }
                        break Type::Void;
                    }
                    Err(e) => return Err(e),
                }
            }
            match self.peek() {
                Some(Token::Global(_)) | None => {
                    return self.error("function without return type")
                }
                Some(Token::Word(_)) if self.peek_at(1) == Some(&Token::Punct('(')) => {
                    self.pos += 1;
                    self.skip_balanced()?;
                }
                _ => self.pos += 1,
            }
        };

        let name = match self.next()? {
            Token::Global(name) => name,
            other => return self.error(format!("expected function name, found {:?}", other)),
        };
        self.function = name.clone();
        self.block.clear();

        self.expect_punct('(')?;
        let mut params = Vec::new();
        let mut variadic = false;
        while !self.eat_punct(')') {
            if self.eat_punct(',') {
                continue;
            }
            if self.peek() == Some(&Token::Ellipsis) {
                self.pos += 1;
                variadic = true;
                continue;
            }
            let ty = match self.parse_type() {
                Ok(ty) => ty,
                Err(Error::UnsupportedConstruct { construct, .. }) => {
                    unsupported.get_or_insert(construct);
                    while !self.is_punct(',') && !self.is_punct(')') {
                        self.skip_balanced()?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut param_name = None;
            while !self.is_punct(',') && !self.is_punct(')') {
                match self.peek() {
                    Some(Token::Local(n)) => {
                        param_name = Some(n.clone());
                        self.pos += 1;
                    }
                    _ => self.skip_balanced()?,
                }
            }
            params.push(Param {
                name: param_name.unwrap_or_else(|| params.len().to_string()),
                ty,
            });
        }

        let mut attributes = Vec::new();
        let mut groups = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Punct('{')) if is_definition => break,
                _ if !is_definition && self.line() != line => break,
                None => break,
                Some(Token::AttrGroup(id)) => {
                    groups.push(*id);
                    self.pos += 1;
                }
                Some(Token::Word(w))
                    if matches!(
                        w.as_str(),
                        "section" | "align" | "gc" | "prefix" | "prologue" | "partition"
                    ) =>
                {
                    self.pos += 1;
                    self.skip_balanced()?;
                }
                Some(Token::Word(w)) if w == "personality" => {
                    unsupported.get_or_insert_with(|| "personality function".to_string());
                    self.pos += 1;
                    self.parse_type()?;
                    self.skip_balanced()?;
                }
                Some(Token::Word(_)) => {
                    if let Some(attribute) = self.parse_attribute()? {
                        attributes.push(attribute);
                    }
                }
                Some(Token::Metadata(_)) => {
                    self.pos += 1;
                    if self.is_punct('(') || self.is_punct('{') {
                        self.skip_balanced()?;
                    }
                }
                _ => self.skip_balanced()?,
            }
        }

        let mut function = Function {
            name: name.clone(),
            ret,
            params,
            variadic,
            attributes,
            blocks: Vec::new(),
            line,
            unsupported,
        };

        if is_definition {
            self.parse_body(&mut function)?;
        }
        debug!(
            "parsed {} @{} with {} blocks",
            if is_definition { "definition" } else { "declaration" },
            name,
            function.blocks.len()
        );
        self.pending.push(PendingFunction { function, groups });
        self.function.clear();
        self.block.clear();
        Ok(())
    }

    fn parse_body(&mut self, function: &mut Function) -> Result<()> {
        self.expect_punct('{')?;
        let mut defined: HashSet<String> = function.params.iter().map(|p| p.name.clone()).collect();
        if defined.len() != function.params.len() {
            return self.error(format!("duplicate parameter name in @{}", function.name));
        }
        let mut labels = HashSet::new();
        // an unlabelled entry block takes the next unnamed value number
        let entry_number = function
            .params
            .iter()
            .filter(|p| p.name.chars().all(|c| c.is_ascii_digit()))
            .count();

        while !self.eat_punct('}') {
            let label = match self.peek().cloned() {
                Some(Token::Label(label)) => {
                    self.pos += 1;
                    label
                }
                Some(_) if function.blocks.is_empty() => entry_number.to_string(),
                other => return self.error(format!("expected block label, found {:?}", other)),
            };
            if !labels.insert(label.clone()) {
                return self.error(format!("redefinition of block %{}", label));
            }
            self.block = label.clone();
            let block = self.parse_block(label, &mut defined)?;
            function.blocks.push(block);
        }
        Ok(())
    }

    fn parse_block(&mut self, label: String, defined: &mut HashSet<String>) -> Result<Block> {
        let mut instructions = Vec::new();
        loop {
            let line = self.line();
            let start = self.pos;
            let result = match (self.peek().cloned(), self.peek_at(1)) {
                (Some(Token::Local(name)), Some(Token::Punct('='))) => {
                    self.pos += 2;
                    Some(name)
                }
                _ => None,
            };
            let opcode = match self.next()? {
                Token::Word(w) => w,
                other => return self.error(format!("expected instruction, found {:?}", other)),
            };
            if let Some(name) = &result {
                if !defined.insert(name.clone()) {
                    return Err(Error::parse(line, format!("redefinition of %{}", name)));
                }
            }

            if let Some(terminator) = self.parse_terminator(&opcode, line)? {
                self.skip_statement(self.previous_line())?;
                return Ok(Block {
                    label,
                    instructions,
                    terminator,
                    terminator_line: line,
                });
            }

            let kind = match self.parse_instruction(&opcode, result.is_some()) {
                Ok(kind) => kind,
                Err(Error::UnsupportedConstruct { construct, .. }) => {
                    debug!("line {}: unsupported '{}'", line, construct);
                    self.pos = start;
                    self.skip_statement(line)?;
                    InstructionKind::Unsupported { construct }
                }
                Err(e) => return Err(e),
            };
            self.skip_statement(self.previous_line())?;
            instructions.push(Instruction { result, kind, line });
        }
    }

    fn parse_terminator(&mut self, opcode: &str, line: usize) -> Result<Option<Terminator>> {
        let terminator = match opcode {
            "ret" => {
                if self.eat_word("void") {
                    Terminator::Ret(None)
                } else {
                    match self.parse_typed_value() {
                        Ok(value) => Terminator::Ret(Some(value)),
                        Err(Error::UnsupportedConstruct { construct, .. }) => {
                            Terminator::Unsupported { construct }
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            "br" => {
                if self.is_word("label") {
                    Terminator::Br(self.expect_label_ref()?)
                } else {
                    let ty = self.parse_type()?;
                    if !ty.is_bool() {
                        return self.error(format!("branch condition of type {}", ty));
                    }
                    let cond = self.parse_value()?;
                    self.expect_punct(',')?;
                    let then = self.expect_label_ref()?;
                    self.expect_punct(',')?;
                    let otherwise = self.expect_label_ref()?;
                    Terminator::CondBr {
                        cond,
                        then,
                        otherwise,
                    }
                }
            }
            "switch" => {
                let ty = self.parse_type()?;
                let value = self.parse_value()?;
                self.expect_punct(',')?;
                let default = self.expect_label_ref()?;
                self.expect_punct('[')?;
                let mut cases = Vec::new();
                while !self.eat_punct(']') {
                    self.parse_type()?;
                    let case = match self.parse_value()? {
                        Operand::Int(value) => value,
                        other => return self.error(format!("non-constant switch case {}", other)),
                    };
                    self.expect_punct(',')?;
                    cases.push((case, self.expect_label_ref()?));
                }
                Terminator::Switch {
                    ty,
                    value,
                    default,
                    cases,
                }
            }
            "unreachable" => Terminator::Unreachable,
            op if UNSUPPORTED_TERMINATORS.contains(&op) => {
                self.pos -= 1;
                self.skip_statement(line)?;
                Terminator::Unsupported {
                    construct: op.to_string(),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(terminator))
    }

    fn skip_flags(&mut self, flags: &[&str]) {
        while let Some(Token::Word(w)) = self.peek() {
            if flags.contains(&w.as_str()) {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn parse_instruction(&mut self, opcode: &str, has_result: bool) -> Result<InstructionKind> {
        if let Some(op) = binary_op(opcode) {
            self.skip_flags(&["nuw", "nsw", "exact", "disjoint"]);
            let ty = self.parse_scalar_type()?;
            let left = self.parse_value()?;
            self.expect_punct(',')?;
            let right = self.parse_value()?;
            return Ok(InstructionKind::Binary {
                op,
                ty,
                left,
                right,
            });
        }
        if let Some(op) = cast_op(opcode) {
            self.skip_flags(&["nuw", "nsw", "nneg"]);
            let value = self.parse_typed_value()?;
            self.expect_word("to")?;
            let to = self.parse_type()?;
            return Ok(InstructionKind::Cast { op, value, to });
        }
        match opcode {
            "icmp" => {
                self.skip_flags(&["samesign"]);
                let predicate = match self.next()? {
                    Token::Word(w) => match int_predicate(&w) {
                        Some(p) => p,
                        None => return self.error(format!("unknown icmp predicate '{}'", w)),
                    },
                    other => return self.error(format!("expected predicate, found {:?}", other)),
                };
                let ty = self.parse_scalar_type()?;
                let left = self.parse_value()?;
                self.expect_punct(',')?;
                let right = self.parse_value()?;
                Ok(InstructionKind::ICmp {
                    predicate,
                    ty,
                    left,
                    right,
                })
            }
            "select" => {
                let cond = self.parse_typed_value()?;
                if !cond.ty.is_bool() {
                    return self.unsupported(format!("select on condition of type {}", cond.ty));
                }
                self.expect_punct(',')?;
                let then = self.parse_typed_value()?;
                self.expect_punct(',')?;
                let otherwise = self.parse_typed_value()?;
                if then.ty != otherwise.ty {
                    return self.error("select arms have different types");
                }
                Ok(InstructionKind::Select {
                    cond: cond.operand,
                    ty: then.ty,
                    then: then.operand,
                    otherwise: otherwise.operand,
                })
            }
            "freeze" => Ok(InstructionKind::Freeze {
                value: self.parse_typed_value()?,
            }),
            "alloca" => {
                self.skip_flags(&["inalloca"]);
                let ty = self.parse_type()?;
                let mut count = None;
                if self.is_punct(',') && self.is_type_start_at(1) {
                    self.pos += 1;
                    count = Some(self.parse_typed_value()?);
                }
                Ok(InstructionKind::Alloca { ty, count })
            }
            "load" => {
                if self.is_word("atomic") {
                    return self.unsupported("atomic load");
                }
                self.skip_flags(&["volatile"]);
                let ty = self.parse_type()?;
                self.expect_punct(',')?;
                let address = self.parse_typed_value()?;
                Ok(InstructionKind::Load {
                    ty,
                    address: address.operand,
                })
            }
            "store" => {
                if self.is_word("atomic") {
                    return self.unsupported("atomic store");
                }
                self.skip_flags(&["volatile"]);
                let value = self.parse_typed_value()?;
                self.expect_punct(',')?;
                let address = self.parse_typed_value()?;
                Ok(InstructionKind::Store {
                    value,
                    address: address.operand,
                })
            }
            "getelementptr" => {
                let (source, base, indices) = self.parse_gep_body()?;
                Ok(InstructionKind::Gep {
                    source,
                    base: base.operand,
                    indices,
                })
            }
            "phi" => {
                self.skip_fast_math_flags();
                let ty = self.parse_scalar_type()?;
                let mut incoming = Vec::new();
                loop {
                    self.expect_punct('[')?;
                    let value = self.parse_value()?;
                    self.expect_punct(',')?;
                    let block = self.expect_local()?;
                    self.expect_punct(']')?;
                    incoming.push((value, block));
                    if !self.eat_punct(',') || !self.is_punct('[') {
                        break;
                    }
                }
                Ok(InstructionKind::Phi { ty, incoming })
            }
            "call" | "tail" | "musttail" | "notail" => {
                if opcode != "call" {
                    self.expect_word("call")?;
                }
                self.parse_call(has_result)
            }
            op if UNSUPPORTED_OPCODES.contains(&op) => self.unsupported(op),
            op if EXCEPTION_PADS.contains(&op) => {
                self.unsupported(format!("exception handling ({})", op))
            }
            other => self.error(format!("unknown opcode '{}'", other)),
        }
    }

    /// Integer or pointer type `offset` tokens ahead, used to tell an
    /// optional typed operand from trailing `align` and metadata.
    fn is_type_start_at(&self, offset: usize) -> bool {
        match self.peek_at(offset) {
            Some(Token::Word(w)) => {
                w == "ptr" || (w.starts_with('i') && w[1..].chars().all(|c| c.is_ascii_digit()))
            }
            _ => false,
        }
    }

    fn skip_fast_math_flags(&mut self) {
        self.skip_flags(&[
            "fast", "nnan", "ninf", "nsz", "arcp", "contract", "afn", "reassoc",
        ]);
    }

    /// Integer or pointer type; vectors and floats are unsupported.
    fn parse_scalar_type(&mut self) -> Result<Type> {
        let ty = self.parse_type()?;
        match ty {
            Type::Int(_) | Type::Ptr | Type::Named(_) | Type::Struct(_) | Type::Array(..) => Ok(ty),
            Type::Vector(..) => self.unsupported(format!("vector operation on {}", ty)),
            Type::Float(_) => self.unsupported(format!("floating point operation on {}", ty)),
            other => self.error(format!("unexpected operand type {}", other)),
        }
    }

    fn parse_gep_body(&mut self) -> Result<(Type, TypedOperand, Vec<TypedOperand>)> {
        self.skip_flags(&["inbounds", "nuw", "nusw"]);
        if self.is_word("inrange") {
            self.pos += 1;
            self.skip_balanced()?;
        }
        let source = self.parse_type()?;
        self.expect_punct(',')?;
        let base = self.parse_typed_value()?;
        let mut indices = Vec::new();
        while self.is_punct(',') && self.is_type_start_at(1) {
            self.pos += 1;
            if self.is_word("inrange") {
                self.pos += 1;
                self.skip_balanced()?;
            }
            indices.push(self.parse_typed_value()?);
        }
        Ok((source, base, indices))
    }

    fn parse_call(&mut self, has_result: bool) -> Result<InstructionKind> {
        self.skip_fast_math_flags();
        // calling convention and return attributes
        while !self.is_type_start() {
            match self.peek() {
                Some(Token::Word(_)) if self.peek_at(1) == Some(&Token::Punct('(')) => {
                    self.pos += 1;
                    self.skip_balanced()?;
                }
                Some(Token::Word(w)) if w == "align" => {
                    self.pos += 2;
                }
                Some(Token::Word(_)) => self.pos += 1,
                other => return self.error(format!("expected call return type, found {:?}", other)),
            }
        }
        let ret = self.parse_type()?;
        if self.is_punct('(') {
            // explicit function type, only needed for varargs
            self.pos += 1;
            while !self.eat_punct(')') {
                if self.peek() == Some(&Token::Ellipsis) {
                    return self.unsupported("variadic call");
                }
                self.skip_balanced()?;
            }
            // typed-pointer spelling of the function type
            self.eat_punct('*');
        }
        let callee = match self.next()? {
            Token::Global(name) => name,
            Token::Local(name) => return self.unsupported(format!("indirect call through %{}", name)),
            Token::Word(w) if w == "asm" => return self.unsupported("inline assembly"),
            other => return self.error(format!("expected callee, found {:?}", other)),
        };
        self.expect_punct('(')?;
        let mut args = Vec::new();
        while !self.eat_punct(')') {
            let ty = self.parse_type()?;
            if ty == Type::Metadata {
                while !self.is_punct(',') && !self.is_punct(')') {
                    self.skip_balanced()?;
                }
            } else {
                while let Some(Token::Word(w)) = self.peek().cloned() {
                    if is_value_keyword(&w) {
                        break;
                    }
                    self.pos += 1;
                    if self.is_punct('(') {
                        self.skip_balanced()?;
                    } else if w == "align" || w == "dereferenceable" {
                        self.pos += 1;
                    }
                }
                let operand = self.parse_value()?;
                args.push(TypedOperand { ty, operand });
            }
            if !self.eat_punct(',') {
                self.expect_punct(')')?;
                break;
            }
        }
        if has_result && ret.is_void() {
            return self.error(format!("call to void @{} has a result", callee));
        }
        Ok(InstructionKind::Call { callee, ret, args })
    }

    //
    // Values
    //

    fn parse_typed_value(&mut self) -> Result<TypedOperand> {
        let ty = self.parse_type()?;
        if let Type::Vector(..) = ty {
            return self.unsupported(format!("vector value of type {}", ty));
        }
        if let Type::Float(_) = ty {
            return self.unsupported(format!("floating point value of type {}", ty));
        }
        // parameter attributes in front of values
        while let Some(Token::Word(w)) = self.peek() {
            if is_value_keyword(w) {
                break;
            }
            self.pos += 1;
        }
        let operand = self.parse_value()?;
        Ok(TypedOperand { ty, operand })
    }

    fn parse_value(&mut self) -> Result<Operand> {
        match self.next()? {
            Token::Local(name) => Ok(Operand::Local(name)),
            Token::Global(name) => Ok(Operand::Global(name)),
            Token::Int(value) => Ok(Operand::Int(value)),
            Token::Word(w) => match w.as_str() {
                "true" => Ok(Operand::Int(1)),
                "false" => Ok(Operand::Int(0)),
                "null" => Ok(Operand::Null),
                "zeroinitializer" => Ok(Operand::Int(0)),
                "undef" | "poison" => Ok(Operand::Undef),
                "getelementptr" => {
                    self.expect_punct('(')?;
                    let (source, base, indices) = self.parse_gep_body()?;
                    self.expect_punct(')')?;
                    Ok(Operand::ConstExpr(Box::new(ConstExpr::Gep {
                        source,
                        base,
                        indices,
                    })))
                }
                w if cast_op(w).is_some() => {
                    let op = cast_op(w).ok_or_else(|| Error::parse(self.line(), "cast"))?;
                    self.expect_punct('(')?;
                    let value = self.parse_typed_value()?;
                    self.expect_word("to")?;
                    let to = self.parse_type()?;
                    self.expect_punct(')')?;
                    Ok(Operand::ConstExpr(Box::new(ConstExpr::Cast { op, value, to })))
                }
                w if w.contains('.') || w.starts_with("0x") => {
                    self.unsupported(format!("floating point constant {}", w))
                }
                other => self.error(format!("unexpected value '{}'", other)),
            },
            Token::Punct('<') => self.unsupported("vector constant"),
            other => self.error(format!("expected value, found {:?}", other)),
        }
    }
}

fn is_value_keyword(word: &str) -> bool {
    matches!(
        word,
        "true"
            | "false"
            | "null"
            | "zeroinitializer"
            | "undef"
            | "poison"
            | "getelementptr"
            | "trunc"
            | "zext"
            | "sext"
            | "bitcast"
            | "ptrtoint"
            | "inttoptr"
    ) || word.contains('.')
        || word.starts_with("0x")
}

fn binary_op(opcode: &str) -> Option<BinaryOp> {
    Some(match opcode {
        "add" => BinaryOp::Add,
        "sub" => BinaryOp::Sub,
        "mul" => BinaryOp::Mul,
        "udiv" => BinaryOp::UDiv,
        "sdiv" => BinaryOp::SDiv,
        "urem" => BinaryOp::URem,
        "srem" => BinaryOp::SRem,
        "shl" => BinaryOp::Shl,
        "lshr" => BinaryOp::LShr,
        "ashr" => BinaryOp::AShr,
        "and" => BinaryOp::And,
        "or" => BinaryOp::Or,
        "xor" => BinaryOp::Xor,
        _ => return None,
    })
}

fn cast_op(opcode: &str) -> Option<CastOp> {
    Some(match opcode {
        "trunc" => CastOp::Trunc,
        "zext" => CastOp::ZExt,
        "sext" => CastOp::SExt,
        "bitcast" => CastOp::BitCast,
        "ptrtoint" => CastOp::PtrToInt,
        "inttoptr" => CastOp::IntToPtr,
        _ => return None,
    })
}

fn int_predicate(name: &str) -> Option<IntPredicate> {
    Some(match name {
        "eq" => IntPredicate::Eq,
        "ne" => IntPredicate::Ne,
        "ugt" => IntPredicate::Ugt,
        "uge" => IntPredicate::Uge,
        "ult" => IntPredicate::Ult,
        "ule" => IntPredicate::Ule,
        "sgt" => IntPredicate::Sgt,
        "sge" => IntPredicate::Sge,
        "slt" => IntPredicate::Slt,
        "sle" => IntPredicate::Sle,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLANG_MAIN: &str = r#"
; ModuleID = 'test.c'
source_filename = "test.c"
target datalayout = "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-f80:128-n8:16:32:64-S128"
target triple = "x86_64-pc-linux-gnu"

%struct.pair = type { i32, i64 }

@counter = dso_local global i32 7, align 4
@.str = private unnamed_addr constant [4 x i8] c"abc\00", align 1

; Function Attrs: noinline nounwind optnone uwtable
define dso_local i32 @main(i32 noundef %0, ptr noundef %1) #0 {
  %3 = alloca i32, align 4
  store i32 %0, ptr %3, align 4
  %4 = load i32, ptr %3, align 4
  %5 = icmp sgt i32 %4, 0
  br i1 %5, label %6, label %7

6:                                                ; preds = %2
  ret i32 1

7:                                                ; preds = %2
  %8 = call i32 @helper(i32 noundef %4)
  ret i32 %8
}

declare i32 @helper(i32 noundef) #1

attributes #0 = { noinline nounwind optnone uwtable "frame-pointer"="all" }
attributes #1 = { memory(none) "no-trapping-math"="true" }

!llvm.module.flags = !{!0}
!0 = !{i32 1, !"wchar_size", i32 4}
"#;

    #[test]
    fn parses_clang_output() {
        let module = parse_module(CLANG_MAIN).expect("parses");
        assert_eq!(module.source_filename.as_deref(), Some("test.c"));
        assert_eq!(module.globals.len(), 2);
        assert_eq!(module.global("counter").unwrap().init, Some(Initializer::Int(7)));
        assert_eq!(
            module.global(".str").unwrap().init,
            Some(Initializer::Bytes(b"abc\0".to_vec()))
        );

        let main = module.function("main").unwrap();
        assert_eq!(main.params.len(), 2);
        assert_eq!(main.params[0].name, "0");
        let labels: Vec<&str> = main.blocks.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["2", "6", "7"]);
        assert_eq!(main.blocks[0].instructions.len(), 4);
        assert!(matches!(
            main.blocks[0].terminator,
            Terminator::CondBr { ref then, .. } if then == "6"
        ));

        let helper = module.function("helper").unwrap();
        assert!(helper.is_declaration());
        assert!(helper.has_attribute("memory(none)"));
        assert_eq!(
            module.size_of(&Type::Named("struct.pair".to_string())),
            Some(16)
        );
    }

    #[test]
    fn vector_of_vectors_becomes_unsupported_instruction() {
        let text = r#"
define i32 @f(i32 %x) {
entry:
  %v = load <2 x <2 x i32>>, ptr null, align 16
  ret i32 %x
}
"#;
        let module = parse_module(text).expect("loads");
        let f = module.function("f").unwrap();
        assert_eq!(
            f.blocks[0].instructions[0].kind,
            InstructionKind::Unsupported {
                construct: "vector of vectors".to_string()
            }
        );
    }

    #[test]
    fn variadic_calls_and_landing_pads_are_unsupported() {
        let text = r#"
declare i32 @printf(ptr, ...)

define void @g() {
entry:
  %r = call i32 (ptr, ...) @printf(ptr null)
  %lp = landingpad { ptr, i32 } cleanup
  ret void
}
"#;
        let module = parse_module(text).expect("loads");
        let g = module.function("g").unwrap();
        let constructs: Vec<&InstructionKind> =
            g.blocks[0].instructions.iter().map(|i| &i.kind).collect();
        assert!(matches!(constructs[0], InstructionKind::Unsupported { construct } if construct == "variadic call"));
        assert!(matches!(constructs[1], InstructionKind::Unsupported { construct } if construct.contains("exception")));
        assert!(module.function("printf").unwrap().variadic);
    }

    #[test]
    fn rejects_malformed_text_with_line() {
        let text = "define i32 @f() {\nentry:\n  %x = add i32 1,\n}\n";
        match parse_module(text) {
            Err(Error::Parse { line, .. }) => assert!(line >= 3),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_opcode_is_a_parse_error() {
        let text = "define void @f() {\nentry:\n  %x = frobnicate i32 1\n  ret void\n}\n";
        assert!(matches!(parse_module(text), Err(Error::Parse { line: 3, .. })));
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let text = "define i32 @f(i32 %a) {\nentry:\n  %a = add i32 1, 2\n  ret i32 %a\n}\n";
        assert!(matches!(parse_module(text), Err(Error::Parse { .. })));
    }

    #[test]
    fn parses_switch_phi_and_typed_pointers() {
        let text = r#"
define i32 @s(i32 %x, i32* %p) {
entry:
  %v = load i32, i32* %p, align 4
  switch i32 %x, label %other [
    i32 0, label %zero
    i32 1, label %one
  ]
zero:
  br label %done
one:
  br label %done
other:
  br label %done
done:
  %r = phi i32 [ 10, %zero ], [ 11, %one ], [ %v, %other ]
  ret i32 %r
}
"#;
        let module = parse_module(text).expect("parses");
        let s = module.function("s").unwrap();
        assert_eq!(s.params[1].ty, Type::Ptr);
        match &s.blocks[0].terminator {
            Terminator::Switch { cases, default, .. } => {
                assert_eq!(default, "other");
                assert_eq!(cases, &vec![(0, "zero".to_string()), (1, "one".to_string())]);
            }
            other => panic!("expected switch, got {:?}", other),
        }
        match &s.blocks[4].instructions[0].kind {
            InstructionKind::Phi { incoming, .. } => assert_eq!(incoming.len(), 3),
            other => panic!("expected phi, got {:?}", other),
        }
    }
}
