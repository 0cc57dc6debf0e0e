//! Capability routing: questions a persona's integrations answer without
//! the campus knowledge base.
//!
//! Arithmetic and one-variable linear equations are solved locally and never
//! reach a backend. Programming questions skip retrieval and are generated
//! under code-support instructions. Each route is off unless the persona
//! enables its integration.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use campuskb_core::IntegrationToggles;

#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    Math(MathSolution),
    Code(CodeQuestion),
}

/// Pick the capability that should handle `message`, if any.
///
/// Code detection runs first so a snippet containing an assignment is not
/// mistaken for an equation.
pub fn route(message: &str, toggles: &IntegrationToggles) -> Option<Capability> {
    if toggles.code_support {
        if let Some(question) = detect_code(message) {
            return Some(Capability::Code(question));
        }
    }
    if toggles.math_solver {
        if let Some(solution) = solve_math(message) {
            return Some(Capability::Math(solution));
        }
    }
    None
}

// ---- math ----

#[derive(Debug, Clone, PartialEq)]
pub struct MathSolution {
    /// The expression or equation as found in the message.
    pub expression: String,
    /// Working, one line per step; the last line holds the answer.
    pub steps: Vec<String>,
}

impl MathSolution {
    pub fn answer(&self) -> &str {
        self.steps.last().map(String::as_str).unwrap_or_default()
    }

    pub fn render(&self) -> String {
        self.steps.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MathError {
    #[error("unexpected '{0}'")]
    Unexpected(String),
    #[error("expression ends early")]
    Incomplete,
    #[error("expression nests too deeply")]
    TooDeep,
    #[error("division by zero")]
    DivisionByZero,
    #[error("only linear equations in x are supported")]
    Nonlinear,
    #[error("result is not a finite number")]
    NotFinite,
    #[error("nothing to solve")]
    NothingToSolve,
}

/// Words that announce a calculation anywhere in the message.
static MATH_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(calculate|compute|evaluate|solve|simplify)\b").unwrap());
/// "what is" only counts directly in front of the expression.
static WHAT_IS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bwhat(?:'s|\s+is)\s*$").unwrap());
static MATH_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9x.+\-*/^()=\s]+").unwrap());

const MAX_DEPTH: usize = 64;

/// Solve the arithmetic or linear equation a message asks about.
pub fn solve_math(message: &str) -> Option<MathSolution> {
    let span = MATH_SPAN
        .find_iter(message)
        .filter(|m| m.as_str().chars().any(|c| c.is_ascii_digit()))
        .max_by_key(|m| m.as_str().trim().len())?;
    let expression = span.as_str().split_whitespace().collect::<Vec<_>>().join(" ");
    if !expression.contains(|c: char| "+-*/^=".contains(c)) {
        return None;
    }

    let before = &message[..span.start()];
    let rest = before
        .chars()
        .chain(message[span.end()..].chars())
        .filter(|c| c.is_alphanumeric())
        .count();
    let asked = MATH_VERB.is_match(message) || WHAT_IS.is_match(before) || rest == 0;
    if !asked {
        return None;
    }

    match evaluate(&expression) {
        Ok(solution) => Some(solution),
        Err(e) => {
            debug!("Not solving '{}': {}", expression, e);
            None
        }
    }
}

/// Evaluate an arithmetic expression, or solve `lhs = rhs` for x.
pub fn evaluate(expression: &str) -> Result<MathSolution, MathError> {
    let expression = expression.trim().trim_end_matches('=').trim();
    let sides: Vec<&str> = expression.split('=').collect();
    match sides.as_slice() {
        [single] => {
            let value = parse(single)?;
            if value.a != 0.0 {
                return Err(MathError::NothingToSolve);
            }
            Ok(MathSolution {
                expression: single.trim().to_string(),
                steps: vec![format!("{} = {}", single.trim(), number(value.b))],
            })
        }
        [lhs, rhs] => {
            // a*x + b = 0
            let Linear { a, b } = parse(lhs)?.sub(parse(rhs)?);
            if a == 0.0 {
                return Err(MathError::NothingToSolve);
            }
            let c = -b;
            let x = c / a;
            if !x.is_finite() {
                return Err(MathError::NotFinite);
            }
            let steps = vec![
                expression.to_string(),
                format!("{} = {}", coefficient(a), number(c)),
                format!("x = {}", number(x)),
            ];
            Ok(MathSolution {
                expression: expression.to_string(),
                steps,
            })
        }
        _ => Err(MathError::Unexpected("=".into())),
    }
}

fn parse(input: &str) -> Result<Linear, MathError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let value = parser.expr()?;
    match parser.peek() {
        None => Ok(value),
        Some(token) => Err(MathError::Unexpected(token.to_string())),
    }
}

/// `a*x + b`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Linear {
    a: f64,
    b: f64,
}

impl Linear {
    fn constant(b: f64) -> Self {
        Self { a: 0.0, b }
    }

    fn add(self, o: Self) -> Self {
        Self { a: self.a + o.a, b: self.b + o.b }
    }

    fn sub(self, o: Self) -> Self {
        Self { a: self.a - o.a, b: self.b - o.b }
    }

    fn mul(self, o: Self) -> Result<Self, MathError> {
        if self.a != 0.0 && o.a != 0.0 {
            return Err(MathError::Nonlinear);
        }
        finite(Self {
            a: self.a * o.b + o.a * self.b,
            b: self.b * o.b,
        })
    }

    fn div(self, o: Self) -> Result<Self, MathError> {
        if o.a != 0.0 {
            return Err(MathError::Nonlinear);
        }
        if o.b == 0.0 {
            return Err(MathError::DivisionByZero);
        }
        finite(Self { a: self.a / o.b, b: self.b / o.b })
    }

    fn pow(self, o: Self) -> Result<Self, MathError> {
        if self.a != 0.0 || o.a != 0.0 {
            return Err(MathError::Nonlinear);
        }
        finite(Self::constant(self.b.powf(o.b)))
    }
}

fn finite(v: Linear) -> Result<Linear, MathError> {
    if v.a.is_finite() && v.b.is_finite() {
        Ok(v)
    } else {
        Err(MathError::NotFinite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Num(f64),
    X,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Open,
    Close,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Num(n) => write!(f, "{}", number(*n)),
            Token::X => f.write_str("x"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Caret => f.write_str("^"),
            Token::Open => f.write_str("("),
            Token::Close => f.write_str(")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, MathError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let token = match c {
            ' ' | '\t' | '\n' => continue,
            '0'..='9' | '.' => {
                let mut end = i + 1;
                while let Some(&(j, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = j + 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &input[i..end];
                Token::Num(text.parse().map_err(|_| MathError::Unexpected(text.into()))?)
            }
            'x' => Token::X,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '^' => Token::Caret,
            '(' => Token::Open,
            ')' => Token::Close,
            other => return Err(MathError::Unexpected(other.to_string())),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

/// expr  := term (('+' | '-') term)*
/// term  := unary (('*' | '/') unary | implicit)*
/// unary := ('-' | '+') unary | power
/// power := atom ('^' unary)?
/// atom  := number | 'x' | '(' expr ')'
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Linear, MathError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(MathError::TooDeep);
        }
        let mut value = self.term()?;
        while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = finite(if op == Token::Plus { value.add(rhs) } else { value.sub(rhs) })?;
        }
        self.depth -= 1;
        Ok(value)
    }

    fn term(&mut self) -> Result<Linear, MathError> {
        let mut value = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    value = value.mul(self.unary()?)?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    value = value.div(self.unary()?)?;
                }
                // 2x, 2(x + 1), (a)(b)
                Some(Token::X | Token::Open) => value = value.mul(self.power()?)?,
                _ => return Ok(value),
            }
        }
    }

    fn unary(&mut self) -> Result<Linear, MathError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    return Err(MathError::TooDeep);
                }
                let value = self.unary()?;
                self.depth -= 1;
                Ok(Linear { a: -value.a, b: -value.b })
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Linear, MathError> {
        let base = self.atom()?;
        if self.peek() == Some(Token::Caret) {
            self.pos += 1;
            return base.pow(self.unary()?);
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Linear, MathError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Linear::constant(n)),
            Some(Token::X) => Ok(Linear { a: 1.0, b: 0.0 }),
            Some(Token::Open) => {
                let value = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    Some(other) => Err(MathError::Unexpected(other.to_string())),
                    None => Err(MathError::Incomplete),
                }
            }
            Some(other) => Err(MathError::Unexpected(other.to_string())),
            None => Err(MathError::Incomplete),
        }
    }
}

/// Integers print without a fraction; everything else to at most six places.
fn number(v: f64) -> String {
    if v == 0.0 {
        return "0".into();
    }
    if v.fract() == 0.0 && v.abs() < 1e15 {
        return format!("{}", v as i64);
    }
    let text = format!("{:.6}", v);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn coefficient(a: f64) -> String {
    if a == 1.0 {
        "x".into()
    } else if a == -1.0 {
        "-x".into()
    } else {
        format!("{}x", number(a))
    }
}

// ---- code ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeQuestion {
    pub language: Option<&'static str>,
}

/// Programming vocabulary. Words that are everyday campus terms ("class",
/// "program", "code", "function", "error") are left out.
static CODE_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(coding|algorithm|syntax|compiler|compile|debug|debugging|python|javascript|typescript|java|rust|golang|html|css|sql|programming|variable|recursion|regex|stack trace|segfault)\b|c\+\+",
    )
    .unwrap()
});

static CODE_SHAPES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)```|`[^`\n]+`|\bdef\s+\w+\s*\(|\bfunction\s+\w+\s*\(|\bfn\s+\w+\s*\(|#include\s*<|\bselect\s+.+\s+from\s+\w+|\bpublic\s+static\s+void\s+main",
    )
    .unwrap()
});

static FENCE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"```([A-Za-z+#]+)").unwrap());

static LANGUAGE_SHAPES: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("python", r"\bdef\s+\w+\s*\(.*\):|(?m)^\s*import\s+\w+\s*$|\bfrom\s+\w+\s+import\b"),
        ("rust", r"\bfn\s+\w+\s*\(|\blet\s+mut\s+|\bimpl\s+\w+"),
        ("javascript", r"\bfunction\s+\w+\s*\(|\b(const|let)\s+\w+\s*=|=>"),
        ("java", r"\bpublic\s+(static\s+void\s+main|class\s+\w+)"),
        ("c", r"#include\s*<\w+(\.h)?>"),
        ("html", r"(?i)<(html|body|div)\b"),
        ("sql", r"(?i)\bselect\s+.+\s+from\s+|\binsert\s+into\b|\bcreate\s+table\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).unwrap()))
    .collect()
});

const NAMED_LANGUAGES: &[&str] = &[
    "python", "javascript", "typescript", "java", "rust", "golang", "html", "css", "sql", "c++",
];

pub fn detect_code(message: &str) -> Option<CodeQuestion> {
    if !CODE_WORDS.is_match(message) && !CODE_SHAPES.is_match(message) {
        return None;
    }
    Some(CodeQuestion {
        language: guess_language(message),
    })
}

/// Fence tag first, then the shape of the code, then a language named in prose.
pub fn guess_language(text: &str) -> Option<&'static str> {
    if let Some(tag) = FENCE_TAG.captures(text).and_then(|c| c.get(1)) {
        let tag = tag.as_str().to_ascii_lowercase();
        let tag = match tag.as_str() {
            "py" => "python",
            "js" => "javascript",
            "ts" => "typescript",
            "rs" => "rust",
            "cpp" => "c++",
            other => other,
        };
        if let Some(known) = NAMED_LANGUAGES.iter().chain(&["c"]).find(|l| **l == tag) {
            return Some(*known);
        }
    }
    if let Some((name, _)) = LANGUAGE_SHAPES.iter().find(|(_, re)| re.is_match(text)) {
        return Some(name);
    }
    let lower = text.to_ascii_lowercase();
    NAMED_LANGUAGES
        .iter()
        .find(|l| {
            lower
                .split(|c: char| !(c.is_alphanumeric() || c == '+'))
                .any(|word| word == **l)
        })
        .copied()
}
