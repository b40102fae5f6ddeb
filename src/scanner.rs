use once_cell::sync::Lazy;
use strum_macros::{Display, EnumCount};

use crate::error::ScanError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumCount)]
pub enum TokenType {
    // Single-character tokens.
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Minus,
    Plus,
    Semicolon,
    Slash,
    Star,
    Percent,

    // One or two character tokens.
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    PercentEqual,

    // Literals.
    Identifier,
    String,
    Int,
    Float,

    // Keywords.
    And,
    Or,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Null,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    Loop,
    Break,
    Continue,
    Static,
    Mixin,
    Init,
    Test,
    TestCase,
    Build,
    Bind,
    Queue,
    Throw,
    Yield,
    Freeze,

    Eof,
}

static KEYWORDS: phf::Map<&'static str, TokenType> = phf::phf_map! {
    "and" => TokenType::And,
    "or" => TokenType::Or,
    "class" => TokenType::Class,
    "else" => TokenType::Else,
    "false" => TokenType::False,
    "for" => TokenType::For,
    "fun" => TokenType::Fun,
    "if" => TokenType::If,
    "null" => TokenType::Null,
    "nil" => TokenType::Null,
    "return" => TokenType::Return,
    "super" => TokenType::Super,
    "this" => TokenType::This,
    "true" => TokenType::True,
    "var" => TokenType::Var,
    "while" => TokenType::While,
    "loop" => TokenType::Loop,
    "break" => TokenType::Break,
    "continue" => TokenType::Continue,
    "static" => TokenType::Static,
    "mixin" => TokenType::Mixin,
    "init" => TokenType::Init,
    "test" => TokenType::Test,
    "testcase" => TokenType::TestCase,
    "build" => TokenType::Build,
    "bind" => TokenType::Bind,
    "queue" => TokenType::Queue,
    "throw" => TokenType::Throw,
    "yield" => TokenType::Yield,
    "freeze" => TokenType::Freeze,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    None,
    Number(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub token_type: TokenType,
    pub lexeme: String,
    pub literal: Literal,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn synthetic(token_type: TokenType, lexeme: &str) -> Token {
        Token {
            token_type,
            lexeme: lexeme.to_string(),
            literal: Literal::None,
            line: 0,
            column: 0,
        }
    }
}

type CharGenerator = fn(&mut Scanner) -> Result<(), ScanError>;

/// Handlers for characters that start a token by themselves (possibly widened
/// by one `match_char`). Indexed by ASCII code.
static SINGLE_CHAR_GENERATORS: Lazy<[Option<CharGenerator>; 128]> = Lazy::new(|| {
    let mut table: [Option<CharGenerator>; 128] = [None; 128];
    table['(' as usize] = Some(|s| s.add_token(TokenType::LeftParen));
    table[')' as usize] = Some(|s| s.add_token(TokenType::RightParen));
    table['{' as usize] = Some(|s| s.add_token(TokenType::LeftBrace));
    table['}' as usize] = Some(|s| s.add_token(TokenType::RightBrace));
    table['[' as usize] = Some(|s| s.add_token(TokenType::LeftBracket));
    table[']' as usize] = Some(|s| s.add_token(TokenType::RightBracket));
    table[',' as usize] = Some(|s| s.add_token(TokenType::Comma));
    table['.' as usize] = Some(|s| s.add_token(TokenType::Dot));
    table[';' as usize] = Some(|s| s.add_token(TokenType::Semicolon));
    table['-' as usize] = Some(|s| s.add_either('=', TokenType::MinusEqual, TokenType::Minus));
    table['+' as usize] = Some(|s| s.add_either('=', TokenType::PlusEqual, TokenType::Plus));
    table['*' as usize] = Some(|s| s.add_either('=', TokenType::StarEqual, TokenType::Star));
    table['%' as usize] = Some(|s| s.add_either('=', TokenType::PercentEqual, TokenType::Percent));
    table['!' as usize] = Some(|s| s.add_either('=', TokenType::BangEqual, TokenType::Bang));
    table['=' as usize] = Some(|s| s.add_either('=', TokenType::EqualEqual, TokenType::Equal));
    table['<' as usize] = Some(|s| s.add_either('=', TokenType::LessEqual, TokenType::Less));
    table['>' as usize] = Some(|s| s.add_either('=', TokenType::GreaterEqual, TokenType::Greater));
    table['/' as usize] = Some(Scanner::slash_or_comment);
    table
});

trait TokenGenerator: Sync {
    fn matches(&self, ch: char) -> bool;
    fn consume(&self, scanner: &mut Scanner, ch: char) -> Result<(), ScanError>;
}

struct WhitespaceGenerator;
struct StringGenerator;
struct NumberGenerator;
struct IdentifierGenerator;

// Tried in order after the single-character table; first match wins.
static GENERATORS: [&dyn TokenGenerator; 4] = [
    &WhitespaceGenerator,
    &StringGenerator,
    &NumberGenerator,
    &IdentifierGenerator,
];

impl TokenGenerator for WhitespaceGenerator {
    fn matches(&self, ch: char) -> bool {
        ch.is_whitespace()
    }

    fn consume(&self, _scanner: &mut Scanner, _ch: char) -> Result<(), ScanError> {
        Ok(())
    }
}

impl TokenGenerator for StringGenerator {
    fn matches(&self, ch: char) -> bool {
        ch == '"'
    }

    fn consume(&self, scanner: &mut Scanner, _ch: char) -> Result<(), ScanError> {
        let mut content = String::new();
        loop {
            match scanner.peek() {
                None => return Err(scanner.error("Unterminated string.")),
                Some('"') => {
                    scanner.advance();
                    break;
                }
                Some('\\') => {
                    scanner.advance();
                    let escaped = match scanner.advance() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some(other) => other,
                        None => return Err(scanner.error("Unterminated string.")),
                    };
                    content.push(escaped);
                }
                Some(_) => {
                    if let Some(ch) = scanner.advance() {
                        content.push(ch);
                    }
                }
            }
        }
        scanner.add_literal_token(TokenType::String, Literal::String(content))
    }
}

impl TokenGenerator for NumberGenerator {
    fn matches(&self, ch: char) -> bool {
        ch.is_ascii_digit()
    }

    fn consume(&self, scanner: &mut Scanner, _ch: char) -> Result<(), ScanError> {
        scanner.advance_while(|c| c.is_ascii_digit());

        let mut token_type = TokenType::Int;
        if scanner.peek() == Some('.') && scanner.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            scanner.advance();
            scanner.advance_while(|c| c.is_ascii_digit());
            token_type = TokenType::Float;
        }

        let lexeme = scanner.lexeme();
        let number = lexeme
            .parse::<f64>()
            .map_err(|_| scanner.error(&format!("Malformed number '{}'.", lexeme)))?;
        scanner.add_literal_token(token_type, Literal::Number(number))
    }
}

impl TokenGenerator for IdentifierGenerator {
    fn matches(&self, ch: char) -> bool {
        Scanner::is_alpha(ch)
    }

    fn consume(&self, scanner: &mut Scanner, _ch: char) -> Result<(), ScanError> {
        scanner.advance_while(|c| Scanner::is_alpha(c) || c.is_ascii_digit());
        let lexeme = scanner.lexeme();
        let token_type = KEYWORDS.get(lexeme.as_str()).copied().unwrap_or(TokenType::Identifier);
        scanner.add_token(token_type)
    }
}

#[derive(Default)]
pub struct Scanner {
    source: Vec<char>,
    tokens: Vec<Token>,
    start: usize,
    current: usize,
    line: usize,
    column: usize,
    start_line: usize,
    start_column: usize,
}

impl Scanner {
    pub fn new() -> Scanner {
        let mut scanner = Scanner::default();
        scanner.reset();
        scanner
    }

    pub fn reset(&mut self) {
        self.source.clear();
        self.tokens.clear();
        self.start = 0;
        self.current = 0;
        self.line = 1;
        self.column = 0;
        self.start_line = 1;
        self.start_column = 1;
    }

    pub fn scan(&mut self, text: &str) -> Result<Vec<Token>, ScanError> {
        self.reset();
        self.source = text.chars().collect();

        while let Some(ch) = self.begin_token() {
            let generator = if ch.is_ascii() { SINGLE_CHAR_GENERATORS[ch as usize] } else { None };
            if let Some(generator) = generator {
                generator(self)?;
                continue;
            }

            match GENERATORS.iter().find(|g| g.matches(ch)) {
                Some(generator) => generator.consume(self, ch)?,
                None => return Err(self.error(&format!("Unexpected character '{}'.", ch))),
            }
        }

        self.start = self.current;
        self.start_line = self.line;
        self.start_column = self.column + 1;
        self.add_token(TokenType::Eof)?;
        Ok(std::mem::take(&mut self.tokens))
    }

    fn begin_token(&mut self) -> Option<char> {
        self.start = self.current;
        self.start_line = self.line;
        self.start_column = self.column + 1;
        self.advance()
    }

    fn is_alpha(ch: char) -> bool {
        ch.is_ascii_alphabetic() || ch == '_'
    }

    fn slash_or_comment(&mut self) -> Result<(), ScanError> {
        if self.match_char('/') {
            self.advance_while(|c| c != '\n');
            return Ok(());
        }

        if self.match_char('*') {
            // Non-nesting: closes on the first adjacent "*/".
            while self.peek().is_some() {
                if self.match_char('*') && self.match_char('/') {
                    break;
                }
                if self.peek() != Some('*') {
                    self.advance();
                }
            }
            return Ok(());
        }

        self.add_either('=', TokenType::SlashEqual, TokenType::Slash)
    }

    fn add_either(&mut self, expected: char, matched: TokenType, otherwise: TokenType) -> Result<(), ScanError> {
        if self.match_char(expected) {
            self.add_token(matched)
        } else {
            self.add_token(otherwise)
        }
    }

    fn add_token(&mut self, token_type: TokenType) -> Result<(), ScanError> {
        self.add_literal_token(token_type, Literal::None)
    }

    fn add_literal_token(&mut self, token_type: TokenType, literal: Literal) -> Result<(), ScanError> {
        let lexeme = self.lexeme();
        self.tokens.push(Token {
            token_type,
            lexeme,
            literal,
            line: self.start_line,
            column: self.start_column,
        });
        Ok(())
    }

    fn lexeme(&self) -> String {
        self.source[self.start..self.current].iter().collect()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.current).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.source.get(self.current + 1).copied()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            return true;
        }
        false
    }

    fn advance_while(&mut self, predicate: impl Fn(char) -> bool) {
        while let Some(ch) = self.peek() {
            if !predicate(ch) {
                break;
            }
            self.advance();
        }
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.current += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn error(&self, message: &str) -> ScanError {
        ScanError {
            message: message.to_string(),
            line: self.start_line,
            column: self.start_column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(text: &str) -> Vec<TokenType> {
        Scanner::new().scan(text).unwrap().iter().map(|t| t.token_type).collect()
    }

    #[test]
    fn test_check_keyword() {
        let tokens = Scanner::new().scan("this is for if fun fun1 forfor testcase").unwrap();
        assert!(tokens[0].token_type == TokenType::This);
        assert!(tokens[1].token_type == TokenType::Identifier);
        assert!(tokens[1].lexeme == "is");
        assert!(tokens[2].token_type == TokenType::For);
        assert!(tokens[3].token_type == TokenType::If);
        assert!(tokens[4].token_type == TokenType::Fun);
        assert!(tokens[5].token_type == TokenType::Identifier);
        assert!(tokens[5].lexeme == "fun1");
        assert!(tokens[6].token_type == TokenType::Identifier);
        assert!(tokens[7].token_type == TokenType::TestCase);
        assert!(tokens[8].token_type == TokenType::Eof);
    }

    #[test]
    fn test_rescan_after_reset_is_identical() {
        let text = "var a = 1.5; /* block */ a += 2; // tail\nprint(\"hi\");";
        let mut scanner = Scanner::new();
        let first = scanner.scan(text).unwrap();
        scanner.reset();
        let second = scanner.scan(text).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_int_and_float_flavours() {
        let tokens = Scanner::new().scan("12 12.0 3.25").unwrap();
        assert_eq!(tokens[0].token_type, TokenType::Int);
        assert_eq!(tokens[1].token_type, TokenType::Float);
        assert_eq!(tokens[0].literal, Literal::Number(12.0));
        assert_eq!(tokens[1].literal, Literal::Number(12.0));
        assert_eq!(tokens[2].literal, Literal::Number(3.25));
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            types("<= >= == != += -= *= /= %= < > = !"),
            vec![
                TokenType::LessEqual,
                TokenType::GreaterEqual,
                TokenType::EqualEqual,
                TokenType::BangEqual,
                TokenType::PlusEqual,
                TokenType::MinusEqual,
                TokenType::StarEqual,
                TokenType::SlashEqual,
                TokenType::PercentEqual,
                TokenType::Less,
                TokenType::Greater,
                TokenType::Equal,
                TokenType::Bang,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_string_unescape() {
        let tokens = Scanner::new().scan(r#""a\tb\n\"c\"""#).unwrap();
        assert_eq!(tokens[0].literal, Literal::String("a\tb\n\"c\"".to_string()));
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = Scanner::new().scan("var a = \"oops").unwrap_err();
        assert!(err.message.contains("Unterminated"));
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 9);
    }

    #[test]
    fn test_unexpected_character_aborts() {
        let err = Scanner::new().scan("var a = 1;\n  $").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 3);
    }

    #[test]
    fn test_block_comment_closes_on_first_pair() {
        assert_eq!(types("/* a * b / c **/ x"), vec![TokenType::Identifier, TokenType::Eof]);
        assert_eq!(
            types("/* outer /* inner */ y */"),
            vec![TokenType::Identifier, TokenType::Star, TokenType::Slash, TokenType::Eof]
        );
    }

    #[test]
    fn test_line_and_column_tracking() {
        let tokens = Scanner::new().scan("a\n  bb").unwrap();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }
}
