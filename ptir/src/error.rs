use thiserror::Error;

/// A lexer or parser failure. Carries a byte offset into the source so the CLI can point at the
/// offending text; reported through the same single-line-diagnostic convention as compile errors.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{pos}: unexpected character {ch:?}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("{pos}: unterminated string literal")]
    UnterminatedString { pos: usize },

    #[error("{pos}: invalid integer literal {text:?}")]
    InvalidInt { pos: usize, text: String },

    #[error("{pos}: expected {expected}, found {found}")]
    Expected { pos: usize, expected: String, found: String },

    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String },
}
