//! The front half of the pipeline: lexing source into tokens,
//! reading tokens into `Form`s, analyzing forms into `Node`s,
//! and compiling nodes into bytecode prototypes.

pub mod analyze;
pub mod destructure;
pub mod gen;
pub mod lex;
pub mod read;
pub mod token;

pub use analyze::Analyzer;
pub use lex::Lexer;
pub use read::Reader;
