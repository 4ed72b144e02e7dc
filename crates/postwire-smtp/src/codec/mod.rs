//! Body transfer codecs and ESMTP parameter encodings.
//!
//! - [`dot`]: `DATA` bodies terminated by `<CRLF>.<CRLF>`
//! - [`chunk`]: `BDAT` bodies framed by explicit lengths
//! - [`xtext`]: xtext and unitext parameter values

pub mod chunk;
pub mod dot;
pub mod xtext;

pub use chunk::{
    BufferedChunkWriter, ChunkReader, ChunkSink, ChunkWriter, NextCommand, parse_bdat_args,
};
pub use dot::{DotReader, DotWriter};
