mod parser;
mod paths;
mod pipeline;
mod source;
mod types;

pub use parser::{
    ClaudeParser, CodexParser, LineContext, ParsedLine, ParsedLines, Parser, StreamParser,
    UNKNOWN_MODEL, parse, parser_for,
};
pub use paths::{SourceRoot, default_source_roots, detect_format};
pub use pipeline::{Backfill, backfill};
pub use source::{DEFAULT_MAX_BATCH_BYTES, FileSource, SourceWatch, UsageSource};
pub use types::{
    BackfillStats, IngestError, IngestIssue, ParseError, ParseErrorKind, PartialLine, ReadBatch,
    Result, SourceHandle, SourceInfo,
};
