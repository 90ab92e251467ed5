//! Byte-stream framing: the decoder contract, three framing strategies, and
//! the buffered reader that drives them.

pub mod begin_end_mark;
pub mod decoder;
pub mod fixed_header;
pub mod fixed_size;
pub mod reader;

pub use begin_end_mark::BeginEndMarkDecoder;
pub use decoder::{BodyBuilder, DecodeError, DecodeOutcome, PackageDecoder};
pub use fixed_header::{Endian, FixedHeaderDecoder, LengthWidth};
pub use fixed_size::FixedSizeDecoder;
pub use reader::{FramingError, PackageReader, DEFAULT_MAX_PACKAGE_LENGTH};
