mod assembly;
mod embedded;
mod header;

pub use assembly::{AssemblyState, AssemblyStep, HeaderOutcome, InboundAssembly};
pub use embedded::encode_file_message;
pub(crate) use embedded::decode_file_message;
pub use header::{FileHeader, FileKind, ImageMessage, data_frame};
