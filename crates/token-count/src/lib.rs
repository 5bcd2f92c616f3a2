//! Local token-count approximation
//!
//! The cloud runtime has no token-counting endpoint, so counts for its
//! credentials are estimated locally: the request is flattened to text and
//! run through a BPE tokenizer. Results are cached by content hash and
//! concurrent identical requests share one tokenizer run.
//!
//! The count is an approximation; it need not match the upstream's own.

mod approximator;
mod error;
mod request;
mod tokenizer;

pub use approximator::{TokenCountApproximator, TokenCountSettings};
pub use error::{Error, Result};
pub use request::{ContentBlock, CountTokensRequest, Message, MessageContent, serialize_request};
pub use tokenizer::{TiktokenTokenizer, Tokenizer};
