//! Tokenizer seam

/// Counts tokens in flat text. Runs on a blocking thread.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `cl100k_base` BPE from tiktoken.
///
/// The encoder is loaded lazily on first use (a few hundred milliseconds);
/// call `preload` at startup to keep that off the request path.
#[derive(Debug, Default, Clone, Copy)]
pub struct TiktokenTokenizer;

impl TiktokenTokenizer {
    pub fn preload() {
        let _ = tiktoken_rs::cl100k_base_singleton();
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn count(&self, text: &str) -> usize {
        tiktoken_rs::cl100k_base_singleton()
            .encode_with_special_tokens(text)
            .len()
    }
}
