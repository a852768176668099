use relay_provider::Vendor;
use tiktoken_rs::CoreBPE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    O200k,
    Cl100k,
}

/// BPE encoding for an OpenAI model, or `None` for models that are not
/// counted with a local tokenizer.
pub fn encoding_for(vendor: Vendor, model: &str) -> Option<Encoding> {
    if vendor != Vendor::OpenAi {
        return None;
    }
    let model = model.to_lowercase();
    let o200k = ["gpt-4o", "gpt-4.1", "gpt-5", "chatgpt-4o"]
        .iter()
        .any(|prefix| model.starts_with(prefix))
        || (model.starts_with('o') && model[1..].starts_with(|c: char| c.is_ascii_digit()));
    Some(if o200k {
        Encoding::O200k
    } else {
        Encoding::Cl100k
    })
}

/// Rough count used when no tokenizer applies: one token per four chars.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Counts tokens for one provider/model. Holds a loaded tokenizer until
/// [`TokenCounter::dispose`] or drop.
pub struct TokenCounter {
    encoding: Option<Encoding>,
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    pub fn for_model(vendor: Vendor, model: &str) -> Self {
        let encoding = encoding_for(vendor, model);
        let bpe = encoding.and_then(|encoding| {
            let loaded = match encoding {
                Encoding::O200k => tiktoken_rs::o200k_base(),
                Encoding::Cl100k => tiktoken_rs::cl100k_base(),
            };
            match loaded {
                Ok(bpe) => Some(bpe),
                Err(error) => {
                    tracing::warn!(%error, model, "tokenizer unavailable, estimating");
                    None
                }
            }
        });
        Self { encoding, bpe }
    }

    /// Estimating counter that never loads a tokenizer.
    pub fn estimating() -> Self {
        Self {
            encoding: None,
            bpe: None,
        }
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    pub fn is_exact(&self) -> bool {
        self.bpe.is_some()
    }

    pub fn count(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => estimate_tokens(text),
        }
    }

    /// Releases the tokenizer. Later counts fall back to the estimate.
    pub fn dispose(&mut self) {
        if self.bpe.take().is_some() {
            tracing::trace!("token counter disposed");
        }
    }
}

impl Drop for TokenCounter {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoding", &self.encoding)
            .field("exact", &self.is_exact())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_selection() {
        assert_eq!(encoding_for(Vendor::OpenAi, "gpt-4o-mini"), Some(Encoding::O200k));
        assert_eq!(encoding_for(Vendor::OpenAi, "o3-mini"), Some(Encoding::O200k));
        assert_eq!(encoding_for(Vendor::OpenAi, "gpt-4.1"), Some(Encoding::O200k));
        assert_eq!(encoding_for(Vendor::OpenAi, "gpt-4-turbo"), Some(Encoding::Cl100k));
        assert_eq!(encoding_for(Vendor::OpenAi, "openai-custom"), Some(Encoding::Cl100k));
        assert_eq!(encoding_for(Vendor::Anthropic, "claude-sonnet-4"), None);
    }

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("abcdefghi"), 3);
    }

    #[test]
    fn test_non_openai_counter_estimates() {
        let counter = TokenCounter::for_model(Vendor::Gemini, "gemini-2.5-flash");
        assert!(!counter.is_exact());
        assert_eq!(counter.count("twelve chars"), 3);
    }

    #[test]
    fn test_openai_counter_is_exact() {
        let counter = TokenCounter::for_model(Vendor::OpenAi, "gpt-4o");
        assert!(counter.is_exact());
        let n = counter.count("hello world");
        assert!(n >= 1 && n <= 3, "got {n}");
    }

    #[test]
    fn test_dispose_falls_back_to_estimate() {
        let mut counter = TokenCounter::for_model(Vendor::OpenAi, "gpt-4o");
        counter.dispose();
        assert!(!counter.is_exact());
        assert_eq!(counter.count("abcdefgh"), 2);
        counter.dispose();
    }
}
