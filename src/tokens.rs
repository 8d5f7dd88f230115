//! Token accounting.
//!
//! Counts are produced by tiktoken BPE vocabularies and are deterministic:
//! identical inputs always yield identical counts. Message counting adds a
//! fixed per-message framing overhead so that windowing stays safe even when
//! the provider's own framing differs slightly.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

/// Vocabulary family used for counting. Resolved from the deployment name;
/// unknown names fall back to cl100k, which over-counts slightly for newer
/// vocabularies and therefore keeps windowing safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Cl100k,
    O200k,
}

impl ModelFamily {
    /// Map a provider deployment name to its vocabulary family.
    pub fn for_model(model: &str) -> ModelFamily {
        let m = model.to_lowercase();
        if m.contains("gpt-4o") || m.starts_with("o1") || m.starts_with("o3") {
            ModelFamily::O200k
        } else {
            ModelFamily::Cl100k
        }
    }
}

static CL100K: OnceLock<CoreBPE> = OnceLock::new();
static O200K: OnceLock<CoreBPE> = OnceLock::new();

fn bpe(family: ModelFamily) -> &'static CoreBPE {
    match family {
        ModelFamily::Cl100k => CL100K.get_or_init(|| {
            tiktoken_rs::cl100k_base().expect("embedded cl100k vocabulary loads")
        }),
        ModelFamily::O200k => O200K.get_or_init(|| {
            tiktoken_rs::o200k_base().expect("embedded o200k vocabulary loads")
        }),
    }
}

/// Count tokens for a plain string.
pub fn count(text: &str, family: ModelFamily) -> usize {
    if text.is_empty() {
        return 0;
    }
    bpe(family).encode_with_special_tokens(text).len()
}

/// Count tokens for one message, including framing overhead.
pub fn count_message(content: &str, family: ModelFamily, overhead: usize) -> usize {
    count(content, family) + overhead
}

/// Count tokens for a message list, including per-message framing overhead.
pub fn count_messages<'a, I>(contents: I, family: ModelFamily, overhead: usize) -> usize
where
    I: IntoIterator<Item = &'a str>,
{
    contents
        .into_iter()
        .map(|c| count_message(c, family, overhead))
        .sum()
}
