//! Prompt sources: prompt files and random story openers.

use std::path::Path;

use llama_engine::{LlamaEngine, TokenId};
use llama_sampling::SeededRng;

use crate::error::ConfigError;

/// Openers used when no prompt list is given.
const OPENERS: [&str; 10] = [
    "So",
    "Once upon a time",
    "When",
    "The",
    "After",
    "If",
    "import",
    "He",
    "She",
    "They",
];

/// A prompt and its tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub tokens: Vec<TokenId>,
}

impl Prompt {
    /// Tokenize `text` with the engine.
    pub fn tokenize(
        engine: &dyn LlamaEngine,
        text: impl Into<String>,
        add_bos: bool,
    ) -> llama_engine::Result<Self> {
        let text = text.into();
        let tokens = engine.tokenize(&text, add_bos)?;
        Ok(Self { text, tokens })
    }

    /// A prompt from already tokenized input.
    pub fn from_tokens(tokens: Vec<TokenId>) -> Self {
        Self {
            text: String::new(),
            tokens,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Read one prompt per line.
///
/// Blank lines are kept as empty prompts; a trailing newline does not add one.
pub fn load_prompt_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(data
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect())
}

/// `count` prompts drawn from a fixed list of openers.
pub fn random_prompts(seed: u64, count: usize) -> Vec<String> {
    let mut rng = SeededRng::new(seed);
    (0..count)
        .map(|_| {
            let idx = (rng.next_u64() % OPENERS.len() as u64) as usize;
            OPENERS[idx].to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn random_prompts_are_reproducible_openers() {
        let a = random_prompts(7, 100);
        let b = random_prompts(7, 100);
        assert_eq!(a.len(), 100);
        assert_eq!(a, b);
        assert!(a.iter().all(|p| OPENERS.contains(&p.as_str())));
    }

    #[test]
    fn random_prompts_vary_across_draws() {
        let prompts = random_prompts(99, 50);
        let first = &prompts[0];
        assert!(prompts.iter().any(|p| p != first));
    }

    #[test]
    fn prompt_file_keeps_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "hello world\n\nfoo\r\nbar\n").unwrap();

        let prompts = load_prompt_file(file.path()).unwrap();
        assert_eq!(prompts, vec!["hello world", "", "foo", "bar"]);
    }

    #[test]
    fn missing_prompt_file_reports_path() {
        let err = load_prompt_file(Path::new("/nonexistent/prompts.txt")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/prompts.txt"));
    }

    #[test]
    fn prompt_from_tokens() {
        let prompt = Prompt::from_tokens(vec![1, 2, 3]);
        assert_eq!(prompt.len(), 3);
        assert!(!prompt.is_empty());
        assert!(Prompt::from_tokens(Vec::new()).is_empty());
    }
}
