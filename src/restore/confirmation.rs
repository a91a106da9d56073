use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

/// Asks the operator before a destructive step.
#[async_trait]
pub trait Confirmer: Send + Sync + std::fmt::Debug {
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Interactive y/N prompt on the terminal. Anything but `y`/`yes` declines,
/// including end of input.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, prompt: &str) -> bool {
        let mut stderr = tokio::io::stderr();
        let question = format!("{prompt} [y/N]: ");
        if stderr.write_all(question.as_bytes()).await.is_err() {
            return false;
        }
        let _ = stderr.flush().await;

        let mut reader = BufReader::new(tokio::io::stdin());
        let mut answer = String::new();
        match reader.read_line(&mut answer).await {
            Ok(_) => is_yes(&answer),
            Err(e) => {
                debug!("Could not read confirmation: {}", e);
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Fixed answer, counting how often it was asked.
#[derive(Debug, Default)]
pub struct FixedConfirmer {
    answer: bool,
    asked: AtomicUsize,
}

impl FixedConfirmer {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: AtomicUsize::new(0),
        }
    }

    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Confirmer for FixedConfirmer {
    async fn confirm(&self, prompt: &str) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        debug!("{} -> {}", prompt, if self.answer { "yes" } else { "no" });
        self.answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_explicit_yes_confirms() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }

    #[tokio::test]
    async fn test_fixed_confirmer_counts_prompts() {
        let confirmer = FixedConfirmer::new(false);
        assert!(!confirmer.confirm("Overwrite?").await);
        assert!(!confirmer.confirm("Overwrite?").await);
        assert_eq!(confirmer.times_asked(), 2);
    }
}
