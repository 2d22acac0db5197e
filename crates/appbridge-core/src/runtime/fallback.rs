//! Fallback from the secondary surface to the primary one.

use std::future::Future;
use std::io::IsTerminal;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use super::{FallbackPolicy, RuntimeOptions, Surface};
use crate::error::{BridgeError, Result};

const NON_INTERACTIVE_HINT: &str = "Secondary runtime failed and no terminal is attached to confirm a fallback. \
Pass --runtime-fallback primary to retry on the host, or --runtime-fallback none to fail immediately.";

/// Operator confirmation channel.
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Whether a human can answer right now.
    fn is_interactive(&self) -> bool;

    /// Ask a yes/no question. Anything but `y`/`yes` is a no.
    async fn confirm(&self, question: &str) -> Result<bool>;
}

/// Prompts on the process's own terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompter;

#[async_trait]
impl Prompter for TerminalPrompter {
    fn is_interactive(&self) -> bool {
        std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
    }

    async fn confirm(&self, question: &str) -> Result<bool> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(question.as_bytes()).await?;
        stdout.flush().await?;

        let mut answer = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut answer)
            .await?;
        Ok(matches!(
            answer.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }
}

/// Run `op` on the resolved surface, applying the fallback policy if the
/// secondary surface fails.
///
/// Patch verification failures are never retried elsewhere.
pub async fn run_with_fallback<T, F, Fut>(
    runtime: &RuntimeOptions,
    prompter: &dyn Prompter,
    mut op: F,
) -> Result<T>
where
    F: FnMut(RuntimeOptions) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let err = match op(runtime.clone()).await {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if runtime.surface != Surface::Secondary || err.is_patch_verification() {
        return Err(err);
    }

    match runtime.fallback {
        FallbackPolicy::None => Err(err),
        FallbackPolicy::Primary => {
            warn!(reason = %err, "Secondary runtime failed. Falling back to primary runtime");
            op(runtime.with_surface(Surface::Primary)).await
        }
        FallbackPolicy::Prompt => {
            if !prompter.is_interactive() {
                return Err(BridgeError::SecondaryRuntime {
                    source: Box::new(err),
                    hint: Some(NON_INTERACTIVE_HINT.to_string()),
                });
            }

            let question =
                format!("Secondary runtime failed ({err}). Fall back to the primary runtime? [y/N] ");
            if prompter.confirm(&question).await? {
                warn!("Operator selected fallback to primary runtime");
                op(runtime.with_surface(Surface::Primary)).await
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::runtime::SecondaryOptions;

    struct Scripted {
        interactive: bool,
        answer: bool,
        asked: AtomicUsize,
    }

    impl Scripted {
        fn new(interactive: bool, answer: bool) -> Self {
            Self {
                interactive,
                answer,
                asked: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Prompter for Scripted {
        fn is_interactive(&self) -> bool {
            self.interactive
        }

        async fn confirm(&self, _question: &str) -> Result<bool> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer)
        }
    }

    fn runtime(fallback: FallbackPolicy) -> RuntimeOptions {
        RuntimeOptions {
            surface: Surface::Secondary,
            fallback,
            secondary: SecondaryOptions {
                distro: None,
                workdir: "~/w".to_string(),
                cli_path: None,
            },
        }
    }

    /// Fails on secondary, succeeds on primary; records every surface tried.
    async fn attempt(seen: &Mutex<Vec<Surface>>, runtime: RuntimeOptions) -> Result<&'static str> {
        seen.lock().unwrap().push(runtime.surface);
        match runtime.surface {
            Surface::Secondary => Err(BridgeError::Config("secondary broke".to_string())),
            Surface::Primary => Ok("primary ok"),
        }
    }

    #[tokio::test]
    async fn none_propagates_unchanged() {
        let seen = Mutex::new(Vec::new());
        let prompter = Scripted::new(true, true);
        let err = run_with_fallback(&runtime(FallbackPolicy::None), &prompter, |rt| {
            attempt(&seen, rt)
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "config");
        assert_eq!(*seen.lock().unwrap(), vec![Surface::Secondary]);
        assert_eq!(prompter.asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn primary_policy_retries_on_host() {
        let seen = Mutex::new(Vec::new());
        let prompter = Scripted::new(false, false);
        let value = run_with_fallback(&runtime(FallbackPolicy::Primary), &prompter, |rt| {
            attempt(&seen, rt)
        })
        .await
        .unwrap();

        assert_eq!(value, "primary ok");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Surface::Secondary, Surface::Primary]
        );
    }

    #[tokio::test]
    async fn prompt_without_terminal_adds_hint() {
        let seen = Mutex::new(Vec::new());
        let prompter = Scripted::new(false, true);
        let err = run_with_fallback(&runtime(FallbackPolicy::Prompt), &prompter, |rt| {
            attempt(&seen, rt)
        })
        .await
        .unwrap_err();

        assert_eq!(err.kind(), "secondary_runtime");
        assert!(err.to_string().contains("--runtime-fallback primary"));
        assert_eq!(prompter.asked.load(Ordering::SeqCst), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prompt_accept_and_decline() {
        let seen = Mutex::new(Vec::new());
        let yes = Scripted::new(true, true);
        let value = run_with_fallback(&runtime(FallbackPolicy::Prompt), &yes, |rt| {
            attempt(&seen, rt)
        })
        .await
        .unwrap();
        assert_eq!(value, "primary ok");
        assert_eq!(yes.asked.load(Ordering::SeqCst), 1);

        let seen = Mutex::new(Vec::new());
        let no = Scripted::new(true, false);
        let err = run_with_fallback(&runtime(FallbackPolicy::Prompt), &no, |rt| {
            attempt(&seen, rt)
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "config");
        assert_eq!(*seen.lock().unwrap(), vec![Surface::Secondary]);
    }

    #[tokio::test]
    async fn patch_verification_is_never_retried() {
        let calls = AtomicUsize::new(0);
        let prompter = Scripted::new(true, true);
        let err = run_with_fallback(&runtime(FallbackPolicy::Primary), &prompter, |_rt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(BridgeError::PatchVerification {
                    patch_id: "preload-process-bridge-v1".to_string(),
                    reason: "marker missing".to_string(),
                })
            }
        })
        .await
        .unwrap_err();

        assert!(err.is_patch_verification());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn primary_failures_are_not_retried() {
        let seen = Mutex::new(Vec::new());
        let prompter = Scripted::new(true, true);
        let mut rt = runtime(FallbackPolicy::Primary);
        rt.surface = Surface::Primary;
        let result = run_with_fallback(&rt, &prompter, |rt| attempt(&seen, rt)).await;
        assert!(result.is_ok());
        assert_eq!(*seen.lock().unwrap(), vec![Surface::Primary]);
    }
}
