// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Work a session must do on its way out.

use futures::future::BoxFuture;
use slog::{info, warn, Logger};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunOn {
    /// Whatever the outcome.
    Always,
    /// Only if the session failed.
    Failure,
}

type Action =
    Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Finalizer {
    desc: String,
    when: RunOn,
    action: Action,
}

/// Registered cleanup actions, run in reverse order of registration.
#[derive(Default)]
pub(crate) struct Finalizers {
    list: Vec<Finalizer>,
}

impl Finalizers {
    pub fn push<F>(&mut self, desc: impl Into<String>, when: RunOn, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + 'static,
    {
        self.list.push(Finalizer {
            desc: desc.into(),
            when,
            action: Box::new(action),
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Runs every applicable action. A failing action does not stop the
    /// ones registered before it; its error comes back as a warning.
    pub async fn run(self, log: &Logger, succeeded: bool) -> Vec<String> {
        let mut warnings = Vec::new();
        for f in self.list.into_iter().rev() {
            if f.when == RunOn::Failure && succeeded {
                continue;
            }
            info!(log, "running cleanup"; "action" => &f.desc);
            if let Err(e) = (f.action)().await {
                warn!(log, "cleanup failed";
                    "action" => &f.desc, "error" => %e);
                warnings.push(format!("{}: {:#}", f.desc, e));
            }
        }
        warnings
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::FutureExt;
    use std::sync::{Arc, Mutex};

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn recorder(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        fail: bool,
    ) -> impl FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send {
        let log = log.clone();
        move || {
            async move {
                log.lock().unwrap().push(name);
                if fail {
                    anyhow::bail!("{name} broke");
                }
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn runs_in_reverse_and_skips_failure_only_on_success() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut f = Finalizers::default();
        f.push("first", RunOn::Always, recorder(&ran, "first", false));
        f.push("revert", RunOn::Failure, recorder(&ran, "revert", false));
        f.push("last", RunOn::Always, recorder(&ran, "last", false));
        assert_eq!(f.len(), 3);

        let warnings = f.run(&test_logger(), true).await;
        assert!(warnings.is_empty());
        assert_eq!(*ran.lock().unwrap(), ["last", "first"]);
    }

    #[tokio::test]
    async fn failing_action_does_not_stop_the_rest() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut f = Finalizers::default();
        f.push("restart", RunOn::Always, recorder(&ran, "restart", false));
        f.push("revert", RunOn::Failure, recorder(&ran, "revert", true));

        let warnings = f.run(&test_logger(), false).await;
        assert_eq!(*ran.lock().unwrap(), ["revert", "restart"]);
        assert_eq!(warnings, ["revert: revert broke"]);
    }
}
