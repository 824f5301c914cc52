//! Exchange the volumes behind two claims

use super::rename::Rebind;
use super::Workflow;
use crate::error::{Error, Result};
use tracing::info;

impl Workflow {
    /// Bind claim `first` to the volume of `second` and vice versa
    pub async fn swap(&self, namespace: &str, first: &str, second: &str, force: bool) -> Result<()> {
        if first == second {
            return Err(Error::invalid("cannot swap a claim with itself"));
        }

        let a = self.bound_claim(namespace, first).await?;
        let b = self.bound_claim(namespace, second).await?;
        if a.volume_name() == b.volume_name() {
            return Err(Error::Conflict(format!(
                "{} and {} share volume {}",
                first,
                second,
                a.volume_name()
            )));
        }

        let guard = self.drain(namespace, &[first, second], force).await?;

        let result = self
            .rebind(
                namespace,
                &[
                    Rebind {
                        from: &a,
                        name: first,
                        volume: &b.volume,
                    },
                    Rebind {
                        from: &b,
                        name: second,
                        volume: &a.volume,
                    },
                ],
            )
            .await;

        if let Some(guard) = guard {
            guard.release().await;
        }

        result?;
        info!(
            "Swapped volumes of {}/{} ({}) and {}/{} ({})",
            namespace,
            first,
            b.volume_name(),
            namespace,
            second,
            a.volume_name()
        );
        Ok(())
    }
}
