use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, error};

use crate::config::CapabilityName;
use crate::error::Error;

use super::{INSTALLER_ENV_NAMES, INSTALLER_VOLUME_NAMES, MutationRequest, PodMutator};

const INSTALLER_OWNER: &str = "installer";

/// Tracks which component owns each env var and volume name.
#[derive(Debug, Default)]
struct NameRegistry {
    env_vars: HashMap<&'static str, &'static str>,
    volumes: HashMap<&'static str, &'static str>,
}

impl NameRegistry {
    fn claim(
        names: &mut HashMap<&'static str, &'static str>,
        owner: &'static str,
        claimed: &'static [&'static str],
    ) -> Result<(), Error> {
        for &name in claimed {
            if let Some(&first) = names.get(name) {
                return Err(Error::NameCollision {
                    name,
                    first,
                    second: owner,
                });
            }
            names.insert(name, owner);
        }
        Ok(())
    }

    fn register(
        &mut self,
        owner: &'static str,
        env_vars: &'static [&'static str],
        volumes: &'static [&'static str],
    ) -> Result<(), Error> {
        Self::claim(&mut self.env_vars, owner, env_vars)?;
        Self::claim(&mut self.volumes, owner, volumes)
    }
}

/// The ordered set of capability mutators.
///
/// Registration order is part of the contract: a later mutator may look at
/// what an earlier one wrote (data ingest only adds the deployment metadata
/// when the agent mutator has not), so reordering changes the output.
pub struct MutationPipeline {
    mutators: Vec<Arc<dyn PodMutator>>,
}

impl MutationPipeline {
    /// Builds the pipeline, refusing mutators whose env var or volume names
    /// overlap with each other or with the install container's.
    pub fn new(mutators: Vec<Arc<dyn PodMutator>>) -> Result<Self, Error> {
        let mut registry = NameRegistry::default();
        registry.register(INSTALLER_OWNER, INSTALLER_ENV_NAMES, INSTALLER_VOLUME_NAMES)?;
        for mutator in &mutators {
            registry.register(
                mutator.name().as_str(),
                mutator.env_var_names(),
                mutator.volume_names(),
            )?;
        }
        Ok(Self { mutators })
    }

    pub fn mutators(&self) -> &[Arc<dyn PodMutator>] {
        &self.mutators
    }

    pub fn any_enabled(&self, pod: &Pod) -> bool {
        self.mutators.iter().any(|m| m.enabled(pod))
    }

    /// Runs every enabled mutator in order. The first failure aborts the run
    /// and leaves the pod partially mutated; callers must discard it.
    pub async fn mutate(
        &self,
        request: &mut MutationRequest<'_>,
    ) -> Result<Vec<CapabilityName>, Error> {
        let mut applied = Vec::new();
        for mutator in &self.mutators {
            let name = mutator.name();
            if !mutator.enabled(request.pod) {
                debug!(mutator = %name, "mutator disabled for pod, skipping");
                continue;
            }
            if let Err(e) = mutator.mutate(request).await {
                error!(mutator = %name, "mutation failed: {e}");
                return Err(e);
            }
            applied.push(name);
        }
        Ok(applied)
    }
}
