//! Repair of pods that already went through the webhook.
//!
//! With `reinvocationPolicy: IfNeeded` the API server calls the webhook again
//! after later webhooks added containers. Only containers missing a
//! capability marker are touched, so a second pass over the same pod is a
//! no-op.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use crate::config::CapabilityName;
use crate::dynakube::DynaKube;

use super::{
    CONTAINERS_COUNT_ENV, INSTALL_CONTAINER_NAME, PodMutator, ReinvocationRequest, containers,
    env_value, env_var, pod_spec_mut,
};

#[derive(Debug, Default, PartialEq)]
pub struct Reinvocation {
    /// `(container index, capability)` for every repair that changed the pod.
    pub repaired: Vec<(usize, CapabilityName)>,
}

impl Reinvocation {
    pub fn updated(&self) -> bool {
        !self.repaired.is_empty()
    }

    pub fn capabilities(&self) -> Vec<CapabilityName> {
        let mut names = Vec::new();
        for (_, name) in &self.repaired {
            if !names.contains(name) {
                names.push(*name);
            }
        }
        names
    }
}

pub fn reinvoke(mutators: &[Arc<dyn PodMutator>], pod: &mut Pod, dynakube: &DynaKube) -> Reinvocation {
    let active: Vec<&Arc<dyn PodMutator>> = mutators
        .iter()
        .filter(|m| m.enabled(pod) && m.injected(pod))
        .collect();

    let mut result = Reinvocation::default();
    // Located on first use only.
    let mut install_container: Option<Option<usize>> = None;

    for index in 0..containers(pod).len() {
        for mutator in &active {
            if mutator.container_injected(&containers(pod)[index]) {
                continue;
            }

            let init_index = *install_container.get_or_insert_with(|| find_install_container(pod));
            info!(
                mutator = %mutator.name(),
                container = %containers(pod)[index].name,
                install_container_found = init_index.is_some(),
                "instrumenting missing container"
            );

            let mut request = ReinvocationRequest::new(pod, dynakube, index, init_index);
            if mutator.reinvoke(&mut request) {
                result.repaired.push((index, mutator.name()));
            }
        }
    }

    if result.updated() {
        if let Some(Some(init_index)) = install_container {
            update_containers_count(pod, init_index);
        }
    }

    result
}

fn find_install_container(pod: &Pod) -> Option<usize> {
    pod.spec
        .as_ref()?
        .init_containers
        .as_ref()?
        .iter()
        .position(|c| c.name == INSTALL_CONTAINER_NAME)
}

fn update_containers_count(pod: &mut Pod, init_index: usize) {
    let count = containers(pod).len().to_string();
    let spec = pod_spec_mut(pod);
    let Some(init) = spec
        .init_containers
        .as_mut()
        .and_then(|ics| ics.get_mut(init_index))
    else {
        return;
    };
    if env_value(init, CONTAINERS_COUNT_ENV) == Some(count.as_str()) {
        return;
    }

    let env = init.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == CONTAINERS_COUNT_ENV) {
        Some(existing) => {
            existing.value = Some(count);
            existing.value_from = None;
        }
        None => env.push(env_var(CONTAINERS_COUNT_ENV, count)),
    }
}
