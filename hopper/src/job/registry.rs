use std::{collections::HashMap, sync::Arc};

use serde::de::DeserializeOwned;

use crate::executor::Executor;

use super::runner::{ErasedRunner, JobRunner};

/// Maps job type names to the runner of their executor.
#[derive(Clone, Default)]
pub(crate) struct JobRegistry {
    runners: HashMap<&'static str, Arc<dyn ErasedRunner>>,
}

impl JobRegistry {
    pub(crate) fn register<E>(&mut self)
    where
        E: Executor + 'static,
        E::Data: DeserializeOwned + Send + 'static,
    {
        let replaced = self
            .runners
            .insert(E::NAME, Arc::new(JobRunner::<E>::new()));
        if replaced.is_some() {
            tracing::warn!(job_type = E::NAME, "Executor {} registered twice", E::NAME);
        }
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<Arc<dyn ErasedRunner>> {
        self.runners.get(job_type).cloned()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
