//! Owned set of connected instruments.
//!
//! An [`InstrumentSet`] pairs one backend with at most one handle per role.
//! It is moved into the session when a sweep starts and disconnected when the
//! sweep ends, so no connection state outlives the session.

use liv_core::capabilities::{InstrumentBackend, InstrumentHandle, InstrumentRole};
use liv_core::config::MeasurementKind;
use liv_core::error::{LivError, LivResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct InstrumentSet {
    backend: Arc<dyn InstrumentBackend>,
    handles: BTreeMap<InstrumentRole, InstrumentHandle>,
}

impl InstrumentSet {
    /// Empty set bound to `backend`.
    pub fn new(backend: Arc<dyn InstrumentBackend>) -> Self {
        Self {
            backend,
            handles: BTreeMap::new(),
        }
    }

    /// Connect every `(role, address)` pair.
    ///
    /// If any connection fails, the handles opened so far are disconnected
    /// before the error is returned.
    pub async fn connect<I, S>(backend: Arc<dyn InstrumentBackend>, addresses: I) -> LivResult<Self>
    where
        I: IntoIterator<Item = (InstrumentRole, S)>,
        S: AsRef<str>,
    {
        let mut set = Self::new(backend);
        for (role, address) in addresses {
            if let Err(e) = set.connect_role(role, address.as_ref()).await {
                set.disconnect_all().await;
                return Err(e);
            }
        }
        Ok(set)
    }

    /// Connect one instrument, replacing any handle already held for `role`.
    pub async fn connect_role(&mut self, role: InstrumentRole, identifier: &str) -> LivResult<()> {
        let handle = self.backend.connect(role, identifier).await?;
        info!(%role, identifier, id = handle.id(), "instrument connected");
        if let Some(previous) = self.handles.insert(role, handle) {
            if let Err(e) = self.backend.disconnect(&previous).await {
                warn!(%role, error = %e, "failed to release replaced instrument");
            }
        }
        Ok(())
    }

    pub fn backend(&self) -> &Arc<dyn InstrumentBackend> {
        &self.backend
    }

    pub fn get(&self, role: InstrumentRole) -> Option<&InstrumentHandle> {
        self.handles.get(&role)
    }

    pub fn roles(&self) -> impl Iterator<Item = InstrumentRole> + '_ {
        self.handles.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Fail with `MissingInstrument` unless every channel `kind` needs is present.
    pub fn check_coverage(&self, kind: MeasurementKind) -> LivResult<()> {
        match kind
            .required_roles()
            .iter()
            .find(|role| !self.handles.contains_key(role))
        {
            Some(role) => Err(LivError::MissingInstrument { role: *role, kind }),
            None => Ok(()),
        }
    }

    /// Disconnect every handle. Failures are logged and do not stop the others.
    ///
    /// Returns the number of handles that failed to disconnect cleanly.
    pub async fn disconnect_all(&mut self) -> usize {
        let mut failures = 0;
        let handles = std::mem::take(&mut self.handles);
        for (role, handle) in handles {
            if let Err(e) = self.backend.disconnect(&handle).await {
                warn!(%role, error = %e, "failed to disconnect instrument");
                failures += 1;
            }
        }
        failures
    }
}

impl std::fmt::Debug for InstrumentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentSet")
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liv_driver_mock::MockBackend;

    #[tokio::test]
    async fn coverage_reports_first_missing_role() {
        let backend = Arc::new(MockBackend::new());
        let set = InstrumentSet::connect(
            backend,
            [
                (InstrumentRole::Source, "GPIB0::1::INSTR"),
                (InstrumentRole::Voltmeter, "GPIB0::5::INSTR"),
            ],
        )
        .await
        .unwrap();

        assert!(set.check_coverage(MeasurementKind::Li).is_err());
        match set.check_coverage(MeasurementKind::Iv) {
            Err(LivError::MissingInstrument { role, kind }) => {
                assert_eq!(role, InstrumentRole::Ammeter);
                assert_eq!(kind, MeasurementKind::Iv);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_connect_releases_earlier_handles() {
        let mock = Arc::new(MockBackend::builder().unreachable("USB0::scope").build());
        let result = InstrumentSet::connect(
            mock.clone(),
            [
                (InstrumentRole::Source, "GPIB0::1::INSTR"),
                (InstrumentRole::OpticalPowerMeter, "USB0::scope"),
            ],
        )
        .await;

        assert!(matches!(result, Err(LivError::Connection { .. })));
        assert_eq!(mock.connected_count(), 0);
    }

    #[tokio::test]
    async fn reconnecting_a_role_replaces_the_handle() {
        let mock = Arc::new(MockBackend::new());
        let mut set = InstrumentSet::new(mock.clone());
        set.connect_role(InstrumentRole::Source, "a").await.unwrap();
        set.connect_role(InstrumentRole::Source, "b").await.unwrap();

        assert_eq!(set.len(), 1);
        assert_eq!(set.get(InstrumentRole::Source).unwrap().identifier(), "b");
        assert_eq!(mock.connected_count(), 1);

        assert_eq!(set.disconnect_all().await, 0);
        assert!(set.is_empty());
        assert_eq!(mock.connected_count(), 0);
    }
}
